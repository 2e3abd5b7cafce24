//! EndExecution: finish an execution that has no outgoing flow to take.
//!
//! A child hands control back to its parent: a sub-process scope completes
//! once its last active child has ended, any other parent continues from
//! the child's position. The root ends the process instance once no other
//! execution is active; otherwise it is parked until the last branch ends.

use tokenflow_types::process::{ListenerEvent, NodeKind};
use tokenflow_types::runtime::Execution;
use uuid::Uuid;

use crate::behavior;
use crate::context::CommandContext;
use crate::error::EngineError;
use crate::process::ProcessGraph;

pub(super) fn run(ctx: &mut CommandContext<'_>, execution_id: Uuid) -> Result<(), EngineError> {
    let execution = ctx.state().execution(execution_id)?.clone();
    match execution.parent_id {
        Some(parent_id) => end_child(ctx, &execution, parent_id),
        None => end_root(ctx, execution_id),
    }
}

fn end_child(
    ctx: &mut CommandContext<'_>,
    execution: &Execution,
    parent_id: Uuid,
) -> Result<(), EngineError> {
    let execution_id = execution.id;
    {
        let state = ctx.state_mut();
        let ended = state.execution_mut(execution_id)?;
        ended.is_ended = true;
        ended.is_active = false;
        state.delete_execution_data(execution_id);
        state.set_active(parent_id, true)?;
    }

    let parent = ctx.state().execution(parent_id)?.clone();
    if is_sub_process_scope(ctx, &parent)? {
        ctx.state_mut().delete_subtree(execution_id)?;
        if remaining_children(ctx, &parent)? == 0 {
            return complete_sub_process(ctx, parent_id);
        }
        return Ok(());
    }

    ctx.state_mut()
        .set_current_flow_element(parent_id, execution.current_flow_element_id.as_deref())?;
    ctx.state_mut().delete_subtree(execution_id)?;
    ctx.agenda_mut()
        .plan_take_outgoing_sequence_flows(parent_id, true);
    Ok(())
}

fn end_root(ctx: &mut CommandContext<'_>, root_id: Uuid) -> Result<(), EngineError> {
    {
        let state = ctx.state_mut();
        state.delete_tasks_for_execution(root_id);
        state.delete_jobs_for_execution(root_id);
        state.delete_subscriptions_for_execution(root_id);
    }

    let graph = ctx.graph_for(root_id)?;
    let active = ctx.state().active_execution_count(Some(root_id));
    let joins_pending = waiting_on_inactive_behavior(ctx, &graph);
    if active > 0 || joins_pending > 0 {
        ctx.state_mut().set_active(root_id, false)?;
        tracing::debug!(process_instance_id = %root_id, active, joins_pending, "root parked until remaining branches end");
        return Ok(());
    }

    let definition = graph.definition();
    ctx.fire_listeners(&definition.listeners, ListenerEvent::End, root_id, &definition.key)?;

    let state = ctx.state_mut();
    state.execution_mut(root_id)?.is_ended = true;
    state.delete_identity_links();
    let removed = state.delete_subtree(root_id)?;
    tracing::info!(process_instance_id = %root_id, removed, "process instance completed");
    Ok(())
}

/// Inactive executions parked on a join that re-checks them at the end of
/// the unit of work.
fn waiting_on_inactive_behavior(ctx: &CommandContext<'_>, graph: &ProcessGraph) -> usize {
    let joins = graph.nodes_with_inactive_behavior();
    ctx.state()
        .executions()
        .filter(|e| !e.is_active && !e.is_ended && !e.is_root())
        .filter(|e| {
            e.current_flow_element_id
                .as_ref()
                .is_some_and(|id| joins.contains(id))
        })
        .count()
}

/// A non-root, non-multi-instance scope positioned on a sub-process node.
fn is_sub_process_scope(ctx: &CommandContext<'_>, parent: &Execution) -> Result<bool, EngineError> {
    if parent.is_root() || !parent.is_scope || parent.is_multi_instance_root {
        return Ok(false);
    }
    Ok(matches!(
        ctx.current_node(parent.id)?.kind,
        NodeKind::SubProcess { .. }
    ))
}

/// Children of a scope that still carry work: active ones (ignoring boundary
/// event listeners attached to the scope itself), multi-instance roots and
/// ones parked on a join.
fn remaining_children(ctx: &CommandContext<'_>, scope: &Execution) -> Result<usize, EngineError> {
    let node = ctx.current_node(scope.id)?;
    let graph = ctx.graph_for(scope.id)?;
    let joins = graph.nodes_with_inactive_behavior();
    let state = ctx.state();
    Ok(state
        .children(scope.id)
        .into_iter()
        .filter_map(|id| state.find_execution(id))
        .filter(|child| !child.is_ended)
        .filter(|child| {
            let position = child.current_flow_element_id.as_ref();
            if child.is_multi_instance_root {
                true
            } else if child.is_active {
                !position.is_some_and(|id| node.boundary_events.contains(id))
            } else {
                position.is_some_and(|id| joins.contains(id))
            }
        })
        .count())
}

/// Replace a finished sub-process scope with a plain execution on the
/// sub-process node and leave the node through it.
fn complete_sub_process(
    ctx: &mut CommandContext<'_>,
    scope_id: Uuid,
) -> Result<(), EngineError> {
    let scope = ctx.state().execution(scope_id)?.clone();
    let parent_id = scope
        .parent_id
        .ok_or(EngineError::NoEnclosingScope(scope_id))?;

    let state = ctx.state_mut();
    let successor = state.create_child_execution(parent_id)?;
    let entry = state.execution_mut(successor)?;
    entry.current_flow_element_id = scope.current_flow_element_id.clone();
    entry.is_concurrent = scope.is_concurrent;
    state.delete_subtree(scope_id)?;

    tracing::debug!(%scope_id, %successor, "sub-process completed");
    behavior::leave(ctx, successor)
}

#[cfg(test)]
mod tests {
    use crate::context::EngineServices;
    use crate::test_support::{deploy, executions_at, new_instance, run_unit, start_instance};

    const PARALLEL_ENDS: &str = r#"
key: two-ends
nodes:
  - { id: start, type: start_event }
  - { id: fork, type: parallel_gateway }
  - { id: a, type: user_task }
  - { id: end_a, type: end_event }
  - { id: end_b, type: end_event }
flows:
  - { id: f0, source: start, target: fork }
  - { id: f1, source: fork, target: a }
  - { id: f2, source: fork, target: end_b }
  - { id: f3, source: a, target: end_a }
"#;

    const SUB_WITH_BRANCHES: &str = r#"
key: sub-complete
nodes:
  - { id: start, type: start_event }
  - id: sub
    type: sub_process
    nodes:
      - { id: s_start, type: start_event }
      - { id: s_fork, type: parallel_gateway }
      - { id: s_a, type: user_task }
      - { id: s_end_a, type: end_event }
      - { id: s_end_b, type: end_event }
    flows:
      - { id: s0, source: s_start, target: s_fork }
      - { id: s1, source: s_fork, target: s_a }
      - { id: s2, source: s_fork, target: s_end_b }
      - { id: s3, source: s_a, target: s_end_a }
  - { id: after, type: user_task }
flows:
  - { id: f0, source: start, target: sub }
  - { id: f1, source: sub, target: after }
"#;

    #[test]
    fn root_parks_while_a_branch_is_active() {
        let services = EngineServices::default();
        let graph = deploy(&services, PARALLEL_ENDS);
        let (state, _) = start_instance(&services, &graph).unwrap();

        let root = state.root().unwrap();
        assert!(!root.is_active);
        assert!(!root.is_ended);
        assert_eq!(executions_at(&state, "a").len(), 1);

        let task_execution = state.tasks().next().unwrap().execution_id;
        let (state, _) = run_unit(&services, state, |ctx| {
            ctx.agenda_mut()
                .plan_trigger_execution(task_execution, None, None);
            Ok(())
        })
        .unwrap();
        assert!(state.root().is_none());
        assert_eq!(state.execution_count(), 0);
    }

    #[test]
    fn sub_process_completes_after_last_child() {
        let services = EngineServices::default();
        let graph = deploy(&services, SUB_WITH_BRANCHES);
        let (state, _) = start_instance(&services, &graph).unwrap();
        assert_eq!(executions_at(&state, "sub").len(), 1);
        assert!(executions_at(&state, "after").is_empty());

        let inner = state.tasks().next().unwrap().execution_id;
        let (state, _) = run_unit(&services, state, |ctx| {
            ctx.agenda_mut().plan_trigger_execution(inner, None, None);
            Ok(())
        })
        .unwrap();
        assert!(executions_at(&state, "sub").is_empty());
        assert_eq!(executions_at(&state, "after").len(), 1);
        assert_eq!(state.execution_count(), 2);
    }

    #[test]
    fn ending_a_child_reactivates_its_parent() {
        let services = EngineServices::default();
        let graph = deploy(&services, SUB_WITH_BRANCHES);
        let (mut state, scope) = new_instance(&graph);
        let root = state.root().unwrap().id;
        state.set_current_flow_element(scope, Some("sub")).unwrap();
        {
            let scope = state.execution_mut(scope).unwrap();
            scope.is_scope = true;
            scope.is_active = false;
        }
        let busy = state.create_child_execution(scope).unwrap();
        state.set_current_flow_element(busy, Some("s_a")).unwrap();
        let done = state.create_child_execution(scope).unwrap();
        state.set_current_flow_element(done, Some("s_end_b")).unwrap();

        let (state, _) = run_unit(&services, state, |ctx| {
            ctx.agenda_mut().plan_end_execution(done);
            Ok(())
        })
        .unwrap();

        assert!(state.find_execution(done).is_none());
        assert!(state.execution(scope).unwrap().is_active);
        assert!(state.execution(busy).unwrap().is_active);
        assert!(state.execution(root).unwrap().is_active);
        assert_eq!(state.children(scope), vec![busy]);
        assert!(executions_at(&state, "after").is_empty());
    }
}
