//! Gateways: exclusive choice, parallel fork/join and inclusive fork/join.

use tokenflow_types::event::EngineEvent;
use tokenflow_types::process::ListenerEvent;
use uuid::Uuid;

use crate::context::CommandContext;
use crate::error::EngineError;

use super::{ActivityBehavior, InactiveActivityBehavior};

// ---------------------------------------------------------------------------
// Exclusive
// ---------------------------------------------------------------------------

/// Takes the first outgoing flow whose condition holds, else the default.
#[derive(Debug, Clone, Default)]
pub struct ExclusiveGatewayBehavior {
    pub default_flow: Option<String>,
}

impl ActivityBehavior for ExclusiveGatewayBehavior {
    fn execute(&self, ctx: &mut CommandContext<'_>, execution_id: Uuid) -> Result<(), EngineError> {
        let node = ctx.current_node(execution_id)?;
        let graph = ctx.graph_for(execution_id)?;

        let mut selected = None;
        for flow in graph.outgoing_flows(&node.id) {
            if self.default_flow.as_deref() == Some(flow.id.as_str()) {
                continue;
            }
            if ctx.has_true_condition(&flow, execution_id)? {
                selected = Some(flow.id.clone());
                break;
            }
        }
        let selected = selected
            .or_else(|| self.default_flow.clone())
            .ok_or_else(|| EngineError::NoOutgoingFlow {
                activity_id: node.id.clone(),
            })?;

        ctx.fire_listeners(&node.listeners, ListenerEvent::End, execution_id, &node.id)?;
        ctx.emit(EngineEvent::ActivityCompleted {
            process_instance_id: ctx.process_instance_id(),
            execution_id,
            activity_id: node.id.clone(),
        });
        tracing::trace!(%execution_id, gateway = %node.id, flow = %selected, "exclusive gateway decided");

        ctx.state_mut()
            .set_current_flow_element(execution_id, Some(&selected))?;
        ctx.agenda_mut()
            .plan_take_outgoing_sequence_flows(execution_id, true);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Parallel
// ---------------------------------------------------------------------------

/// Waits for one execution per incoming flow, then forks on every outgoing
/// flow regardless of conditions.
#[derive(Debug, Clone, Default)]
pub struct ParallelGatewayBehavior {
    pub incoming: usize,
}

impl ActivityBehavior for ParallelGatewayBehavior {
    fn execute(&self, ctx: &mut CommandContext<'_>, execution_id: Uuid) -> Result<(), EngineError> {
        ctx.state_mut().set_active(execution_id, false)?;
        let joined = waiting_siblings(ctx, execution_id)?;
        let required = self.incoming.max(1);

        if joined.len() < required {
            tracing::trace!(%execution_id, joined = joined.len(), required, "parallel gateway waiting");
            return Ok(());
        }

        for other in joined.into_iter().filter(|id| *id != execution_id) {
            ctx.state_mut().delete_subtree(other)?;
        }
        ctx.state_mut().set_active(execution_id, true)?;
        ctx.agenda_mut()
            .plan_take_outgoing_sequence_flows(execution_id, false);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Inclusive
// ---------------------------------------------------------------------------

/// Forks on every outgoing flow whose condition holds. Joins once no other
/// active execution can still reach the gateway.
#[derive(Debug, Clone, Copy, Default)]
pub struct InclusiveGatewayBehavior;

impl InclusiveGatewayBehavior {
    fn try_join(&self, ctx: &mut CommandContext<'_>, execution_id: Uuid) -> Result<(), EngineError> {
        let node = ctx.current_node(execution_id)?;
        let graph = ctx.graph_for(execution_id)?;

        let blocked_by = ctx.state().executions().find(|other| {
            other.id != execution_id
                && other.is_active
                && !other.is_ended
                && other
                    .current_flow_element_id
                    .as_deref()
                    .is_some_and(|element| graph.is_reachable(element, &node.id))
        });
        if let Some(other) = blocked_by {
            tracing::trace!(%execution_id, gateway = %node.id, blocked_by = %other.id, "inclusive gateway waiting");
            return Ok(());
        }

        for other in waiting_siblings(ctx, execution_id)? {
            if other != execution_id {
                ctx.state_mut().delete_subtree(other)?;
            }
        }
        ctx.state_mut().set_active(execution_id, true)?;
        ctx.agenda_mut()
            .plan_take_outgoing_sequence_flows(execution_id, true);
        Ok(())
    }
}

impl ActivityBehavior for InclusiveGatewayBehavior {
    fn execute(&self, ctx: &mut CommandContext<'_>, execution_id: Uuid) -> Result<(), EngineError> {
        ctx.state_mut().set_active(execution_id, false)?;
        self.try_join(ctx, execution_id)
    }

    fn inactive_aware(&self) -> Option<&dyn InactiveActivityBehavior> {
        Some(self)
    }
}

impl InactiveActivityBehavior for InclusiveGatewayBehavior {
    fn execute_inactive(
        &self,
        ctx: &mut CommandContext<'_>,
        execution_id: Uuid,
    ) -> Result<(), EngineError> {
        self.try_join(ctx, execution_id)
    }
}

/// Inactive executions on the same gateway under the same parent,
/// including `execution_id` itself.
fn waiting_siblings(ctx: &CommandContext<'_>, execution_id: Uuid) -> Result<Vec<Uuid>, EngineError> {
    let execution = ctx.state().execution(execution_id)?;
    let parent_id = execution.parent_id;
    let position = execution.current_flow_element_id.clone();
    Ok(ctx
        .state()
        .executions()
        .filter(|e| {
            e.parent_id == parent_id
                && !e.is_active
                && !e.is_ended
                && e.current_flow_element_id == position
        })
        .map(|e| e.id)
        .collect())
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokenflow_types::event::EngineEvent;

    use crate::context::EngineServices;
    use crate::error::EngineError;
    use crate::test_support::{deploy, executions_at, new_instance, run_unit, start_instance};

    const EXCLUSIVE: &str = r#"
key: route
nodes:
  - { id: start, type: start_event }
  - { id: gw, type: exclusive_gateway, default: to_small }
  - { id: big, type: user_task }
  - { id: small, type: user_task }
flows:
  - { id: f0, source: start, target: gw }
  - { id: to_big, source: gw, target: big, condition: "x > 10" }
  - { id: to_small, source: gw, target: small }
"#;

    fn run_exclusive(x: i64) -> crate::runtime::InstanceState {
        let services = EngineServices::default();
        let graph = deploy(&services, EXCLUSIVE);
        let (state, child) = new_instance(&graph);
        run_unit(&services, state, |ctx| {
            let root = ctx.state().root().map(|r| r.id).unwrap();
            ctx.state_mut().set_local_variable(root, "x", json!(x))?;
            ctx.agenda_mut().plan_continue_process(child);
            Ok(())
        })
        .unwrap()
        .0
    }

    #[test]
    fn exclusive_takes_default_when_condition_false() {
        let state = run_exclusive(5);
        assert_eq!(executions_at(&state, "small").len(), 1);
        assert!(executions_at(&state, "big").is_empty());
        assert_eq!(state.execution_count(), 2);
    }

    #[test]
    fn exclusive_takes_matching_flow() {
        let state = run_exclusive(50);
        assert_eq!(executions_at(&state, "big").len(), 1);
        assert!(executions_at(&state, "small").is_empty());
    }

    #[test]
    fn exclusive_without_match_or_default_fails() {
        let services = EngineServices::default();
        let graph = deploy(
            &services,
            r#"
key: stuck
nodes:
  - { id: start, type: start_event }
  - { id: gw, type: exclusive_gateway }
  - { id: a, type: user_task }
flows:
  - { id: f0, source: start, target: gw }
  - { id: fa, source: gw, target: a, condition: "false" }
"#,
        );
        let err = start_instance(&services, &graph).unwrap_err();
        assert!(err.is_invariant_violation());
        assert!(err.to_string().contains("gw"));
    }

    const PARALLEL: &str = r#"
key: diamond
nodes:
  - { id: start, type: start_event }
  - { id: fork, type: parallel_gateway }
  - { id: a, type: task }
  - { id: b, type: task }
  - { id: join, type: parallel_gateway }
  - { id: after, type: user_task }
flows:
  - { id: f0, source: start, target: fork }
  - { id: fa, source: fork, target: a }
  - { id: fb, source: fork, target: b }
  - { id: ja, source: a, target: join }
  - { id: jb, source: b, target: join }
  - { id: f9, source: join, target: after }
"#;

    #[test]
    fn parallel_fork_and_join_continue_once() {
        let services = EngineServices::default();
        let graph = deploy(&services, PARALLEL);
        let (state, events) = start_instance(&services, &graph).unwrap();

        assert_eq!(executions_at(&state, "after").len(), 1);
        assert!(executions_at(&state, "join").is_empty());
        assert_eq!(state.execution_count(), 2);
        let after_join = events
            .iter()
            .filter(|e| matches!(e, EngineEvent::SequenceFlowTaken { flow_id, .. } if flow_id == "f9"))
            .count();
        assert_eq!(after_join, 1);
    }

    const PARALLEL_WAIT: &str = r#"
key: diamond-wait
nodes:
  - { id: start, type: start_event }
  - { id: fork, type: parallel_gateway }
  - { id: a, type: user_task }
  - { id: b, type: task }
  - { id: join, type: parallel_gateway }
  - { id: after, type: user_task }
flows:
  - { id: f0, source: start, target: fork }
  - { id: fa, source: fork, target: a }
  - { id: fb, source: fork, target: b }
  - { id: ja, source: a, target: join }
  - { id: jb, source: b, target: join }
  - { id: f9, source: join, target: after }
"#;

    #[test]
    fn parallel_join_waits_for_every_incoming_flow() {
        let services = EngineServices::default();
        let graph = deploy(&services, PARALLEL_WAIT);
        let (state, _) = start_instance(&services, &graph).unwrap();

        let waiting = executions_at(&state, "join");
        assert_eq!(waiting.len(), 1);
        assert!(!state.execution(waiting[0]).unwrap().is_active);

        let task_execution = state.tasks().next().unwrap().execution_id;
        let (state, _) = run_unit(&services, state, |ctx| {
            ctx.agenda_mut()
                .plan_trigger_execution(task_execution, None, None);
            Ok(())
        })
        .unwrap();
        assert!(executions_at(&state, "join").is_empty());
        assert_eq!(executions_at(&state, "after").len(), 1);
        assert_eq!(state.execution_count(), 2);
    }

    const INCLUSIVE: &str = r#"
key: inclusive
nodes:
  - { id: start, type: start_event }
  - { id: fork, type: inclusive_gateway }
  - { id: a, type: user_task }
  - { id: b, type: user_task }
  - { id: c, type: user_task }
  - { id: join, type: inclusive_gateway }
  - { id: after, type: user_task }
flows:
  - { id: f0, source: start, target: fork }
  - { id: fa, source: fork, target: a, condition: "x > 1" }
  - { id: fb, source: fork, target: b, condition: "x > 5" }
  - { id: fc, source: fork, target: c, condition: "x > 100" }
  - { id: ja, source: a, target: join }
  - { id: jb, source: b, target: join }
  - { id: jc, source: c, target: join }
  - { id: f9, source: join, target: after }
"#;

    #[test]
    fn inclusive_join_waits_only_for_taken_branches() {
        let services = EngineServices::default();
        let graph = deploy(&services, INCLUSIVE);
        let (state, child) = new_instance(&graph);
        let (state, _) = run_unit(&services, state, |ctx| {
            let root = ctx.state().root().map(|r| r.id).unwrap();
            ctx.state_mut().set_local_variable(root, "x", json!(10))?;
            ctx.agenda_mut().plan_continue_process(child);
            Ok(())
        })
        .unwrap();
        assert_eq!(executions_at(&state, "a").len(), 1);
        assert_eq!(executions_at(&state, "b").len(), 1);
        assert!(executions_at(&state, "c").is_empty());

        let a = executions_at(&state, "a")[0];
        let b = executions_at(&state, "b")[0];

        let (state, _) = run_unit(&services, state, |ctx| {
            ctx.agenda_mut().plan_trigger_execution(a, None, None);
            Ok(())
        })
        .unwrap();
        assert_eq!(executions_at(&state, "join").len(), 1);
        assert!(executions_at(&state, "after").is_empty());

        let (state, _) = run_unit(&services, state, |ctx| {
            ctx.agenda_mut().plan_trigger_execution(b, None, None);
            Ok(())
        })
        .unwrap();
        assert!(executions_at(&state, "join").is_empty());
        assert_eq!(executions_at(&state, "after").len(), 1);
    }

    #[test]
    fn inclusive_join_fires_when_blocking_branch_ends_elsewhere() {
        let services = EngineServices::default();
        let graph = deploy(
            &services,
            r#"
key: inclusive-escape
nodes:
  - { id: start, type: start_event }
  - { id: fork, type: parallel_gateway }
  - { id: a, type: task }
  - { id: b, type: user_task }
  - { id: route, type: exclusive_gateway, default: to_join }
  - { id: join, type: inclusive_gateway }
  - { id: elsewhere, type: end_event }
  - { id: after, type: user_task }
flows:
  - { id: f0, source: start, target: fork }
  - { id: fa, source: fork, target: a }
  - { id: fb, source: fork, target: b }
  - { id: ja, source: a, target: join }
  - { id: fr, source: b, target: route }
  - { id: to_join, source: route, target: join }
  - { id: away, source: route, target: elsewhere, condition: "skip == true" }
  - { id: f9, source: join, target: after }
"#,
        );
        let (state, _) = start_instance(&services, &graph).unwrap();
        assert_eq!(executions_at(&state, "join").len(), 1);
        let b = executions_at(&state, "b")[0];

        let (state, _) = run_unit(&services, state, |ctx| {
            ctx.agenda_mut()
                .plan_trigger_execution(b, None, Some(json!({ "skip": true })));
            Ok(())
        })
        .unwrap();
        assert!(executions_at(&state, "join").is_empty());
        assert_eq!(executions_at(&state, "after").len(), 1);
    }

    #[test]
    fn parallel_join_error_type_is_not_triggerable() {
        let services = EngineServices::default();
        let graph = deploy(&services, PARALLEL_WAIT);
        let (state, _) = start_instance(&services, &graph).unwrap();
        let waiting = executions_at(&state, "join")[0];
        let err = run_unit(&services, state, |ctx| {
            ctx.agenda_mut().plan_trigger_execution(waiting, None, None);
            Ok(())
        })
        .unwrap_err();
        assert!(matches!(err, EngineError::NotTriggerable { .. }));
    }
}
