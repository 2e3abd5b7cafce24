//! ContinueProcess: move an execution onto its current node, or across its
//! current sequence flow to the flow's target.

use chrono::Utc;
use tokenflow_types::event::EngineEvent;
use tokenflow_types::process::{EventDefinition, ListenerEvent, NodeKind};
use tokenflow_types::runtime::JobType;
use uuid::Uuid;

use crate::behavior::multi_instance;
use crate::context::CommandContext;
use crate::error::EngineError;
use crate::process::{FlowElement, FlowNode, SequenceFlow};

pub(super) fn run(
    ctx: &mut CommandContext<'_>,
    execution_id: Uuid,
    force_synchronous: bool,
    in_compensation: bool,
) -> Result<(), EngineError> {
    match ctx.find_current_flow_element(execution_id)? {
        FlowElement::Node(node) => {
            continue_through_node(ctx, execution_id, &node, force_synchronous, in_compensation)
        }
        FlowElement::Flow(flow) => continue_through_flow(ctx, execution_id, &flow),
    }
}

fn continue_through_node(
    ctx: &mut CommandContext<'_>,
    execution_id: Uuid,
    node: &FlowNode,
    force_synchronous: bool,
    in_compensation: bool,
) -> Result<(), EngineError> {
    let is_process_start =
        node.incoming.is_empty() && node.parent_container.is_none() && !node.is_boundary_event();
    if is_process_start && !force_synchronous {
        let graph = ctx.graph_for(execution_id)?;
        let definition = graph.definition();
        ctx.fire_listeners(
            &definition.listeners,
            ListenerEvent::Start,
            execution_id,
            &definition.key,
        )?;
    }

    let mut execution_id = execution_id;
    if node.is_sub_process()
        && node.multi_instance.is_none()
        && !is_scope_at(ctx, execution_id, &node.id)?
    {
        execution_id = create_sub_process_scope(ctx, execution_id, node)?;
    }

    if node.is_async && !force_synchronous {
        let job_id = ctx.create_job(
            execution_id,
            JobType::AsyncContinuation,
            &node.id,
            node.exclusive,
            Utc::now(),
        )?;
        tracing::debug!(%execution_id, activity_id = %node.id, %job_id, "async continuation scheduled");
        return Ok(());
    }

    if node.multi_instance.is_some() && !is_multi_instance_root_at(ctx, execution_id, &node.id)? {
        execution_id = create_multi_instance_root(ctx, execution_id, node)?;
    }

    execute_synchronous(ctx, execution_id, node, in_compensation)
}

fn execute_synchronous(
    ctx: &mut CommandContext<'_>,
    execution_id: Uuid,
    node: &FlowNode,
    in_compensation: bool,
) -> Result<(), EngineError> {
    tracing::debug!(%execution_id, activity_id = %node.id, activity_type = node.kind.type_name(), "executing activity");
    ctx.emit(EngineEvent::ActivityStarted {
        process_instance_id: ctx.process_instance_id(),
        execution_id,
        activity_id: node.id.clone(),
        activity_type: node.kind.type_name().to_string(),
    });
    ctx.fire_listeners(&node.listeners, ListenerEvent::Start, execution_id, &node.id)?;

    if !in_compensation {
        arm_boundary_events(ctx, execution_id, node)?;
    }

    if node.multi_instance.is_some() {
        return multi_instance::start(ctx, execution_id, node)
            .map_err(|e| e.in_activity(execution_id, &node.id));
    }

    let graph = ctx.graph_for(execution_id)?;
    match graph.behavior(&node.id) {
        Some(behavior) => behavior
            .execute(ctx, execution_id)
            .map_err(|e| e.in_activity(execution_id, &node.id)),
        None => {
            ctx.agenda_mut()
                .plan_take_outgoing_sequence_flows(execution_id, true);
            Ok(())
        }
    }
}

/// Give every boundary event attached to `node` its own child execution and
/// let its behavior arm the trigger (timer job, subscription).
fn arm_boundary_events(
    ctx: &mut CommandContext<'_>,
    execution_id: Uuid,
    node: &FlowNode,
) -> Result<(), EngineError> {
    if node.boundary_events.is_empty() {
        return Ok(());
    }
    let graph = ctx.graph_for(execution_id)?;
    for boundary in graph.boundary_events(&node.id) {
        if let NodeKind::BoundaryEvent {
            event: EventDefinition::Compensation,
            ..
        } = &boundary.kind
        {
            continue;
        }
        let child = ctx.state_mut().create_child_execution(execution_id)?;
        ctx.state_mut()
            .set_current_flow_element(child, Some(&boundary.id))?;
        if let Some(behavior) = graph.behavior(&boundary.id) {
            behavior
                .execute(ctx, child)
                .map_err(|e| e.in_activity(child, &boundary.id))?;
        }
    }
    Ok(())
}

fn continue_through_flow(
    ctx: &mut CommandContext<'_>,
    execution_id: Uuid,
    flow: &SequenceFlow,
) -> Result<(), EngineError> {
    for event in [ListenerEvent::Start, ListenerEvent::Take, ListenerEvent::End] {
        ctx.fire_listeners(&flow.listeners, event, execution_id, &flow.id)?;
    }
    ctx.emit(EngineEvent::SequenceFlowTaken {
        process_instance_id: ctx.process_instance_id(),
        execution_id,
        flow_id: flow.id.clone(),
        source: flow.source.clone(),
        target: flow.target.clone(),
    });
    ctx.state_mut()
        .set_current_flow_element(execution_id, Some(&flow.target))?;
    ctx.agenda_mut().plan_continue_process(execution_id);
    Ok(())
}

// ---------------------------------------------------------------------------
// Scope creation
// ---------------------------------------------------------------------------

fn is_scope_at(
    ctx: &CommandContext<'_>,
    execution_id: Uuid,
    node_id: &str,
) -> Result<bool, EngineError> {
    let execution = ctx.state().execution(execution_id)?;
    Ok(execution.is_scope && execution.current_flow_element_id.as_deref() == Some(node_id))
}

fn is_multi_instance_root_at(
    ctx: &CommandContext<'_>,
    execution_id: Uuid,
    node_id: &str,
) -> Result<bool, EngineError> {
    let execution = ctx.state().execution(execution_id)?;
    Ok(execution.is_multi_instance_root
        && execution.current_flow_element_id.as_deref() == Some(node_id))
}

/// Replace the arriving execution with a scope execution for the
/// sub-process, created under the nearest scope above it.
fn create_sub_process_scope(
    ctx: &mut CommandContext<'_>,
    execution_id: Uuid,
    node: &FlowNode,
) -> Result<Uuid, EngineError> {
    let is_concurrent = ctx.state().execution(execution_id)?.is_concurrent;
    let parent_scope = ctx.state().find_parent_scope(execution_id)?;

    let state = ctx.state_mut();
    let scope_id = state.create_child_execution(parent_scope)?;
    let scope = state.execution_mut(scope_id)?;
    scope.current_flow_element_id = Some(node.id.clone());
    scope.is_scope = true;
    scope.is_concurrent = is_concurrent;
    state.delete_subtree(execution_id)?;

    tracing::trace!(%scope_id, sub_process = %node.id, "sub-process scope created");
    Ok(scope_id)
}

/// Replace the arriving execution with the root of a multi-instance
/// activity, created under the arriving execution's parent.
fn create_multi_instance_root(
    ctx: &mut CommandContext<'_>,
    execution_id: Uuid,
    node: &FlowNode,
) -> Result<Uuid, EngineError> {
    let incoming = ctx.state().execution(execution_id)?;
    let parent_id = incoming
        .parent_id
        .ok_or(EngineError::NoEnclosingScope(execution_id))?;
    let is_concurrent = incoming.is_concurrent;

    let state = ctx.state_mut();
    let root_id = state.create_child_execution(parent_id)?;
    let root = state.execution_mut(root_id)?;
    root.current_flow_element_id = Some(node.id.clone());
    root.is_scope = true;
    root.is_multi_instance_root = true;
    root.is_concurrent = is_concurrent;
    state.delete_subtree(execution_id)?;

    tracing::trace!(%root_id, activity_id = %node.id, "multi-instance root created");
    Ok(root_id)
}
