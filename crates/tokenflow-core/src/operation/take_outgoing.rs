//! TakeOutgoingSequenceFlows: leave the current node through the selected
//! outgoing flows, forking concurrent executions when more than one is
//! taken.

use tokenflow_types::event::EngineEvent;
use tokenflow_types::process::ListenerEvent;
use uuid::Uuid;

use crate::context::CommandContext;
use crate::error::EngineError;
use crate::process::{FlowElement, SequenceFlow};

pub(super) fn run(
    ctx: &mut CommandContext<'_>,
    execution_id: Uuid,
    evaluate_conditions: bool,
) -> Result<(), EngineError> {
    let node = match ctx.find_current_flow_element(execution_id)? {
        // Already on a flow (chosen by a gateway): just continue along it.
        FlowElement::Flow(_) => {
            ctx.agenda_mut().plan_continue_process(execution_id);
            return Ok(());
        }
        FlowElement::Node(node) => node,
    };

    let execution = ctx.state().execution(execution_id)?.clone();
    if !execution.is_root() {
        ctx.fire_listeners(&node.listeners, ListenerEvent::End, execution_id, &node.id)?;
        ctx.emit(EngineEvent::ActivityCompleted {
            process_instance_id: ctx.process_instance_id(),
            execution_id,
            activity_id: node.id.clone(),
        });
    }

    // Boundary events stop listening once the activity is left.
    for child in ctx.state().children(execution_id) {
        let on_boundary = ctx
            .state()
            .execution(child)?
            .current_flow_element_id
            .as_ref()
            .is_some_and(|id| node.boundary_events.contains(id));
        if on_boundary {
            ctx.state_mut().delete_subtree(child)?;
        }
    }

    let graph = ctx.graph_for(execution_id)?;
    let default_flow = node.kind.default_flow();
    let mut selected: Vec<std::sync::Arc<SequenceFlow>> = Vec::new();
    for flow in graph.outgoing_flows(&node.id) {
        if !evaluate_conditions {
            selected.push(flow);
            continue;
        }
        if Some(flow.id.as_str()) == default_flow {
            continue;
        }
        if ctx.has_true_condition(&flow, execution_id)? {
            selected.push(flow);
        }
    }
    if selected.is_empty() && evaluate_conditions {
        if let Some(default) = default_flow.and_then(|id| graph.flow(id)) {
            selected.push(default);
        }
    }

    let Some((first, rest)) = selected.split_first() else {
        tracing::trace!(%execution_id, activity_id = %node.id, "no outgoing flow, ending execution");
        ctx.agenda_mut().plan_end_execution(execution_id);
        return Ok(());
    };

    let fork_parent = execution.parent_id.unwrap_or(execution_id);
    let mut forked = Vec::with_capacity(rest.len());
    for flow in rest {
        let state = ctx.state_mut();
        let sibling = state.create_child_execution(fork_parent)?;
        let entry = state.execution_mut(sibling)?;
        entry.current_flow_element_id = Some(flow.id.clone());
        entry.is_concurrent = true;
        forked.push(sibling);
    }

    let state = ctx.state_mut();
    let reused = state.execution_mut(execution_id)?;
    reused.current_flow_element_id = Some(first.id.clone());
    if !forked.is_empty() && !execution.is_root() {
        reused.is_concurrent = true;
    }

    ctx.agenda_mut().plan_continue_process(execution_id);
    for sibling in forked {
        ctx.agenda_mut().plan_continue_process(sibling);
    }
    Ok(())
}
