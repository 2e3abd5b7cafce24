//! Multi-instance activities.
//!
//! The execution arriving at a multi-instance activity becomes an inactive
//! multi-instance root that owns one child per instance. Parallel activities
//! create every instance up front; sequential ones create the next instance
//! when the previous one completes. The root carries the loop counters
//! `nrOfInstances`, `nrOfActiveInstances` and `nrOfCompletedInstances`, and
//! each instance its own `loopCounter`.

use serde_json::{json, Value};
use uuid::Uuid;

use crate::context::CommandContext;
use crate::error::EngineError;
use crate::process::FlowNode;

pub const NR_OF_INSTANCES: &str = "nrOfInstances";
pub const NR_OF_ACTIVE_INSTANCES: &str = "nrOfActiveInstances";
pub const NR_OF_COMPLETED_INSTANCES: &str = "nrOfCompletedInstances";
pub const LOOP_COUNTER: &str = "loopCounter";

/// Create the instances of `node` under the multi-instance root `root_id`
/// and plan their execution.
pub(crate) fn start(
    ctx: &mut CommandContext<'_>,
    root_id: Uuid,
    node: &FlowNode,
) -> Result<(), EngineError> {
    let characteristics = node.multi_instance.as_ref().ok_or_else(|| {
        EngineError::Internal(format!("'{}' is not a multi-instance activity", node.id))
    })?;
    let total = characteristics.cardinality;
    let active = if characteristics.sequential { 1 } else { total };

    let state = ctx.state_mut();
    state.set_local_variable(root_id, NR_OF_INSTANCES, json!(total))?;
    state.set_local_variable(root_id, NR_OF_COMPLETED_INSTANCES, json!(0))?;
    state.set_local_variable(root_id, NR_OF_ACTIVE_INSTANCES, json!(active))?;
    state.set_active(root_id, false)?;

    tracing::debug!(
        %root_id,
        activity_id = %node.id,
        instances = total,
        sequential = characteristics.sequential,
        "starting multi-instance activity"
    );

    // All instances exist before the first one runs, so an instance that
    // completes synchronously never sees a partial set.
    let mut instances = Vec::with_capacity(active as usize);
    for loop_counter in 0..active {
        instances.push(create_instance(ctx, root_id, node, loop_counter, characteristics.sequential)?);
    }
    for instance in instances {
        ctx.agenda_mut().plan_continue_multi_instance(instance);
    }
    Ok(())
}

fn create_instance(
    ctx: &mut CommandContext<'_>,
    root_id: Uuid,
    node: &FlowNode,
    loop_counter: u32,
    sequential: bool,
) -> Result<Uuid, EngineError> {
    let state = ctx.state_mut();
    let instance = state.create_child_execution(root_id)?;
    let entry = state.execution_mut(instance)?;
    entry.current_flow_element_id = Some(node.id.clone());
    entry.is_scope = node.is_sub_process();
    entry.is_concurrent = !sequential;
    state.set_local_variable(instance, LOOP_COUNTER, json!(loop_counter))?;
    Ok(instance)
}

/// Whether `execution_id` is one instance of a multi-instance activity:
/// its parent is the multi-instance root on the same node.
pub(crate) fn is_instance(ctx: &CommandContext<'_>, execution_id: Uuid) -> Result<bool, EngineError> {
    let execution = ctx.state().execution(execution_id)?;
    let Some(parent_id) = execution.parent_id else {
        return Ok(false);
    };
    let parent = ctx.state().execution(parent_id)?;
    Ok(parent.is_multi_instance_root
        && execution.current_flow_element_id.is_some()
        && parent.current_flow_element_id == execution.current_flow_element_id)
}

/// Record that one instance finished. Once every instance has completed the
/// root leaves the activity; a sequential activity otherwise starts its next
/// instance.
pub(crate) fn complete_instance(
    ctx: &mut CommandContext<'_>,
    instance_id: Uuid,
) -> Result<(), EngineError> {
    let root_id = ctx
        .state()
        .execution(instance_id)?
        .parent_id
        .ok_or(EngineError::NoEnclosingScope(instance_id))?;
    let node = ctx.current_node(root_id)?;
    let sequential = node
        .multi_instance
        .as_ref()
        .is_some_and(|characteristics| characteristics.sequential);

    let total = counter(ctx, root_id, NR_OF_INSTANCES);
    let completed = counter(ctx, root_id, NR_OF_COMPLETED_INSTANCES) + 1;
    let active = counter(ctx, root_id, NR_OF_ACTIVE_INSTANCES).saturating_sub(1);

    let state = ctx.state_mut();
    state.set_local_variable(root_id, NR_OF_COMPLETED_INSTANCES, json!(completed))?;
    state.set_local_variable(root_id, NR_OF_ACTIVE_INSTANCES, json!(active))?;
    state.delete_subtree(instance_id)?;

    tracing::trace!(%root_id, completed, total, "multi-instance instance completed");

    if completed >= total {
        return complete_activity(ctx, root_id, &node.id);
    }

    if sequential {
        let next = create_instance(ctx, root_id, &node, completed, true)?;
        ctx.state_mut()
            .set_local_variable(root_id, NR_OF_ACTIVE_INSTANCES, json!(1))?;
        ctx.agenda_mut().plan_continue_multi_instance(next);
    }
    Ok(())
}

/// Turn the root back into a plain execution on the activity and leave it.
fn complete_activity(
    ctx: &mut CommandContext<'_>,
    root_id: Uuid,
    activity_id: &str,
) -> Result<(), EngineError> {
    let state = ctx.state_mut();
    for child in state.children(root_id) {
        let on_activity = state
            .execution(child)?
            .current_flow_element_id
            .as_deref()
            == Some(activity_id);
        if on_activity {
            state.delete_subtree(child)?;
        }
    }
    for name in [NR_OF_INSTANCES, NR_OF_ACTIVE_INSTANCES, NR_OF_COMPLETED_INSTANCES] {
        state.remove_local_variable(root_id, name);
    }
    let root = state.execution_mut(root_id)?;
    root.is_active = true;
    root.is_multi_instance_root = false;
    root.is_scope = false;

    tracing::debug!(%root_id, %activity_id, "multi-instance activity completed");
    ctx.agenda_mut()
        .plan_take_outgoing_sequence_flows(root_id, true);
    Ok(())
}

fn counter(ctx: &CommandContext<'_>, execution_id: Uuid, name: &str) -> u32 {
    ctx.state()
        .local_variable(execution_id, name)
        .and_then(Value::as_u64)
        .and_then(|value| u32::try_from(value).ok())
        .unwrap_or(0)
}
