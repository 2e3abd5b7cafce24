//! ContinueMultiInstance: run the inner behavior for one instance of a
//! multi-instance activity.

use tokenflow_types::event::EngineEvent;
use tokenflow_types::process::ListenerEvent;
use uuid::Uuid;

use crate::behavior;
use crate::context::CommandContext;
use crate::error::EngineError;
use crate::error_propagation::propagate_error;

pub(super) fn run(ctx: &mut CommandContext<'_>, execution_id: Uuid) -> Result<(), EngineError> {
    let node = ctx.current_node(execution_id)?;

    ctx.emit(EngineEvent::ActivityStarted {
        process_instance_id: ctx.process_instance_id(),
        execution_id,
        activity_id: node.id.clone(),
        activity_type: node.kind.type_name().to_string(),
    });
    ctx.fire_listeners(&node.listeners, ListenerEvent::Start, execution_id, &node.id)?;

    let graph = ctx.graph_for(execution_id)?;
    let Some(inner) = graph.behavior(&node.id) else {
        return behavior::leave(ctx, execution_id);
    };

    match inner.execute(ctx, execution_id) {
        Err(EngineError::BusinessFault { code, message }) => {
            propagate_error(ctx, &code, message.as_deref(), execution_id)
        }
        other => other,
    }
}
