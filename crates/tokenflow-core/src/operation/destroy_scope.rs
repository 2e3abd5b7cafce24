//! DestroyScope: tear down the scope enclosing an execution, used when an
//! interrupting event cancels a running activity.

use tokenflow_types::event::EngineEvent;
use uuid::Uuid;

use crate::context::CommandContext;
use crate::error::EngineError;

pub(super) fn run(ctx: &mut CommandContext<'_>, execution_id: Uuid) -> Result<(), EngineError> {
    let scope_id = ctx.state().find_enclosing_scope(execution_id)?;
    let activity_id = ctx
        .state()
        .execution(scope_id)?
        .current_flow_element_id
        .clone();

    let state = ctx.state_mut();
    let mut removed = 0;
    for child in state.children(scope_id) {
        removed += state.delete_subtree(child)?;
    }
    state.delete_execution(scope_id)?;

    tracing::debug!(%scope_id, removed = removed + 1, "scope destroyed");
    ctx.emit(EngineEvent::ActivityCancelled {
        process_instance_id: ctx.process_instance_id(),
        execution_id: scope_id,
        activity_id,
    });
    Ok(())
}
