//! Embedded sub-process.

use uuid::Uuid;

use crate::context::CommandContext;
use crate::error::EngineError;

use super::ActivityBehavior;

/// Starts the sub-process's inner flow on its start event. Runs on the
/// sub-process scope execution.
#[derive(Debug, Default, Clone, Copy)]
pub struct SubProcessBehavior;

impl ActivityBehavior for SubProcessBehavior {
    fn execute(&self, ctx: &mut CommandContext<'_>, execution_id: Uuid) -> Result<(), EngineError> {
        let node = ctx.current_node(execution_id)?;
        let graph = ctx.graph_for(execution_id)?;
        let initial = graph
            .initial_node(Some(&node.id))
            .ok_or_else(|| EngineError::FlowElementNotFound {
                process_definition_id: graph.id(),
                element_id: format!("{}/start_event", node.id),
            })?;

        let state = ctx.state_mut();
        let child = state.create_child_execution(execution_id)?;
        state.set_current_flow_element(child, Some(&initial.id))?;
        ctx.agenda_mut().plan_continue_process(child);
        Ok(())
    }
}
