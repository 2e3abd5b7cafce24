//! End events.

use uuid::Uuid;

use crate::context::CommandContext;
use crate::error::EngineError;
use crate::error_propagation::propagate_error;

use super::ActivityBehavior;

/// Ends the arriving execution by taking (no) outgoing flows.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoneEndEventBehavior;

impl ActivityBehavior for NoneEndEventBehavior {
    fn execute(&self, ctx: &mut CommandContext<'_>, execution_id: Uuid) -> Result<(), EngineError> {
        ctx.agenda_mut()
            .plan_take_outgoing_sequence_flows(execution_id, true);
        Ok(())
    }
}

/// Throws a business error to the nearest matching error boundary event.
#[derive(Debug, Clone)]
pub struct ErrorEndEventBehavior {
    pub error_code: String,
}

impl ActivityBehavior for ErrorEndEventBehavior {
    fn execute(&self, ctx: &mut CommandContext<'_>, execution_id: Uuid) -> Result<(), EngineError> {
        propagate_error(ctx, &self.error_code, None, execution_id)
    }
}
