//! Service task: calls a registered handler and leaves with its output.

use uuid::Uuid;

use crate::context::CommandContext;
use crate::error::EngineError;
use crate::error_propagation::propagate_error;
use crate::service::{ServiceError, ServiceRequest};

use super::{leave, ActivityBehavior};

#[derive(Debug, Clone)]
pub struct ServiceTaskBehavior {
    pub handler: String,
}

impl ActivityBehavior for ServiceTaskBehavior {
    fn execute(&self, ctx: &mut CommandContext<'_>, execution_id: Uuid) -> Result<(), EngineError> {
        let handler = ctx
            .services()
            .service_handlers
            .get(&self.handler)
            .ok_or_else(|| EngineError::UnknownServiceHandler(self.handler.clone()))?;
        let node = ctx.current_node(execution_id)?;
        let variables = ctx.state().visible_variables(execution_id)?;
        let request = ServiceRequest {
            process_instance_id: ctx.process_instance_id(),
            execution_id,
            activity_id: &node.id,
            variables: &variables,
        };

        match handler.invoke(&request) {
            Ok(output) => {
                for (name, value) in output {
                    ctx.state_mut().set_variable(execution_id, &name, value)?;
                }
                leave(ctx, execution_id)
            }
            Err(ServiceError::Business { code, message }) => {
                tracing::debug!(handler = %self.handler, %code, "service handler raised business error");
                propagate_error(ctx, &code, message.as_deref(), execution_id)
            }
            Err(ServiceError::Failed(message)) => Err(EngineError::ServiceTask {
                handler: self.handler.clone(),
                message,
            }),
        }
    }
}
