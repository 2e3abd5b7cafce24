//! Activity behaviors bound to flow nodes.
//!
//! A behavior decides what happens when an execution arrives at its node:
//! wait (user task, catch events), do work and leave (service task), or
//! route (gateways). Behaviors never continue the process themselves; they
//! plan operations on the agenda.

mod catch_event;
mod end_event;
mod gateway;
pub(crate) mod multi_instance;
mod service_task;
mod sub_process;
mod user_task;

use std::sync::Arc;

use serde_json::Value;
use tokenflow_types::process::NodeKind;
use uuid::Uuid;

use crate::context::CommandContext;
use crate::error::EngineError;
use crate::process::FlowNode;

pub(crate) use catch_event::{fire_interrupting, fire_non_interrupting};
pub use catch_event::{BoundaryEventBehavior, IntermediateCatchEventBehavior};
pub use end_event::{ErrorEndEventBehavior, NoneEndEventBehavior};
pub use gateway::{ExclusiveGatewayBehavior, InclusiveGatewayBehavior, ParallelGatewayBehavior};
pub use service_task::ServiceTaskBehavior;
pub use sub_process::SubProcessBehavior;
pub use user_task::UserTaskBehavior;

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

pub trait ActivityBehavior: Send + Sync {
    /// Called when an execution arrives at the node.
    fn execute(&self, ctx: &mut CommandContext<'_>, execution_id: Uuid) -> Result<(), EngineError>;

    /// Behaviors that wait for an external trigger return themselves here.
    fn triggerable(&self) -> Option<&dyn TriggerableActivityBehavior> {
        None
    }

    /// Behaviors that must re-check executions left inactive on their node.
    fn inactive_aware(&self) -> Option<&dyn InactiveActivityBehavior> {
        None
    }
}

pub trait TriggerableActivityBehavior: Send + Sync {
    fn trigger(
        &self,
        ctx: &mut CommandContext<'_>,
        execution_id: Uuid,
        signal: Option<&str>,
        payload: Option<&Value>,
    ) -> Result<(), EngineError>;
}

pub trait InactiveActivityBehavior: Send + Sync {
    fn execute_inactive(
        &self,
        ctx: &mut CommandContext<'_>,
        execution_id: Uuid,
    ) -> Result<(), EngineError>;
}

/// Chooses the behavior for each node when a graph is built.
pub trait BehaviorFactory: Send + Sync {
    /// `None` makes the node a pass-through.
    fn create(&self, node: &FlowNode) -> Option<Arc<dyn ActivityBehavior>>;
}

/// Behaviors for every built-in node type.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultBehaviorFactory;

impl BehaviorFactory for DefaultBehaviorFactory {
    fn create(&self, node: &FlowNode) -> Option<Arc<dyn ActivityBehavior>> {
        let behavior: Arc<dyn ActivityBehavior> = match &node.kind {
            NodeKind::StartEvent | NodeKind::Task => return None,
            NodeKind::EndEvent => Arc::new(NoneEndEventBehavior),
            NodeKind::ErrorEndEvent { error_code } => Arc::new(ErrorEndEventBehavior {
                error_code: error_code.clone(),
            }),
            NodeKind::UserTask {
                assignee,
                candidate_groups,
            } => Arc::new(UserTaskBehavior {
                name: node.name.clone(),
                assignee: assignee.clone(),
                candidate_groups: candidate_groups.clone(),
            }),
            NodeKind::ServiceTask { handler } => Arc::new(ServiceTaskBehavior {
                handler: handler.clone(),
            }),
            NodeKind::ExclusiveGateway { default } => Arc::new(ExclusiveGatewayBehavior {
                default_flow: default.clone(),
            }),
            NodeKind::ParallelGateway => Arc::new(ParallelGatewayBehavior {
                incoming: node.incoming.len(),
            }),
            NodeKind::InclusiveGateway { .. } => Arc::new(InclusiveGatewayBehavior),
            NodeKind::IntermediateCatchEvent { event } => {
                Arc::new(IntermediateCatchEventBehavior {
                    event: event.clone(),
                })
            }
            NodeKind::BoundaryEvent {
                cancel_activity,
                event,
                ..
            } => Arc::new(BoundaryEventBehavior {
                event: event.clone(),
                cancel_activity: *cancel_activity,
            }),
            NodeKind::SubProcess { .. } => Arc::new(SubProcessBehavior),
        };
        Some(behavior)
    }
}

/// Leave the current node. Multi-instance instances report to their root
/// instead of following outgoing flows.
pub fn leave(ctx: &mut CommandContext<'_>, execution_id: Uuid) -> Result<(), EngineError> {
    if multi_instance::is_instance(ctx, execution_id)? {
        return multi_instance::complete_instance(ctx, execution_id);
    }
    ctx.agenda_mut()
        .plan_take_outgoing_sequence_flows(execution_id, true);
    Ok(())
}

/// Merge a trigger payload object into the process variables.
pub(crate) fn apply_payload(
    ctx: &mut CommandContext<'_>,
    execution_id: Uuid,
    payload: Option<&Value>,
) -> Result<(), EngineError> {
    if let Some(Value::Object(entries)) = payload {
        for (name, value) in entries {
            ctx.state_mut()
                .set_variable(execution_id, name, value.clone())?;
        }
    }
    Ok(())
}
