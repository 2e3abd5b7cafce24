//! Interpreter operations planned on the agenda.
//!
//! Each variant is a self-contained step over the execution tree. Running
//! one may plan further operations but never recurses into them.

mod continue_multi_instance;
mod continue_process;
mod destroy_scope;
mod end_execution;
mod execute_inactive;
mod take_outgoing;
mod trigger_execution;

use serde_json::Value;
use uuid::Uuid;

use crate::context::CommandContext;
use crate::error::EngineError;

#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Advance an execution onto its current node or across its current
    /// sequence flow.
    ContinueProcess {
        execution_id: Uuid,
        force_synchronous: bool,
        in_compensation: bool,
    },
    /// Run one instance of a multi-instance activity.
    ContinueMultiInstance { execution_id: Uuid },
    /// Leave the current node through its selected outgoing flows.
    TakeOutgoingSequenceFlows {
        execution_id: Uuid,
        evaluate_conditions: bool,
    },
    /// Finish an execution that has nowhere left to go.
    EndExecution { execution_id: Uuid },
    /// Tear down the scope enclosing an execution.
    DestroyScope { execution_id: Uuid },
    /// Deliver an external trigger to a waiting execution.
    TriggerExecution {
        execution_id: Uuid,
        signal: Option<String>,
        payload: Option<Value>,
    },
    /// Let inactive-aware behaviors (joins) re-check waiting executions.
    ExecuteInactiveBehaviors,
}

impl Operation {
    /// Execution this operation works on, if any.
    pub fn execution_id(&self) -> Option<Uuid> {
        match self {
            Operation::ContinueProcess { execution_id, .. }
            | Operation::ContinueMultiInstance { execution_id }
            | Operation::TakeOutgoingSequenceFlows { execution_id, .. }
            | Operation::EndExecution { execution_id }
            | Operation::DestroyScope { execution_id }
            | Operation::TriggerExecution { execution_id, .. } => Some(*execution_id),
            Operation::ExecuteInactiveBehaviors => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Operation::ContinueProcess { .. } => "continue_process",
            Operation::ContinueMultiInstance { .. } => "continue_multi_instance",
            Operation::TakeOutgoingSequenceFlows { .. } => "take_outgoing_sequence_flows",
            Operation::EndExecution { .. } => "end_execution",
            Operation::DestroyScope { .. } => "destroy_scope",
            Operation::TriggerExecution { .. } => "trigger_execution",
            Operation::ExecuteInactiveBehaviors => "execute_inactive_behaviors",
        }
    }

    pub(crate) fn run(self, ctx: &mut CommandContext<'_>) -> Result<(), EngineError> {
        match self {
            Operation::ContinueProcess {
                execution_id,
                force_synchronous,
                in_compensation,
            } => continue_process::run(ctx, execution_id, force_synchronous, in_compensation),
            Operation::ContinueMultiInstance { execution_id } => {
                continue_multi_instance::run(ctx, execution_id)
            }
            Operation::TakeOutgoingSequenceFlows {
                execution_id,
                evaluate_conditions,
            } => take_outgoing::run(ctx, execution_id, evaluate_conditions),
            Operation::EndExecution { execution_id } => end_execution::run(ctx, execution_id),
            Operation::DestroyScope { execution_id } => destroy_scope::run(ctx, execution_id),
            Operation::TriggerExecution {
                execution_id,
                signal,
                payload,
            } => trigger_execution::run(ctx, execution_id, signal.as_deref(), payload.as_ref()),
            Operation::ExecuteInactiveBehaviors => execute_inactive::run(ctx),
        }
    }
}
