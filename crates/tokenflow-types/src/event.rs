//! Event types for the tokenflow engine event bus.
//!
//! `EngineEvent` is broadcast after a unit of work commits. All variants are
//! Clone + Send + Sync for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Events emitted while process instances advance.
///
/// Subscribers (CLI worker output, logging, embedding applications) observe
/// these; they never influence the interpreter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    ProcessStarted {
        process_instance_id: Uuid,
        process_definition_key: String,
        business_key: Option<String>,
    },

    ProcessCompleted { process_instance_id: Uuid },

    /// A flow node started executing synchronously.
    ActivityStarted {
        process_instance_id: Uuid,
        execution_id: Uuid,
        activity_id: String,
        activity_type: String,
    },

    /// An execution left a flow node through its outgoing flows.
    ActivityCompleted {
        process_instance_id: Uuid,
        execution_id: Uuid,
        activity_id: String,
    },

    /// A scope was torn down before completing (interrupting event).
    ActivityCancelled {
        process_instance_id: Uuid,
        execution_id: Uuid,
        activity_id: Option<String>,
    },

    SequenceFlowTaken {
        process_instance_id: Uuid,
        execution_id: Uuid,
        flow_id: String,
        source: String,
        target: String,
    },

    TaskCreated {
        process_instance_id: Uuid,
        task_id: Uuid,
        task_definition_key: String,
    },

    JobCreated {
        process_instance_id: Uuid,
        job_id: Uuid,
        job_type: String,
    },

    JobFailed {
        job_id: Uuid,
        error: String,
        retries_left: u32,
    },
}

impl EngineEvent {
    /// Process instance this event belongs to, if any.
    pub fn process_instance_id(&self) -> Option<Uuid> {
        match self {
            EngineEvent::ProcessStarted {
                process_instance_id,
                ..
            }
            | EngineEvent::ProcessCompleted {
                process_instance_id,
            }
            | EngineEvent::ActivityStarted {
                process_instance_id,
                ..
            }
            | EngineEvent::ActivityCompleted {
                process_instance_id,
                ..
            }
            | EngineEvent::ActivityCancelled {
                process_instance_id,
                ..
            }
            | EngineEvent::SequenceFlowTaken {
                process_instance_id,
                ..
            }
            | EngineEvent::TaskCreated {
                process_instance_id,
                ..
            }
            | EngineEvent::JobCreated {
                process_instance_id,
                ..
            } => Some(*process_instance_id),
            EngineEvent::JobFailed { .. } => None,
        }
    }
}
