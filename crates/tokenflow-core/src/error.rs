//! Error type for the process interpreter and engine facade.
//!
//! Invariant violations (a corrupt execution tree, a missing flow element)
//! abort the whole unit of work. Business faults are routed to error
//! boundary events and only surface when nothing catches them.

use tokenflow_types::error::RepositoryError;
use uuid::Uuid;

use crate::process::definition::DefinitionError;

/// Errors raised while advancing process instances.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    // -----------------------------------------------------------------------
    // Invariant violations
    // -----------------------------------------------------------------------
    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("execution {0} is not positioned on a flow element")]
    NoCurrentFlowElement(Uuid),

    #[error("flow element '{element_id}' not found in process definition {process_definition_id}")]
    FlowElementNotFound {
        process_definition_id: Uuid,
        element_id: String,
    },

    #[error("'{0}' is not a flow node")]
    NotAFlowNode(String),

    #[error("no enclosing scope for execution {0}")]
    NoEnclosingScope(Uuid),

    #[error("activity '{activity_id}' cannot be triggered")]
    NotTriggerable { activity_id: String },

    #[error("process definition not deployed: {0}")]
    DefinitionNotDeployed(Uuid),

    #[error("execution {0} has already ended")]
    ExecutionEnded(Uuid),

    #[error("corrupt execution tree: {0}")]
    CorruptTree(String),

    #[error("no outgoing sequence flow could be selected for '{activity_id}'")]
    NoOutgoingFlow { activity_id: String },

    // -----------------------------------------------------------------------
    // Business faults
    // -----------------------------------------------------------------------
    #[error("business error '{code}'")]
    BusinessFault {
        code: String,
        message: Option<String>,
    },

    #[error("unhandled business error '{code}' thrown at '{activity_id}'")]
    UnhandledBusinessFault { code: String, activity_id: String },

    /// Failure inside an activity's behavior, tagged with its position.
    #[error("activity '{activity_id}' (execution {execution_id}) failed: {source}")]
    Activity {
        execution_id: Uuid,
        activity_id: String,
        #[source]
        source: Box<EngineError>,
    },

    // -----------------------------------------------------------------------
    // Collaborators
    // -----------------------------------------------------------------------
    #[error("condition '{expression}' failed: {message}")]
    Expression { expression: String, message: String },

    #[error("service handler '{handler}' failed: {message}")]
    ServiceTask { handler: String, message: String },

    #[error("unknown service handler: '{0}'")]
    UnknownServiceHandler(String),

    #[error("unknown listener: '{0}'")]
    UnknownListener(String),

    #[error("listener '{handler}' failed: {message}")]
    Listener { handler: String, message: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("process instance {0} has already completed")]
    InstanceCompleted(Uuid),

    #[error("{0}")]
    Internal(String),

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl EngineError {
    /// Whether this error means the interpreter state is inconsistent.
    pub fn is_invariant_violation(&self) -> bool {
        match self {
            EngineError::Activity { source, .. } => source.is_invariant_violation(),
            EngineError::ExecutionNotFound(_)
            | EngineError::NoCurrentFlowElement(_)
            | EngineError::FlowElementNotFound { .. }
            | EngineError::NotAFlowNode(_)
            | EngineError::NoEnclosingScope(_)
            | EngineError::NotTriggerable { .. }
            | EngineError::DefinitionNotDeployed(_)
            | EngineError::ExecutionEnded(_)
            | EngineError::CorruptTree(_)
            | EngineError::NoOutgoingFlow { .. } => true,
            _ => false,
        }
    }

    /// Whether the unit of work lost an optimistic-locking race and can be
    /// retried from fresh state.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Repository(e) if e.is_conflict())
    }

    /// Attach the execution and activity an error escaped from. Business
    /// faults pass through untouched so they stay catchable.
    pub fn in_activity(self, execution_id: Uuid, activity_id: &str) -> Self {
        match self {
            EngineError::BusinessFault { .. }
            | EngineError::UnhandledBusinessFault { .. }
            | EngineError::Activity { .. } => self,
            other => EngineError::Activity {
                execution_id,
                activity_id: activity_id.to_string(),
                source: Box::new(other),
            },
        }
    }
}
