//! Service-task handlers.
//!
//! A service task names a handler; the engine looks the name up in a
//! `ServiceRegistry` and calls it synchronously inside the unit of work.
//! Handlers return variables to merge into the process, a business error
//! that boundary events may catch, or a technical failure that aborts the
//! unit of work (and, inside a job, triggers a retry).

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{Map, Value};
use uuid::Uuid;

/// Input handed to a service handler.
#[derive(Debug)]
pub struct ServiceRequest<'a> {
    pub process_instance_id: Uuid,
    pub execution_id: Uuid,
    pub activity_id: &'a str,
    pub variables: &'a Map<String, Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Modelled failure, routed to a matching error boundary event.
    #[error("business error '{code}'")]
    Business {
        code: String,
        message: Option<String>,
    },

    #[error("{0}")]
    Failed(String),
}

impl From<anyhow::Error> for ServiceError {
    fn from(err: anyhow::Error) -> Self {
        ServiceError::Failed(format!("{err:#}"))
    }
}

pub trait ServiceHandler: Send + Sync {
    /// Run the handler. Returned entries become process variables.
    fn invoke(&self, request: &ServiceRequest<'_>) -> Result<Map<String, Value>, ServiceError>;
}

impl<F> ServiceHandler for F
where
    F: Fn(&ServiceRequest<'_>) -> Result<Map<String, Value>, ServiceError> + Send + Sync,
{
    fn invoke(&self, request: &ServiceRequest<'_>) -> Result<Map<String, Value>, ServiceError> {
        self(request)
    }
}

/// Named service handlers available to definitions.
#[derive(Default)]
pub struct ServiceRegistry {
    handlers: DashMap<String, Arc<dyn ServiceHandler>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn ServiceHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ServiceHandler>> {
        self.handlers.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}
