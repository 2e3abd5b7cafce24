//! Execution listeners: user hooks fired at start, take and end points.
//!
//! Definitions reference listeners by name; the engine resolves names
//! through a `ListenerRegistry` filled by the embedding application. A
//! listener failure aborts the unit of work.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{Map, Value};
use tokenflow_types::process::{ListenerDefinition, ListenerEvent};
use uuid::Uuid;

/// What a listener is told about the point it fires at.
#[derive(Debug)]
pub struct ListenerInvocation<'a> {
    pub event: ListenerEvent,
    pub process_instance_id: Uuid,
    pub execution_id: Uuid,
    /// Node or sequence-flow ID; the process key for process-level listeners.
    pub element_id: &'a str,
    pub variables: &'a Map<String, Value>,
}

pub trait ExecutionListener: Send + Sync {
    fn notify(&self, invocation: &ListenerInvocation<'_>) -> anyhow::Result<()>;
}

impl<F> ExecutionListener for F
where
    F: Fn(&ListenerInvocation<'_>) -> anyhow::Result<()> + Send + Sync,
{
    fn notify(&self, invocation: &ListenerInvocation<'_>) -> anyhow::Result<()> {
        self(invocation)
    }
}

/// Listener that writes each invocation to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingListener;

impl ExecutionListener for LoggingListener {
    fn notify(&self, invocation: &ListenerInvocation<'_>) -> anyhow::Result<()> {
        tracing::info!(
            event = %invocation.event,
            process_instance_id = %invocation.process_instance_id,
            execution_id = %invocation.execution_id,
            element_id = invocation.element_id,
            "execution listener"
        );
        Ok(())
    }
}

/// Named listeners available to definitions.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: DashMap<String, Arc<dyn ExecutionListener>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, listener: Arc<dyn ExecutionListener>) {
        self.listeners.insert(name.into(), listener);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ExecutionListener>> {
        self.listeners.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.listeners.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.names())
            .finish()
    }
}

/// Listener definitions registered for `event`, in declaration order.
pub fn listeners_for(
    definitions: &[ListenerDefinition],
    event: ListenerEvent,
) -> impl Iterator<Item = &ListenerDefinition> {
    definitions.iter().filter(move |l| l.event == event)
}
