//! Per-unit-of-work command context and the run loop that drains the agenda.
//!
//! A `CommandContext` owns the in-memory `InstanceState` of one process
//! instance and the agenda of operations. Operations and behaviors receive
//! `&mut CommandContext` and reach shared collaborators (definition cache,
//! condition evaluator, handler registries) through `EngineServices`.
//! Events are buffered here and only published once the engine has
//! persisted the resulting state.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokenflow_types::config::EngineConfig;
use tokenflow_types::event::EngineEvent;
use tokenflow_types::process::{ListenerDefinition, ListenerEvent};
use tokenflow_types::runtime::{EventSubscription, EventType, Job, JobType};
use uuid::Uuid;

use crate::agenda::Agenda;
use crate::error::EngineError;
use crate::event::EventBus;
use crate::expression::{ConditionEvaluator, JexlConditionEvaluator};
use crate::listener::{listeners_for, ListenerInvocation, ListenerRegistry};
use crate::process::{DefinitionCache, FlowElement, FlowNode, ProcessGraph, SequenceFlow};
use crate::runtime::InstanceState;
use crate::service::ServiceRegistry;

// ---------------------------------------------------------------------------
// EngineServices
// ---------------------------------------------------------------------------

/// Collaborators shared by every unit of work.
pub struct EngineServices {
    pub definitions: DefinitionCache,
    pub conditions: Arc<dyn ConditionEvaluator>,
    pub service_handlers: ServiceRegistry,
    pub listeners: ListenerRegistry,
    pub event_bus: EventBus,
    pub config: EngineConfig,
}

impl EngineServices {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            definitions: DefinitionCache::new(),
            conditions: Arc::new(JexlConditionEvaluator::new()),
            service_handlers: ServiceRegistry::new(),
            listeners: ListenerRegistry::new(),
            event_bus: EventBus::new(config.event_bus_capacity),
            config,
        }
    }

    /// Replace the JEXL evaluator with another condition language.
    pub fn with_condition_evaluator(mut self, evaluator: Arc<dyn ConditionEvaluator>) -> Self {
        self.conditions = evaluator;
        self
    }
}

impl Default for EngineServices {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl std::fmt::Debug for EngineServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineServices")
            .field("definitions", &self.definitions.len())
            .field("service_handlers", &self.service_handlers)
            .field("listeners", &self.listeners)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// CommandContext
// ---------------------------------------------------------------------------

pub struct CommandContext<'a> {
    services: &'a EngineServices,
    state: InstanceState,
    agenda: Agenda,
    events: Vec<EngineEvent>,
}

impl<'a> CommandContext<'a> {
    pub fn new(services: &'a EngineServices, state: InstanceState) -> Self {
        Self {
            services,
            state,
            agenda: Agenda::new(),
            events: Vec::new(),
        }
    }

    pub fn services(&self) -> &'a EngineServices {
        self.services
    }

    pub fn state(&self) -> &InstanceState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut InstanceState {
        &mut self.state
    }

    pub fn agenda(&self) -> &Agenda {
        &self.agenda
    }

    pub fn agenda_mut(&mut self) -> &mut Agenda {
        &mut self.agenda
    }

    pub fn process_instance_id(&self) -> Uuid {
        self.state.process_instance_id()
    }

    /// Buffer an event for publication after commit.
    pub fn emit(&mut self, event: EngineEvent) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[EngineEvent] {
        &self.events
    }

    /// Hand back the mutated state and the buffered events.
    pub fn into_parts(self) -> (InstanceState, Vec<EngineEvent>) {
        (self.state, self.events)
    }

    // -----------------------------------------------------------------------
    // Graph lookups
    // -----------------------------------------------------------------------

    pub fn graph(&self, process_definition_id: Uuid) -> Result<Arc<ProcessGraph>, EngineError> {
        self.services
            .definitions
            .get(&process_definition_id)
            .ok_or(EngineError::DefinitionNotDeployed(process_definition_id))
    }

    pub fn graph_for(&self, execution_id: Uuid) -> Result<Arc<ProcessGraph>, EngineError> {
        let execution = self.state.execution(execution_id)?;
        self.graph(execution.process_definition_id)
    }

    /// Resolve the element an execution is positioned on.
    pub fn find_current_flow_element(&self, execution_id: Uuid) -> Result<FlowElement, EngineError> {
        let execution = self.state.execution(execution_id)?;
        let element_id = execution
            .current_flow_element_id
            .as_deref()
            .ok_or(EngineError::NoCurrentFlowElement(execution_id))?;
        let graph = self.graph(execution.process_definition_id)?;
        graph
            .get_flow_element(element_id, true)
            .ok_or_else(|| EngineError::FlowElementNotFound {
                process_definition_id: execution.process_definition_id,
                element_id: element_id.to_string(),
            })
    }

    /// Like [`find_current_flow_element`](Self::find_current_flow_element)
    /// but the element must be a node.
    pub fn current_node(&self, execution_id: Uuid) -> Result<Arc<FlowNode>, EngineError> {
        match self.find_current_flow_element(execution_id)? {
            FlowElement::Node(node) => Ok(node),
            FlowElement::Flow(flow) => Err(EngineError::NotAFlowNode(flow.id.clone())),
        }
    }

    // -----------------------------------------------------------------------
    // Collaborators
    // -----------------------------------------------------------------------

    /// Run the listeners registered for `event`, in declaration order.
    pub fn fire_listeners(
        &self,
        definitions: &[ListenerDefinition],
        event: ListenerEvent,
        execution_id: Uuid,
        element_id: &str,
    ) -> Result<(), EngineError> {
        let mut matching = listeners_for(definitions, event).peekable();
        if matching.peek().is_none() {
            return Ok(());
        }
        let variables = self.state.visible_variables(execution_id)?;
        for definition in matching {
            let listener = self
                .services
                .listeners
                .get(&definition.handler)
                .ok_or_else(|| EngineError::UnknownListener(definition.handler.clone()))?;
            let invocation = ListenerInvocation {
                event,
                process_instance_id: self.process_instance_id(),
                execution_id,
                element_id,
                variables: &variables,
            };
            listener
                .notify(&invocation)
                .map_err(|e| EngineError::Listener {
                    handler: definition.handler.clone(),
                    message: format!("{e:#}"),
                })?;
        }
        Ok(())
    }

    /// A flow without a condition is always takeable.
    pub fn has_true_condition(
        &self,
        flow: &SequenceFlow,
        execution_id: Uuid,
    ) -> Result<bool, EngineError> {
        let Some(expression) = &flow.condition else {
            return Ok(true);
        };
        let variables = self.state.visible_variables(execution_id)?;
        self.services
            .conditions
            .evaluate(expression, &variables)
            .map_err(|e| EngineError::Expression {
                expression: expression.clone(),
                message: e.to_string(),
            })
    }

    pub fn create_job(
        &mut self,
        execution_id: Uuid,
        job_type: JobType,
        activity_id: &str,
        exclusive: bool,
        due_at: DateTime<Utc>,
    ) -> Result<Uuid, EngineError> {
        let execution = self.state.execution(execution_id)?;
        let job = Job {
            id: Uuid::now_v7(),
            job_type,
            execution_id,
            process_instance_id: execution.process_instance_id,
            process_definition_id: execution.process_definition_id,
            activity_id: Some(activity_id.to_string()),
            exclusive,
            tenant_id: execution.tenant_id.clone(),
            retries: self.services.config.job_executor.default_retries,
            due_at,
            lock_owner: None,
            lock_expires_at: None,
            exception_message: None,
            created_at: Utc::now(),
        };
        let id = job.id;
        tracing::debug!(job_id = %id, %job_type, activity_id, "job created");
        self.emit(EngineEvent::JobCreated {
            process_instance_id: job.process_instance_id,
            job_id: id,
            job_type: job_type.to_string(),
        });
        self.state.insert_job(job);
        Ok(id)
    }

    pub fn create_subscription(
        &mut self,
        execution_id: Uuid,
        event_type: EventType,
        event_name: &str,
        activity_id: &str,
    ) -> Result<Uuid, EngineError> {
        let execution = self.state.execution(execution_id)?;
        let subscription = EventSubscription {
            id: Uuid::now_v7(),
            event_type,
            event_name: event_name.to_string(),
            execution_id,
            process_instance_id: execution.process_instance_id,
            activity_id: activity_id.to_string(),
            created_at: Utc::now(),
        };
        let id = subscription.id;
        self.state.insert_subscription(subscription);
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Run loop
    // -----------------------------------------------------------------------

    /// Drain the agenda, then give inactive-aware behaviors one chance to
    /// react to what the unit of work changed.
    pub fn run_agenda(&mut self) -> Result<(), EngineError> {
        self.drain()?;
        if self.agenda.involved_executions().next().is_some() {
            self.agenda.plan_execute_inactive_behaviors();
            self.drain()?;
        }
        Ok(())
    }

    fn drain(&mut self) -> Result<(), EngineError> {
        while let Some(operation) = self.agenda.next_operation() {
            if let Some(execution_id) = operation.execution_id() {
                match self.state.find_execution(execution_id) {
                    None => {
                        tracing::trace!(
                            operation = operation.name(),
                            %execution_id,
                            "skipping operation for removed execution"
                        );
                        continue;
                    }
                    Some(execution) if execution.is_ended => {
                        tracing::trace!(
                            operation = operation.name(),
                            %execution_id,
                            "skipping operation for ended execution"
                        );
                        continue;
                    }
                    Some(_) => {}
                }
            }
            tracing::trace!(
                operation = operation.name(),
                execution_id = ?operation.execution_id(),
                "running operation"
            );
            operation.run(self)?;
        }
        Ok(())
    }
}
