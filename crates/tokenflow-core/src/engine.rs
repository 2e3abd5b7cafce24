//! Engine facade: deploy definitions and drive process instances.
//!
//! Every public call runs one or more units of work. A unit of work loads
//! the instance snapshot, lets the interpreter drain the agenda against it,
//! then saves the result with an optimistic revision check. Events buffered
//! during the unit are published on the event bus only after the save
//! succeeded; a failed unit leaves the stored instance untouched.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use tokenflow_types::event::EngineEvent;
use tokenflow_types::process::ProcessDefinition;
use tokenflow_types::runtime::{
    EventType, IdentityLink, IdentityLinkType, InstanceSnapshot, Job, JobType, ProcessInstance,
    ProcessInstanceStatus,
};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::behavior::{BehaviorFactory, DefaultBehaviorFactory};
use crate::context::{CommandContext, EngineServices};
use crate::error::EngineError;
use crate::process::definition::parse_process_yaml;
use crate::process::ProcessGraph;
use crate::repository::RuntimeRepository;
use crate::runtime::InstanceState;

/// Attempts per unit of work when the instance was saved concurrently.
const MAX_CONFLICT_ATTEMPTS: u32 = 3;

// ---------------------------------------------------------------------------
// StartProcessInstance
// ---------------------------------------------------------------------------

/// Request to start the latest version of a process definition.
#[derive(Debug, Clone, Default)]
pub struct StartProcessInstance {
    pub key: String,
    pub tenant_id: Option<String>,
    pub business_key: Option<String>,
    pub variables: Map<String, Value>,
    /// Recorded as the instance's starter identity link.
    pub initiator: Option<String>,
}

impl StartProcessInstance {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Self::default()
        }
    }

    pub fn with_business_key(mut self, business_key: impl Into<String>) -> Self {
        self.business_key = Some(business_key.into());
        self
    }

    pub fn with_variables(mut self, variables: Map<String, Value>) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_initiator(mut self, initiator: impl Into<String>) -> Self {
        self.initiator = Some(initiator.into());
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }
}

// ---------------------------------------------------------------------------
// SignalDelivery
// ---------------------------------------------------------------------------

/// Outcome of a signal broadcast, per process instance.
#[derive(Debug, Default)]
pub struct SignalDelivery {
    /// Instances whose unit of work committed.
    pub delivered: Vec<Uuid>,
    /// Instances whose unit of work failed and was rolled back.
    pub failed: Vec<(Uuid, EngineError)>,
}

impl SignalDelivery {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

// ---------------------------------------------------------------------------
// ProcessEngine
// ---------------------------------------------------------------------------

/// The process engine, generic over the storage port.
pub struct ProcessEngine<R: RuntimeRepository> {
    repo: Arc<R>,
    services: Arc<EngineServices>,
    factory: Arc<dyn BehaviorFactory>,
}

impl<R: RuntimeRepository> Clone for ProcessEngine<R> {
    fn clone(&self) -> Self {
        Self {
            repo: Arc::clone(&self.repo),
            services: Arc::clone(&self.services),
            factory: Arc::clone(&self.factory),
        }
    }
}

impl<R: RuntimeRepository> ProcessEngine<R> {
    pub fn new(repo: Arc<R>, services: Arc<EngineServices>) -> Self {
        Self {
            repo,
            services,
            factory: Arc::new(DefaultBehaviorFactory),
        }
    }

    /// Bind nodes to custom behaviors. Affects graphs built afterwards.
    pub fn with_behavior_factory(mut self, factory: Arc<dyn BehaviorFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn repository(&self) -> &Arc<R> {
        &self.repo
    }

    pub fn services(&self) -> &Arc<EngineServices> {
        &self.services
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.services.event_bus.subscribe()
    }

    // -----------------------------------------------------------------------
    // Deployment
    // -----------------------------------------------------------------------

    /// Deploy `definition` as the next version of its key.
    pub async fn deploy(
        &self,
        mut definition: ProcessDefinition,
    ) -> Result<Arc<ProcessGraph>, EngineError> {
        let latest = self
            .repo
            .get_latest_definition(&definition.key, definition.tenant_id.as_deref())
            .await?;
        definition.id = Uuid::now_v7();
        definition.version = latest.map_or(1, |d| d.version + 1);

        let graph = ProcessGraph::build(definition, self.factory.as_ref())?;
        self.repo.save_definition(graph.definition()).await?;
        let graph = self.services.definitions.insert(Arc::new(graph));

        tracing::info!(
            process_definition_id = %graph.id(),
            key = %graph.definition().key,
            version = graph.definition().version,
            "process definition deployed"
        );
        Ok(graph)
    }

    pub async fn deploy_yaml(&self, yaml: &str) -> Result<Arc<ProcessGraph>, EngineError> {
        self.deploy(parse_process_yaml(yaml)?).await
    }

    /// Graph of a deployed definition, built from storage on a cache miss.
    pub async fn graph(&self, process_definition_id: Uuid) -> Result<Arc<ProcessGraph>, EngineError> {
        if let Some(graph) = self.services.definitions.get(&process_definition_id) {
            return Ok(graph);
        }
        let definition = self
            .repo
            .get_definition(&process_definition_id)
            .await?
            .ok_or(EngineError::DefinitionNotDeployed(process_definition_id))?;
        self.cache_graph(definition)
    }

    async fn latest_graph(
        &self,
        key: &str,
        tenant_id: Option<&str>,
    ) -> Result<Arc<ProcessGraph>, EngineError> {
        let definition = self
            .repo
            .get_latest_definition(key, tenant_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("process definition '{key}'")))?;
        match self.services.definitions.get(&definition.id) {
            Some(graph) => Ok(graph),
            None => self.cache_graph(definition),
        }
    }

    fn cache_graph(&self, definition: ProcessDefinition) -> Result<Arc<ProcessGraph>, EngineError> {
        let graph = ProcessGraph::build(definition, self.factory.as_ref())?;
        tracing::debug!(process_definition_id = %graph.id(), "process graph cached");
        Ok(self.services.definitions.insert(Arc::new(graph)))
    }

    // -----------------------------------------------------------------------
    // Runtime commands
    // -----------------------------------------------------------------------

    pub async fn start_process_instance(
        &self,
        request: StartProcessInstance,
    ) -> Result<ProcessInstance, EngineError> {
        let graph = self
            .latest_graph(&request.key, request.tenant_id.as_deref())
            .await?;
        let definition = graph.definition();
        let initial = graph
            .initial_node(None)
            .ok_or_else(|| EngineError::FlowElementNotFound {
                process_definition_id: definition.id,
                element_id: "<start event>".to_string(),
            })?;

        let instance_id = Uuid::now_v7();
        let mut state = InstanceState::new(ProcessInstance {
            id: instance_id,
            process_definition_id: definition.id,
            process_definition_key: definition.key.clone(),
            business_key: request.business_key.clone(),
            tenant_id: definition.tenant_id.clone(),
            status: ProcessInstanceStatus::Running,
            revision: 0,
            started_at: Utc::now(),
            ended_at: None,
        });
        let root = state.create_root_execution()?;
        for (name, value) in request.variables {
            state.set_local_variable(root, &name, value)?;
        }
        if let Some(user_id) = request.initiator {
            state.insert_identity_link(IdentityLink {
                id: Uuid::now_v7(),
                process_instance_id: instance_id,
                task_id: None,
                link_type: IdentityLinkType::Starter,
                user_id: Some(user_id),
                group_id: None,
            });
        }
        let first = state.create_child_execution(root)?;
        state.set_current_flow_element(first, Some(&initial.id))?;

        tracing::info!(
            process_instance_id = %instance_id,
            key = %definition.key,
            version = definition.version,
            "starting process instance"
        );
        let started = EngineEvent::ProcessStarted {
            process_instance_id: instance_id,
            process_definition_key: definition.key.clone(),
            business_key: request.business_key,
        };
        self.commit_unit(state, vec![started], &|ctx: &mut CommandContext<'_>| {
            ctx.agenda_mut().plan_continue_process(first);
            Ok(())
        })
        .await
    }

    /// Complete a user task, merging `variables` into the process.
    pub async fn complete_task(
        &self,
        task_id: Uuid,
        variables: Map<String, Value>,
    ) -> Result<ProcessInstance, EngineError> {
        let task = self
            .repo
            .get_task(&task_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("task {task_id}")))?;
        let payload = Value::Object(variables);
        tracing::debug!(%task_id, task_definition_key = %task.task_definition_key, "completing task");
        self.run_on_instance(task.process_instance_id, move |ctx| {
            let execution_id = ctx
                .state()
                .task(task_id)
                .map(|t| t.execution_id)
                .ok_or_else(|| EngineError::NotFound(format!("task {task_id}")))?;
            ctx.agenda_mut()
                .plan_trigger_execution(execution_id, None, Some(payload.clone()));
            Ok(())
        })
        .await
    }

    /// Signal a waiting execution directly.
    pub async fn trigger(
        &self,
        execution_id: Uuid,
        payload: Option<Value>,
    ) -> Result<ProcessInstance, EngineError> {
        let execution = self
            .repo
            .get_execution(&execution_id)
            .await?
            .ok_or(EngineError::ExecutionNotFound(execution_id))?;
        self.run_on_instance(execution.process_instance_id, move |ctx| {
            ctx.agenda_mut()
                .plan_trigger_execution(execution_id, None, payload.clone());
            Ok(())
        })
        .await
    }

    /// Deliver a message to the oldest execution of the instance waiting
    /// for it.
    pub async fn message_event_received(
        &self,
        process_instance_id: Uuid,
        message_name: &str,
        payload: Option<Value>,
    ) -> Result<ProcessInstance, EngineError> {
        let name = message_name.to_string();
        self.run_on_instance(process_instance_id, move |ctx| {
            let execution_id = ctx
                .state()
                .find_subscriptions(EventType::Message, &name)
                .first()
                .map(|s| s.execution_id)
                .ok_or_else(|| {
                    EngineError::NotFound(format!(
                        "message subscription '{name}' in process instance {process_instance_id}"
                    ))
                })?;
            ctx.agenda_mut()
                .plan_trigger_execution(execution_id, Some(name.clone()), payload.clone());
            Ok(())
        })
        .await
    }

    /// Broadcast a signal to every subscribed execution, one unit of work per
    /// process instance. A failing instance rolls back alone; the others
    /// still receive the signal.
    pub async fn signal_event_received(
        &self,
        signal_name: &str,
        payload: Option<Value>,
    ) -> Result<SignalDelivery, EngineError> {
        let subscriptions = self
            .repo
            .find_event_subscriptions(EventType::Signal, signal_name, None)
            .await?;
        let instances: BTreeSet<Uuid> = subscriptions
            .iter()
            .map(|s| s.process_instance_id)
            .collect();

        let name = signal_name.to_string();
        let mut delivery = SignalDelivery::default();
        for process_instance_id in instances {
            let payload = payload.clone();
            let name = name.clone();
            let result = self
                .run_on_instance(process_instance_id, move |ctx| {
                    let waiting: Vec<Uuid> = ctx
                        .state()
                        .find_subscriptions(EventType::Signal, &name)
                        .iter()
                        .map(|s| s.execution_id)
                        .collect();
                    for execution_id in waiting {
                        ctx.agenda_mut().plan_trigger_execution(
                            execution_id,
                            Some(name.clone()),
                            payload.clone(),
                        );
                    }
                    Ok(())
                })
                .await;
            match result {
                Ok(_) => delivery.delivered.push(process_instance_id),
                Err(e) => {
                    tracing::warn!(
                        signal = %signal_name,
                        %process_instance_id,
                        error = %e,
                        "signal delivery failed"
                    );
                    delivery.failed.push((process_instance_id, e));
                }
            }
        }
        tracing::debug!(
            signal = %signal_name,
            delivered = delivery.delivered.len(),
            failed = delivery.failed.len(),
            "signal delivered"
        );
        Ok(delivery)
    }

    /// Run an acquired job: an async continuation resumes its activity
    /// synchronously, a timer fires its catch or boundary event. The job is
    /// consumed by the same unit of work.
    pub async fn execute_job(&self, job: &Job) -> Result<(), EngineError> {
        let job_id = job.id;
        let execution_id = job.execution_id;
        let job_type = job.job_type;
        self.run_on_instance(job.process_instance_id, move |ctx| {
            if ctx.state_mut().remove_job(job_id).is_none() {
                tracing::debug!(%job_id, "job already consumed");
                return Ok(());
            }
            if ctx.state().find_execution(execution_id).is_none() {
                tracing::debug!(%job_id, %execution_id, "job execution no longer exists");
                return Ok(());
            }
            match job_type {
                JobType::AsyncContinuation => {
                    ctx.agenda_mut().plan_continue_process_synchronous(execution_id)
                }
                JobType::Timer => ctx
                    .agenda_mut()
                    .plan_trigger_execution(execution_id, None, None),
            }
            Ok(())
        })
        .await?;
        tracing::info!(%job_id, %job_type, "job executed");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn instance(
        &self,
        process_instance_id: Uuid,
    ) -> Result<Option<InstanceSnapshot>, EngineError> {
        Ok(self.repo.load_instance(&process_instance_id).await?)
    }

    // -----------------------------------------------------------------------
    // Units of work
    // -----------------------------------------------------------------------

    /// Run `seed` as a unit of work on a stored instance, retrying from
    /// fresh state when another unit saved the instance first.
    async fn run_on_instance<F>(
        &self,
        process_instance_id: Uuid,
        seed: F,
    ) -> Result<ProcessInstance, EngineError>
    where
        F: Fn(&mut CommandContext<'_>) -> Result<(), EngineError> + Send + Sync,
    {
        let mut attempt = 1;
        loop {
            let snapshot = self
                .repo
                .load_instance(&process_instance_id)
                .await?
                .ok_or_else(|| {
                    EngineError::NotFound(format!("process instance {process_instance_id}"))
                })?;
            if snapshot.instance.status == ProcessInstanceStatus::Completed {
                return Err(EngineError::InstanceCompleted(process_instance_id));
            }
            self.graph(snapshot.instance.process_definition_id).await?;

            let state = InstanceState::from_snapshot(snapshot);
            match self.commit_unit(state, Vec::new(), &seed).await {
                Err(e) if e.is_retryable() && attempt < MAX_CONFLICT_ATTEMPTS => {
                    tracing::warn!(%process_instance_id, attempt, error = %e, "unit of work conflicted, retrying");
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Drain the agenda seeded by `seed`, save the result and publish the
    /// buffered events.
    async fn commit_unit<F>(
        &self,
        state: InstanceState,
        mut events: Vec<EngineEvent>,
        seed: &F,
    ) -> Result<ProcessInstance, EngineError>
    where
        F: Fn(&mut CommandContext<'_>) -> Result<(), EngineError> + Send + Sync,
    {
        let expected_revision = state.instance().revision;
        let (mut state, unit_events) = {
            let mut ctx = CommandContext::new(&self.services, state);
            seed(&mut ctx)?;
            ctx.run_agenda()?;
            ctx.into_parts()
        };
        events.extend(unit_events);

        let process_instance_id = state.process_instance_id();
        let completed = state.root().is_none();
        if completed {
            let instance = state.instance_mut();
            instance.status = ProcessInstanceStatus::Completed;
            instance.ended_at = Some(Utc::now());
            events.push(EngineEvent::ProcessCompleted {
                process_instance_id,
            });
        }

        let mut snapshot = state.into_snapshot();
        let revision = self.repo.save_instance(&snapshot, expected_revision).await?;
        snapshot.instance.revision = revision;

        if completed {
            tracing::info!(%process_instance_id, "process instance completed");
        }
        self.services.event_bus.publish_all(events);
        Ok(snapshot.instance)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;
    use tokenflow_types::runtime::Task;

    use super::*;
    use crate::repository::InMemoryRuntimeRepository;
    use crate::service::{ServiceError, ServiceRequest};

    fn engine() -> ProcessEngine<InMemoryRuntimeRepository> {
        ProcessEngine::new(
            Arc::new(InMemoryRuntimeRepository::new()),
            Arc::new(EngineServices::default()),
        )
    }

    fn vars(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    async fn tasks(engine: &ProcessEngine<InMemoryRuntimeRepository>, id: Uuid) -> Vec<Task> {
        engine.repository().list_tasks(Some(&id)).await.unwrap()
    }

    async fn snapshot(engine: &ProcessEngine<InMemoryRuntimeRepository>, id: Uuid) -> InstanceSnapshot {
        engine.instance(id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn deploy_assigns_increasing_versions() {
        let engine = engine();
        let yaml = r#"
key: versions
nodes:
  - { id: start, type: start_event }
"#;
        let first = engine.deploy_yaml(yaml).await.unwrap();
        let second = engine.deploy_yaml(yaml).await.unwrap();
        assert_eq!(first.definition().version, 1);
        assert_eq!(second.definition().version, 2);
        assert_ne!(first.id(), second.id());
        assert_eq!(engine.repository().list_definitions().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn single_path_process_runs_to_completion() {
        let engine = engine();
        let mut events = engine.subscribe();
        engine
            .deploy_yaml(
                r#"
key: single
nodes:
  - { id: start, type: start_event }
  - { id: task_a, type: user_task, assignee: kim }
  - { id: end, type: end_event }
flows:
  - { id: f1, source: start, target: task_a }
  - { id: f2, source: task_a, target: end }
"#,
            )
            .await
            .unwrap();

        let instance = engine
            .start_process_instance(
                StartProcessInstance::new("single")
                    .with_business_key("order-7")
                    .with_initiator("sam"),
            )
            .await
            .unwrap();
        assert_eq!(instance.status, ProcessInstanceStatus::Running);
        assert_eq!(instance.revision, 1);

        let state = snapshot(&engine, instance.id).await;
        let at_task: Vec<_> = state
            .executions
            .iter()
            .filter(|e| e.current_flow_element_id.as_deref() == Some("task_a"))
            .collect();
        assert_eq!(at_task.len(), 1);
        assert!(state
            .identity_links
            .iter()
            .any(|l| l.link_type == IdentityLinkType::Starter && l.user_id.as_deref() == Some("sam")));

        let open = tasks(&engine, instance.id).await;
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].assignee.as_deref(), Some("kim"));

        let done = engine
            .complete_task(open[0].id, vars(json!({ "approved": true })))
            .await
            .unwrap();
        assert_eq!(done.status, ProcessInstanceStatus::Completed);
        assert!(done.ended_at.is_some());
        let state = snapshot(&engine, instance.id).await;
        assert!(state.executions.is_empty());
        assert!(state.tasks.is_empty());
        assert!(state.identity_links.is_empty());

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(matches!(seen.first(), Some(EngineEvent::ProcessStarted { business_key: Some(k), .. }) if k == "order-7"));
        assert!(matches!(seen.last(), Some(EngineEvent::ProcessCompleted { process_instance_id }) if *process_instance_id == instance.id));

        let err = engine.complete_task(open[0].id, Map::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn parallel_branches_join_once_both_end() {
        let engine = engine();
        engine
            .deploy_yaml(
                r#"
key: split-join
nodes:
  - { id: start, type: start_event }
  - { id: fork, type: parallel_gateway }
  - { id: left, type: user_task }
  - { id: right, type: user_task }
  - { id: join, type: parallel_gateway }
  - { id: after, type: user_task }
flows:
  - { id: f0, source: start, target: fork }
  - { id: f1, source: fork, target: left }
  - { id: f2, source: fork, target: right }
  - { id: f3, source: left, target: join }
  - { id: f4, source: right, target: join }
  - { id: f5, source: join, target: after }
"#,
            )
            .await
            .unwrap();
        let instance = engine
            .start_process_instance(StartProcessInstance::new("split-join"))
            .await
            .unwrap();

        let state = snapshot(&engine, instance.id).await;
        let branch_parents: Vec<_> = state
            .executions
            .iter()
            .filter(|e| matches!(e.current_flow_element_id.as_deref(), Some("left") | Some("right")))
            .map(|e| e.parent_id)
            .collect();
        assert_eq!(branch_parents.len(), 2);
        assert_eq!(branch_parents[0], branch_parents[1]);

        let open = tasks(&engine, instance.id).await;
        assert_eq!(open.len(), 2);
        engine.complete_task(open[0].id, Map::new()).await.unwrap();
        let after_first = tasks(&engine, instance.id).await;
        assert_eq!(after_first.len(), 1);
        assert_ne!(after_first[0].task_definition_key, "after");

        engine.complete_task(after_first[0].id, Map::new()).await.unwrap();
        let after_join = tasks(&engine, instance.id).await;
        assert_eq!(after_join.len(), 1);
        assert_eq!(after_join[0].task_definition_key, "after");
    }

    #[tokio::test]
    async fn exclusive_gateway_takes_the_matching_flow() {
        let engine = engine();
        engine
            .deploy_yaml(
                r#"
key: route
nodes:
  - { id: start, type: start_event }
  - { id: decide, type: exclusive_gateway }
  - { id: a, type: user_task }
  - { id: b, type: user_task }
flows:
  - { id: f0, source: start, target: decide }
  - { id: to_a, source: decide, target: a, condition: "x > 10" }
  - { id: to_b, source: decide, target: b, condition: "x <= 10" }
"#,
            )
            .await
            .unwrap();
        let instance = engine
            .start_process_instance(
                StartProcessInstance::new("route").with_variables(vars(json!({ "x": 5 }))),
            )
            .await
            .unwrap();

        let state = snapshot(&engine, instance.id).await;
        let positioned: Vec<_> = state
            .executions
            .iter()
            .filter_map(|e| e.current_flow_element_id.as_deref())
            .collect();
        assert_eq!(positioned, vec!["b"]);
    }

    #[tokio::test]
    async fn async_task_waits_for_its_job() {
        let engine = engine();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        engine.services().service_handlers.register(
            "count",
            Arc::new(move |_: &ServiceRequest<'_>| -> Result<Map<String, Value>, ServiceError> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Map::new())
            }),
        );
        engine
            .deploy_yaml(
                r#"
key: deferred
nodes:
  - { id: start, type: start_event }
  - { id: work, type: service_task, handler: count, async: true }
  - { id: end, type: end_event }
flows:
  - { id: f0, source: start, target: work }
  - { id: f1, source: work, target: end }
"#,
            )
            .await
            .unwrap();
        let instance = engine
            .start_process_instance(StartProcessInstance::new("deferred"))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let jobs = engine.repository().list_jobs(Some(&instance.id)).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_type, JobType::AsyncContinuation);

        engine.execute_job(&jobs[0]).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let state = snapshot(&engine, instance.id).await;
        assert_eq!(state.instance.status, ProcessInstanceStatus::Completed);
        assert!(state.jobs.is_empty());

        // A second delivery of the same job is a no-op.
        let err = engine.execute_job(&jobs[0]).await.unwrap_err();
        assert!(matches!(err, EngineError::InstanceCompleted(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn interrupting_signal_destroys_sub_process_scope() {
        let engine = engine();
        engine
            .deploy_yaml(
                r#"
key: cancellable
nodes:
  - { id: start, type: start_event }
  - id: work
    type: sub_process
    nodes:
      - { id: w_start, type: start_event }
      - { id: w_fork, type: parallel_gateway }
      - { id: w_review, type: user_task }
      - { id: w_sign, type: user_task }
      - id: w_wait
        type: intermediate_catch_event
        event: { kind: timer, duration_secs: 86400 }
    flows:
      - { id: w0, source: w_start, target: w_fork }
      - { id: w1, source: w_fork, target: w_review }
      - { id: w2, source: w_fork, target: w_sign }
      - { id: w3, source: w_fork, target: w_wait }
  - id: cancel
    type: boundary_event
    attached_to: work
    event: { kind: signal, name: cancel }
  - { id: cleanup, type: user_task }
  - { id: end, type: end_event }
flows:
  - { id: f0, source: start, target: work }
  - { id: f1, source: work, target: end }
  - { id: f2, source: cancel, target: cleanup }
"#,
            )
            .await
            .unwrap();
        let instance = engine
            .start_process_instance(StartProcessInstance::new("cancellable"))
            .await
            .unwrap();

        let before = snapshot(&engine, instance.id).await;
        let scope = before
            .executions
            .iter()
            .find(|e| e.current_flow_element_id.as_deref() == Some("work"))
            .unwrap()
            .id;
        let inside: Vec<_> = before
            .executions
            .iter()
            .filter(|e| e.parent_id == Some(scope))
            .filter(|e| e.current_flow_element_id.as_deref() != Some("cancel"))
            .collect();
        assert_eq!(inside.len(), 3);
        assert_eq!(before.tasks.len(), 2);
        assert_eq!(before.jobs.len(), 1);

        let signalled = engine.signal_event_received("cancel", None).await.unwrap();
        assert_eq!(signalled.delivered, vec![instance.id]);
        assert!(signalled.is_complete());

        let after = snapshot(&engine, instance.id).await;
        assert!(after.executions.iter().all(|e| e.id != scope));
        assert!(after.executions.iter().all(|e| inside.iter().all(|i| i.id != e.id)));
        assert!(after.jobs.is_empty());
        assert!(after.event_subscriptions.is_empty());
        let remaining: Vec<_> = after.tasks.iter().map(|t| t.task_definition_key.as_str()).collect();
        assert_eq!(remaining, vec!["cleanup"]);
        assert_eq!(after.executions.len(), 2);
    }

    #[tokio::test]
    async fn signal_reaches_remaining_instances_when_one_fails() {
        let engine = engine();
        engine.services().service_handlers.register(
            "charge",
            Arc::new(|req: &ServiceRequest<'_>| -> Result<Map<String, Value>, ServiceError> {
                if req.variables.get("declined") == Some(&Value::Bool(true)) {
                    return Err(ServiceError::Failed("boom".into()));
                }
                Ok(Map::new())
            }),
        );
        engine
            .deploy_yaml(
                r#"
key: batch
nodes:
  - { id: start, type: start_event }
  - id: wait
    type: intermediate_catch_event
    event: { kind: signal, name: go }
  - { id: charge, type: service_task, handler: charge }
  - { id: after, type: user_task }
flows:
  - { id: f0, source: start, target: wait }
  - { id: f1, source: wait, target: charge }
  - { id: f2, source: charge, target: after }
"#,
            )
            .await
            .unwrap();

        let mut started = Vec::new();
        for declined in [false, true, false] {
            let instance = engine
                .start_process_instance(
                    StartProcessInstance::new("batch")
                        .with_variables(vars(json!({ "declined": declined }))),
                )
                .await
                .unwrap();
            started.push(instance.id);
        }

        let delivery = engine.signal_event_received("go", None).await.unwrap();
        assert!(!delivery.is_complete());
        assert_eq!(delivery.failed.len(), 1);
        assert_eq!(delivery.failed[0].0, started[1]);
        assert!(matches!(
            delivery.failed[0].1,
            EngineError::ServiceTask { .. } | EngineError::Activity { .. }
        ));
        let mut delivered = delivery.delivered.clone();
        delivered.sort();
        let mut expected = vec![started[0], started[2]];
        expected.sort();
        assert_eq!(delivered, expected);

        for id in [started[0], started[2]] {
            let keys: Vec<_> = tasks(&engine, id)
                .await
                .into_iter()
                .map(|t| t.task_definition_key)
                .collect();
            assert_eq!(keys, vec!["after".to_string()]);
        }
        let stuck = snapshot(&engine, started[1]).await;
        assert!(stuck.tasks.is_empty());
        assert_eq!(stuck.event_subscriptions.len(), 1);

        // Only the rolled-back instance is still waiting for the signal.
        let retry = engine.signal_event_received("go", None).await.unwrap();
        assert!(retry.delivered.is_empty());
        assert_eq!(retry.failed.len(), 1);
        assert_eq!(retry.failed[0].0, started[1]);
    }

    #[tokio::test]
    async fn message_reaches_waiting_catch_event() {
        let engine = engine();
        engine
            .deploy_yaml(
                r#"
key: await-payment
nodes:
  - { id: start, type: start_event }
  - id: paid
    type: intermediate_catch_event
    event: { kind: message, name: payment-received }
  - { id: end, type: end_event }
flows:
  - { id: f0, source: start, target: paid }
  - { id: f1, source: paid, target: end }
"#,
            )
            .await
            .unwrap();
        let instance = engine
            .start_process_instance(StartProcessInstance::new("await-payment"))
            .await
            .unwrap();

        let err = engine
            .message_event_received(instance.id, "refund", None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));

        let done = engine
            .message_event_received(instance.id, "payment-received", Some(json!({ "amount": 30 })))
            .await
            .unwrap();
        assert_eq!(done.status, ProcessInstanceStatus::Completed);
    }

    #[tokio::test]
    async fn failed_unit_of_work_is_not_saved() {
        let engine = engine();
        engine
            .deploy_yaml(
                r#"
key: fragile
nodes:
  - { id: start, type: start_event }
  - { id: review, type: user_task }
  - { id: charge, type: service_task, handler: missing }
flows:
  - { id: f0, source: start, target: review }
  - { id: f1, source: review, target: charge }
"#,
            )
            .await
            .unwrap();
        let instance = engine
            .start_process_instance(StartProcessInstance::new("fragile"))
            .await
            .unwrap();
        let task = tasks(&engine, instance.id).await.remove(0);

        let err = engine.complete_task(task.id, Map::new()).await.unwrap_err();
        assert!(!err.is_invariant_violation());
        let state = snapshot(&engine, instance.id).await;
        assert_eq!(state.instance.revision, instance.revision);
        assert_eq!(state.tasks.len(), 1);
    }

    #[tokio::test]
    async fn unknown_definition_key_is_not_found() {
        let engine = engine();
        let err = engine
            .start_process_instance(StartProcessInstance::new("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }
}
