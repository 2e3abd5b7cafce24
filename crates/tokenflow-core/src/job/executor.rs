//! Job executor: claims due jobs and runs them concurrently.
//!
//! Each acquisition cycle locks a batch of jobs for this executor's owner
//! name. Exclusive jobs of the same process instance are chained into one
//! task so they never race for the instance revision; every other job runs
//! in its own task. Concurrency is bounded by a semaphore and tasks are
//! tracked in a `JoinSet`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tokenflow_types::config::JobExecutorConfig;
use tokenflow_types::event::EngineEvent;
use tokenflow_types::runtime::Job;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::retry::RetryPolicy;
use crate::engine::ProcessEngine;
use crate::error::EngineError;
use crate::repository::RuntimeRepository;

/// Outcome counts of one acquisition cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct JobRunSummary {
    pub acquired: usize,
    pub succeeded: usize,
    pub failed: usize,
}

pub struct JobExecutor<R: RuntimeRepository + 'static> {
    engine: ProcessEngine<R>,
    owner: String,
    config: JobExecutorConfig,
    retry: RetryPolicy,
    permits: Arc<Semaphore>,
}

impl<R: RuntimeRepository + 'static> JobExecutor<R> {
    /// Executor configured from the engine's `[job_executor]` settings.
    pub fn new(engine: ProcessEngine<R>) -> Self {
        let config = engine.services().config.job_executor.clone();
        let permits = Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1)));
        Self {
            retry: RetryPolicy::from_config(&config),
            owner: format!("tokenflow-{}", Uuid::now_v7()),
            engine,
            config,
            permits,
        }
    }

    /// Lock owner recorded on claimed jobs.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Acquire one batch of due jobs and run it to completion.
    pub async fn run_once(&self) -> Result<JobRunSummary, EngineError> {
        let now = Utc::now();
        let jobs = self
            .engine
            .repository()
            .acquire_jobs(
                &self.owner,
                now,
                self.lock_until(now),
                self.config.acquire_batch_size,
            )
            .await?;
        let mut summary = JobRunSummary {
            acquired: jobs.len(),
            ..JobRunSummary::default()
        };
        if jobs.is_empty() {
            return Ok(summary);
        }
        tracing::debug!(owner = %self.owner, count = jobs.len(), "jobs acquired");

        let mut join_set = JoinSet::new();
        for chain in chain_exclusive_jobs(jobs) {
            let engine = self.engine.clone();
            let permits = Arc::clone(&self.permits);
            join_set.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let mut outcomes = Vec::with_capacity(chain.len());
                for job in chain {
                    let result = engine.execute_job(&job).await;
                    outcomes.push((job, result));
                }
                outcomes
            });
        }

        while let Some(joined) = join_set.join_next().await {
            let outcomes = match joined {
                Ok(outcomes) => outcomes,
                Err(e) => {
                    tracing::error!(error = %e, "job task aborted");
                    continue;
                }
            };
            for (job, result) in outcomes {
                match result {
                    Ok(()) => summary.succeeded += 1,
                    Err(e) => {
                        summary.failed += 1;
                        self.record_failure(&job, &e).await;
                    }
                }
            }
        }
        Ok(summary)
    }

    /// Poll for jobs until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker =
            tokio::time::interval(StdDuration::from_millis(self.config.poll_interval_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(owner = %self.owner, "job executor started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.run_once().await {
                Ok(summary) if summary.acquired > 0 => {
                    tracing::info!(
                        acquired = summary.acquired,
                        succeeded = summary.succeeded,
                        failed = summary.failed,
                        "job cycle finished"
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "job acquisition failed"),
            }
        }
        tracing::info!(owner = %self.owner, "job executor stopped");
    }

    fn lock_until(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        i64::try_from(self.config.lock_duration_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    async fn record_failure(&self, job: &Job, error: &EngineError) {
        if matches!(error, EngineError::InstanceCompleted(_)) {
            tracing::debug!(job_id = %job.id, "job belongs to a completed instance, dropping");
            return;
        }

        let retries_left = job.retries.saturating_sub(1);
        let attempt = self
            .config
            .default_retries
            .saturating_sub(retries_left)
            .max(1);
        let due_at = self.retry.next_due(Utc::now(), attempt);
        let message = error.to_string();

        if let Err(e) = self
            .engine
            .repository()
            .record_job_failure(&job.id, retries_left, due_at, &message)
            .await
        {
            tracing::error!(job_id = %job.id, error = %e, "failed to record job failure");
            return;
        }

        if retries_left == 0 {
            tracing::warn!(job_id = %job.id, job_type = %job.job_type, error = %message, "job dead-lettered");
        } else {
            tracing::warn!(job_id = %job.id, retries_left, %due_at, error = %message, "job failed, will retry");
        }
        self.engine.services().event_bus.publish(EngineEvent::JobFailed {
            job_id: job.id,
            error: message,
            retries_left,
        });
    }
}

/// Group jobs into chains: exclusive jobs of one process instance share a
/// chain in acquisition order, every other job is its own chain.
fn chain_exclusive_jobs(jobs: Vec<Job>) -> Vec<Vec<Job>> {
    let mut chains: Vec<Vec<Job>> = Vec::new();
    let mut exclusive: HashMap<Uuid, usize> = HashMap::new();
    for job in jobs {
        if !job.exclusive {
            chains.push(vec![job]);
            continue;
        }
        match exclusive.get(&job.process_instance_id) {
            Some(&index) => chains[index].push(job),
            None => {
                exclusive.insert(job.process_instance_id, chains.len());
                chains.push(vec![job]);
            }
        }
    }
    chains
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::{Map, Value};
    use tokenflow_types::config::EngineConfig;
    use tokenflow_types::runtime::{JobType, ProcessInstanceStatus};

    use super::*;
    use crate::context::EngineServices;
    use crate::engine::StartProcessInstance;
    use crate::repository::InMemoryRuntimeRepository;
    use crate::service::{ServiceError, ServiceRequest};

    const DEFERRED: &str = r#"
key: deferred
nodes:
  - { id: start, type: start_event }
  - { id: work, type: service_task, handler: work, async: true }
  - { id: end, type: end_event }
flows:
  - { id: f0, source: start, target: work }
  - { id: f1, source: work, target: end }
"#;

    fn engine_with(config: EngineConfig) -> ProcessEngine<InMemoryRuntimeRepository> {
        ProcessEngine::new(
            Arc::new(InMemoryRuntimeRepository::new()),
            Arc::new(EngineServices::new(config)),
        )
    }

    fn job(instance: Uuid, exclusive: bool) -> Job {
        Job {
            id: Uuid::now_v7(),
            job_type: JobType::AsyncContinuation,
            execution_id: Uuid::now_v7(),
            process_instance_id: instance,
            process_definition_id: Uuid::now_v7(),
            activity_id: None,
            exclusive,
            tenant_id: None,
            retries: 3,
            due_at: Utc::now(),
            lock_owner: None,
            lock_expires_at: None,
            exception_message: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn exclusive_jobs_of_one_instance_share_a_chain() {
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();
        let chains = chain_exclusive_jobs(vec![
            job(a, true),
            job(b, true),
            job(a, true),
            job(a, false),
        ]);
        let sizes: Vec<usize> = chains.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 1, 1]);
        assert!(chains[0].iter().all(|j| j.process_instance_id == a));
    }

    #[tokio::test]
    async fn due_jobs_are_executed() {
        let engine = engine_with(EngineConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        engine.services().service_handlers.register(
            "work",
            Arc::new(move |_: &ServiceRequest<'_>| -> Result<Map<String, Value>, ServiceError> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Map::new())
            }),
        );
        engine.deploy_yaml(DEFERRED).await.unwrap();
        let first = engine
            .start_process_instance(StartProcessInstance::new("deferred"))
            .await
            .unwrap();
        let second = engine
            .start_process_instance(StartProcessInstance::new("deferred"))
            .await
            .unwrap();

        let executor = JobExecutor::new(engine.clone()).with_owner("test-worker");
        let summary = executor.run_once().await.unwrap();
        assert_eq!(
            summary,
            JobRunSummary {
                acquired: 2,
                succeeded: 2,
                failed: 0
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        for id in [first.id, second.id] {
            let state = engine.instance(id).await.unwrap().unwrap();
            assert_eq!(state.instance.status, ProcessInstanceStatus::Completed);
        }

        let idle = executor.run_once().await.unwrap();
        assert_eq!(idle, JobRunSummary::default());
    }

    #[tokio::test]
    async fn failing_job_is_retried_later_then_dead_lettered() {
        let mut config = EngineConfig::default();
        config.job_executor.default_retries = 2;
        config.job_executor.retry_backoff_secs = 30;
        let engine = engine_with(config);
        engine.services().service_handlers.register(
            "work",
            Arc::new(|_: &ServiceRequest<'_>| -> Result<Map<String, Value>, ServiceError> {
                Err(ServiceError::Failed("downstream unavailable".into()))
            }),
        );
        engine.deploy_yaml(DEFERRED).await.unwrap();
        let instance = engine
            .start_process_instance(StartProcessInstance::new("deferred"))
            .await
            .unwrap();
        let mut events = engine.subscribe();

        let executor = JobExecutor::new(engine.clone());
        let summary = executor.run_once().await.unwrap();
        assert_eq!(summary.failed, 1);

        let jobs = engine.repository().list_jobs(Some(&instance.id)).await.unwrap();
        assert_eq!(jobs.len(), 1);
        let failed = &jobs[0];
        assert_eq!(failed.retries, 1);
        assert!(failed.lock_owner.is_none());
        assert!(failed.due_at > Utc::now() + Duration::seconds(20));
        assert!(failed
            .exception_message
            .as_deref()
            .is_some_and(|m| m.contains("downstream unavailable")));
        assert!(matches!(
            events.try_recv(),
            Ok(EngineEvent::JobFailed { retries_left: 1, .. })
        ));

        // Not due yet.
        assert_eq!(executor.run_once().await.unwrap().acquired, 0);

        let later = Utc::now() + Duration::seconds(120);
        let reacquired = engine
            .repository()
            .acquire_jobs("other", later, later + Duration::seconds(60), 10)
            .await
            .unwrap();
        assert_eq!(reacquired.len(), 1);
        let err = engine.execute_job(&reacquired[0]).await.unwrap_err();
        executor.record_failure(&reacquired[0], &err).await;

        let jobs = engine.repository().list_jobs(Some(&instance.id)).await.unwrap();
        assert!(jobs[0].is_dead_letter());
        let acquired = engine
            .repository()
            .acquire_jobs("other", later + Duration::days(1), later + Duration::days(2), 10)
            .await
            .unwrap();
        assert!(acquired.is_empty());
    }

    #[tokio::test]
    async fn zero_duration_timer_fires_on_next_cycle() {
        let engine = engine_with(EngineConfig::default());
        engine
            .deploy_yaml(
                r#"
key: pause
nodes:
  - { id: start, type: start_event }
  - id: wait
    type: intermediate_catch_event
    event: { kind: timer, duration_secs: 0 }
  - { id: end, type: end_event }
flows:
  - { id: f0, source: start, target: wait }
  - { id: f1, source: wait, target: end }
"#,
            )
            .await
            .unwrap();
        let instance = engine
            .start_process_instance(StartProcessInstance::new("pause"))
            .await
            .unwrap();
        assert_eq!(instance.status, ProcessInstanceStatus::Running);

        let summary = JobExecutor::new(engine.clone()).run_once().await.unwrap();
        assert_eq!(summary.succeeded, 1);
        let state = engine.instance(instance.id).await.unwrap().unwrap();
        assert_eq!(state.instance.status, ProcessInstanceStatus::Completed);
    }

    #[tokio::test]
    async fn run_stops_when_cancelled() {
        let engine = engine_with(EngineConfig::default());
        let executor = JobExecutor::new(engine);
        let cancel = CancellationToken::new();
        cancel.cancel();
        tokio::time::timeout(StdDuration::from_secs(5), executor.run(cancel))
            .await
            .unwrap();
    }
}
