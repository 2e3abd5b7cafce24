//! In-memory `RuntimeRepository`.
//!
//! Keeps whole snapshots behind a mutex. Used by the engine's tests and by
//! embedders that do not need durability.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokenflow_types::error::RepositoryError;
use tokenflow_types::process::ProcessDefinition;
use tokenflow_types::runtime::{
    EventSubscription, EventType, Execution, InstanceSnapshot, Job, ProcessInstance,
    ProcessInstanceStatus, Task,
};
use uuid::Uuid;

use super::runtime::RuntimeRepository;

#[derive(Debug, Default)]
struct Store {
    definitions: BTreeMap<Uuid, ProcessDefinition>,
    instances: BTreeMap<Uuid, InstanceSnapshot>,
}

impl Store {
    fn snapshots(&self, process_instance_id: Option<&Uuid>) -> impl Iterator<Item = &InstanceSnapshot> {
        self.instances
            .values()
            .filter(move |s| process_instance_id.is_none_or(|id| s.instance.id == *id))
    }
}

/// `RuntimeRepository` over a mutex-guarded map of snapshots.
#[derive(Debug, Default)]
pub struct InMemoryRuntimeRepository {
    store: Mutex<Store>,
}

impl InMemoryRuntimeRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Store>, RepositoryError> {
        self.store
            .lock()
            .map_err(|_| RepositoryError::Query("in-memory store poisoned".to_string()))
    }
}

impl RuntimeRepository for InMemoryRuntimeRepository {
    async fn save_definition(&self, def: &ProcessDefinition) -> Result<(), RepositoryError> {
        let mut store = self.lock()?;
        let duplicate = store.definitions.values().any(|existing| {
            existing.key == def.key
                && existing.version == def.version
                && existing.tenant_id == def.tenant_id
        });
        if duplicate {
            return Err(RepositoryError::Conflict(format!(
                "definition '{}' version {} already deployed",
                def.key, def.version
            )));
        }
        store.definitions.insert(def.id, def.clone());
        Ok(())
    }

    async fn get_definition(&self, id: &Uuid) -> Result<Option<ProcessDefinition>, RepositoryError> {
        Ok(self.lock()?.definitions.get(id).cloned())
    }

    async fn get_latest_definition(
        &self,
        key: &str,
        tenant_id: Option<&str>,
    ) -> Result<Option<ProcessDefinition>, RepositoryError> {
        Ok(self
            .lock()?
            .definitions
            .values()
            .filter(|d| d.key == key && d.tenant_id.as_deref() == tenant_id)
            .max_by_key(|d| d.version)
            .cloned())
    }

    async fn list_definitions(&self) -> Result<Vec<ProcessDefinition>, RepositoryError> {
        let mut defs: Vec<_> = self.lock()?.definitions.values().cloned().collect();
        defs.sort_by(|a, b| a.key.cmp(&b.key).then(a.version.cmp(&b.version)));
        Ok(defs)
    }

    async fn load_instance(&self, id: &Uuid) -> Result<Option<InstanceSnapshot>, RepositoryError> {
        Ok(self.lock()?.instances.get(id).cloned())
    }

    async fn save_instance(
        &self,
        snapshot: &InstanceSnapshot,
        expected_revision: i64,
    ) -> Result<i64, RepositoryError> {
        let mut store = self.lock()?;
        let id = snapshot.instance.id;
        let stored_revision = store.instances.get(&id).map_or(0, |s| s.instance.revision);
        if stored_revision != expected_revision {
            return Err(RepositoryError::Conflict(format!(
                "process instance {id}: expected revision {expected_revision}, found {stored_revision}"
            )));
        }
        let mut saved = snapshot.clone();
        saved.instance.revision = expected_revision + 1;
        store.instances.insert(id, saved);
        Ok(expected_revision + 1)
    }

    async fn list_instances(
        &self,
        status: Option<ProcessInstanceStatus>,
        limit: u32,
    ) -> Result<Vec<ProcessInstance>, RepositoryError> {
        let store = self.lock()?;
        let mut instances: Vec<_> = store
            .instances
            .values()
            .map(|s| s.instance.clone())
            .filter(|i| status.is_none_or(|wanted| i.status == wanted))
            .collect();
        instances.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        instances.truncate(limit as usize);
        Ok(instances)
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<Execution>, RepositoryError> {
        Ok(self
            .lock()?
            .instances
            .values()
            .flat_map(|s| s.executions.iter())
            .find(|e| e.id == *id)
            .cloned())
    }

    async fn get_task(&self, id: &Uuid) -> Result<Option<Task>, RepositoryError> {
        Ok(self
            .lock()?
            .instances
            .values()
            .flat_map(|s| s.tasks.iter())
            .find(|t| t.id == *id)
            .cloned())
    }

    async fn list_tasks(&self, process_instance_id: Option<&Uuid>) -> Result<Vec<Task>, RepositoryError> {
        let store = self.lock()?;
        let mut tasks: Vec<_> = store
            .snapshots(process_instance_id)
            .flat_map(|s| s.tasks.iter().cloned())
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(tasks)
    }

    async fn find_event_subscriptions(
        &self,
        event_type: EventType,
        event_name: &str,
        process_instance_id: Option<&Uuid>,
    ) -> Result<Vec<EventSubscription>, RepositoryError> {
        let store = self.lock()?;
        let mut subscriptions: Vec<_> = store
            .snapshots(process_instance_id)
            .flat_map(|s| s.event_subscriptions.iter())
            .filter(|s| s.event_type == event_type && s.event_name == event_name)
            .cloned()
            .collect();
        subscriptions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(subscriptions)
    }

    async fn acquire_jobs(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        lock_until: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Job>, RepositoryError> {
        let mut store = self.lock()?;
        let mut candidates: Vec<(DateTime<Utc>, Uuid, Uuid)> = store
            .instances
            .values()
            .flat_map(|s| s.jobs.iter())
            .filter(|j| is_acquirable(j, now))
            .map(|j| (j.due_at, j.id, j.process_instance_id))
            .collect();
        candidates.sort();
        candidates.truncate(limit as usize);

        let mut acquired = Vec::with_capacity(candidates.len());
        for (_, job_id, instance_id) in candidates {
            let Some(snapshot) = store.instances.get_mut(&instance_id) else {
                continue;
            };
            if let Some(job) = snapshot.jobs.iter_mut().find(|j| j.id == job_id) {
                job.lock_owner = Some(owner.to_string());
                job.lock_expires_at = Some(lock_until);
                acquired.push(job.clone());
                snapshot.instance.revision += 1;
            }
        }
        Ok(acquired)
    }

    async fn get_job(&self, id: &Uuid) -> Result<Option<Job>, RepositoryError> {
        Ok(self
            .lock()?
            .instances
            .values()
            .flat_map(|s| s.jobs.iter())
            .find(|j| j.id == *id)
            .cloned())
    }

    async fn list_jobs(&self, process_instance_id: Option<&Uuid>) -> Result<Vec<Job>, RepositoryError> {
        let store = self.lock()?;
        let mut jobs: Vec<_> = store
            .snapshots(process_instance_id)
            .flat_map(|s| s.jobs.iter().cloned())
            .collect();
        jobs.sort_by(|a, b| a.due_at.cmp(&b.due_at).then(a.id.cmp(&b.id)));
        Ok(jobs)
    }

    async fn record_job_failure(
        &self,
        job_id: &Uuid,
        retries: u32,
        due_at: DateTime<Utc>,
        message: &str,
    ) -> Result<(), RepositoryError> {
        let mut store = self.lock()?;
        for snapshot in store.instances.values_mut() {
            if let Some(job) = snapshot.jobs.iter_mut().find(|j| j.id == *job_id) {
                job.retries = retries;
                job.due_at = due_at;
                job.exception_message = Some(message.to_string());
                job.lock_owner = None;
                job.lock_expires_at = None;
                snapshot.instance.revision += 1;
                return Ok(());
            }
        }
        Err(RepositoryError::NotFound)
    }
}

/// Due, with retries left, and not held by a live lock.
pub fn is_acquirable(job: &Job, now: DateTime<Utc>) -> bool {
    job.retries > 0
        && job.due_at <= now
        && job.lock_expires_at.is_none_or(|expires| expires <= now)
}
