//! Runtime repository trait definition.
//!
//! Storage interface for deployed process definitions and for the runtime
//! state of process instances. The engine loads one `InstanceSnapshot` per
//! unit of work and writes it back in a single call; the remaining queries
//! serve the job executor and the CLI.

use chrono::{DateTime, Utc};
use tokenflow_types::error::RepositoryError;
use tokenflow_types::process::ProcessDefinition;
use tokenflow_types::runtime::{
    EventSubscription, EventType, Execution, InstanceSnapshot, Job, ProcessInstance,
    ProcessInstanceStatus, Task,
};
use uuid::Uuid;

/// Repository trait for process definitions and instance state.
///
/// Covers four entity families:
/// - **Definitions:** versioned, immutable once deployed.
/// - **Instances:** whole-instance snapshots guarded by a revision number.
/// - **Jobs:** acquisition with lock owner and expiry, failure bookkeeping.
/// - **Lookups:** tasks, executions and event subscriptions across instances.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait RuntimeRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Store a deployed definition. Fails with `Conflict` if the key and
    /// version (per tenant) already exist.
    fn save_definition(
        &self,
        def: &ProcessDefinition,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_definition(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<ProcessDefinition>, RepositoryError>> + Send;

    /// Highest version deployed under `key` for the tenant.
    fn get_latest_definition(
        &self,
        key: &str,
        tenant_id: Option<&str>,
    ) -> impl std::future::Future<Output = Result<Option<ProcessDefinition>, RepositoryError>> + Send;

    /// All deployed definitions, ordered by key then version.
    fn list_definitions(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<ProcessDefinition>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Instances
    // -----------------------------------------------------------------------

    fn load_instance(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<InstanceSnapshot>, RepositoryError>> + Send;

    /// Replace the stored state of an instance with `snapshot`.
    ///
    /// `expected_revision` is the revision the snapshot was loaded at (zero
    /// for a new instance). A mismatch fails with `Conflict` and writes
    /// nothing. Returns the new revision.
    fn save_instance(
        &self,
        snapshot: &InstanceSnapshot,
        expected_revision: i64,
    ) -> impl std::future::Future<Output = Result<i64, RepositoryError>> + Send;

    /// Instance headers, newest first.
    fn list_instances(
        &self,
        status: Option<ProcessInstanceStatus>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<ProcessInstance>, RepositoryError>> + Send;

    fn get_execution(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Execution>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Tasks and event subscriptions
    // -----------------------------------------------------------------------

    fn get_task(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Task>, RepositoryError>> + Send;

    /// Open tasks, optionally of one instance, oldest first.
    fn list_tasks(
        &self,
        process_instance_id: Option<&Uuid>,
    ) -> impl std::future::Future<Output = Result<Vec<Task>, RepositoryError>> + Send;

    /// Subscriptions waiting for `event_name`, optionally within one
    /// instance, oldest first.
    fn find_event_subscriptions(
        &self,
        event_type: EventType,
        event_name: &str,
        process_instance_id: Option<&Uuid>,
    ) -> impl std::future::Future<Output = Result<Vec<EventSubscription>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Jobs
    // -----------------------------------------------------------------------

    /// Lock up to `limit` executable jobs for `owner` until `lock_until`.
    ///
    /// A job is executable when it has retries left, is due at `now`, and is
    /// unlocked or its lock has expired. Bumps the revision of every
    /// instance whose jobs were locked.
    fn acquire_jobs(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        lock_until: DateTime<Utc>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<Job>, RepositoryError>> + Send;

    fn get_job(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Job>, RepositoryError>> + Send;

    /// Jobs including dead letters, optionally of one instance.
    fn list_jobs(
        &self,
        process_instance_id: Option<&Uuid>,
    ) -> impl std::future::Future<Output = Result<Vec<Job>, RepositoryError>> + Send;

    /// Store the outcome of a failed attempt: remaining retries, next due
    /// time and the failure message. Releases the lock.
    fn record_job_failure(
        &self,
        job_id: &Uuid,
        retries: u32,
        due_at: DateTime<Utc>,
        message: &str,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}
