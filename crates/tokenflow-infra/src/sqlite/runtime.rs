//! SQLite runtime repository implementation.
//!
//! Implements `RuntimeRepository` from `tokenflow-core` using sqlx with split
//! read/write pools. Definitions are stored as JSON blobs. The runtime state
//! of an instance is spread over one table per entity family and replaced
//! as a whole by `save_instance`, inside one writer transaction that first
//! checks and bumps the instance revision.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};
use tokenflow_core::repository::RuntimeRepository;
use tokenflow_types::error::RepositoryError;
use tokenflow_types::process::ProcessDefinition;
use tokenflow_types::runtime::{
    EventSubscription, EventType, Execution, IdentityLink, InstanceSnapshot, Job, ProcessInstance,
    ProcessInstanceStatus, Task, Variable,
};
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `RuntimeRepository`.
pub struct SqliteRuntimeRepository {
    pool: DatabasePool,
}

impl SqliteRuntimeRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct DefinitionRow {
    definition: String,
}

impl DefinitionRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            definition: row.try_get("definition")?,
        })
    }

    fn into_definition(self) -> Result<ProcessDefinition, RepositoryError> {
        serde_json::from_str(&self.definition)
            .map_err(|e| RepositoryError::Query(format!("invalid process definition JSON: {e}")))
    }
}

struct InstanceRow {
    id: String,
    process_definition_id: String,
    process_definition_key: String,
    business_key: Option<String>,
    tenant_id: Option<String>,
    status: String,
    revision: i64,
    started_at: String,
    ended_at: Option<String>,
}

impl InstanceRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            process_definition_id: row.try_get("process_definition_id")?,
            process_definition_key: row.try_get("process_definition_key")?,
            business_key: row.try_get("business_key")?,
            tenant_id: row.try_get("tenant_id")?,
            status: row.try_get("status")?,
            revision: row.try_get("revision")?,
            started_at: row.try_get("started_at")?,
            ended_at: row.try_get("ended_at")?,
        })
    }

    fn into_instance(self) -> Result<ProcessInstance, RepositoryError> {
        Ok(ProcessInstance {
            id: parse_uuid(&self.id)?,
            process_definition_id: parse_uuid(&self.process_definition_id)?,
            process_definition_key: self.process_definition_key,
            business_key: self.business_key,
            tenant_id: self.tenant_id,
            status: self.status.parse().map_err(RepositoryError::Query)?,
            revision: self.revision,
            started_at: parse_datetime(&self.started_at)?,
            ended_at: self.ended_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

struct ExecutionRow {
    id: String,
    process_instance_id: String,
    parent_id: Option<String>,
    process_definition_id: String,
    tenant_id: Option<String>,
    current_flow_element_id: Option<String>,
    is_active: bool,
    is_scope: bool,
    is_ended: bool,
    is_concurrent: bool,
    is_multi_instance_root: bool,
    created_at: String,
}

impl ExecutionRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            process_instance_id: row.try_get("process_instance_id")?,
            parent_id: row.try_get("parent_id")?,
            process_definition_id: row.try_get("process_definition_id")?,
            tenant_id: row.try_get("tenant_id")?,
            current_flow_element_id: row.try_get("current_flow_element_id")?,
            is_active: row.try_get("is_active")?,
            is_scope: row.try_get("is_scope")?,
            is_ended: row.try_get("is_ended")?,
            is_concurrent: row.try_get("is_concurrent")?,
            is_multi_instance_root: row.try_get("is_multi_instance_root")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_execution(self) -> Result<Execution, RepositoryError> {
        Ok(Execution {
            id: parse_uuid(&self.id)?,
            process_instance_id: parse_uuid(&self.process_instance_id)?,
            parent_id: self.parent_id.as_deref().map(parse_uuid).transpose()?,
            process_definition_id: parse_uuid(&self.process_definition_id)?,
            tenant_id: self.tenant_id,
            current_flow_element_id: self.current_flow_element_id,
            is_active: self.is_active,
            is_scope: self.is_scope,
            is_ended: self.is_ended,
            is_concurrent: self.is_concurrent,
            is_multi_instance_root: self.is_multi_instance_root,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

struct TaskRow {
    id: String,
    execution_id: String,
    process_instance_id: String,
    task_definition_key: String,
    name: Option<String>,
    assignee: Option<String>,
    created_at: String,
}

impl TaskRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            execution_id: row.try_get("execution_id")?,
            process_instance_id: row.try_get("process_instance_id")?,
            task_definition_key: row.try_get("task_definition_key")?,
            name: row.try_get("name")?,
            assignee: row.try_get("assignee")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_task(self) -> Result<Task, RepositoryError> {
        Ok(Task {
            id: parse_uuid(&self.id)?,
            execution_id: parse_uuid(&self.execution_id)?,
            process_instance_id: parse_uuid(&self.process_instance_id)?,
            task_definition_key: self.task_definition_key,
            name: self.name,
            assignee: self.assignee,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

struct JobRow {
    id: String,
    job_type: String,
    execution_id: String,
    process_instance_id: String,
    process_definition_id: String,
    activity_id: Option<String>,
    exclusive: bool,
    tenant_id: Option<String>,
    retries: i64,
    due_at: i64,
    lock_owner: Option<String>,
    lock_expires_at: Option<i64>,
    exception_message: Option<String>,
    created_at: String,
}

impl JobRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            job_type: row.try_get("job_type")?,
            execution_id: row.try_get("execution_id")?,
            process_instance_id: row.try_get("process_instance_id")?,
            process_definition_id: row.try_get("process_definition_id")?,
            activity_id: row.try_get("activity_id")?,
            exclusive: row.try_get("exclusive")?,
            tenant_id: row.try_get("tenant_id")?,
            retries: row.try_get("retries")?,
            due_at: row.try_get("due_at")?,
            lock_owner: row.try_get("lock_owner")?,
            lock_expires_at: row.try_get("lock_expires_at")?,
            exception_message: row.try_get("exception_message")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_job(self) -> Result<Job, RepositoryError> {
        Ok(Job {
            id: parse_uuid(&self.id)?,
            job_type: self.job_type.parse().map_err(RepositoryError::Query)?,
            execution_id: parse_uuid(&self.execution_id)?,
            process_instance_id: parse_uuid(&self.process_instance_id)?,
            process_definition_id: parse_uuid(&self.process_definition_id)?,
            activity_id: self.activity_id,
            exclusive: self.exclusive,
            tenant_id: self.tenant_id,
            retries: u32::try_from(self.retries)
                .map_err(|_| RepositoryError::Query(format!("invalid retries: {}", self.retries)))?,
            due_at: parse_millis(self.due_at)?,
            lock_owner: self.lock_owner,
            lock_expires_at: self.lock_expires_at.map(parse_millis).transpose()?,
            exception_message: self.exception_message,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

struct VariableRow {
    id: String,
    execution_id: String,
    process_instance_id: String,
    name: String,
    value: String,
}

impl VariableRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            execution_id: row.try_get("execution_id")?,
            process_instance_id: row.try_get("process_instance_id")?,
            name: row.try_get("name")?,
            value: row.try_get("value")?,
        })
    }

    fn into_variable(self) -> Result<Variable, RepositoryError> {
        let value = serde_json::from_str(&self.value).map_err(|e| {
            RepositoryError::Query(format!("invalid value for variable '{}': {e}", self.name))
        })?;
        Ok(Variable {
            id: parse_uuid(&self.id)?,
            execution_id: parse_uuid(&self.execution_id)?,
            process_instance_id: parse_uuid(&self.process_instance_id)?,
            name: self.name,
            value,
        })
    }
}

struct SubscriptionRow {
    id: String,
    event_type: String,
    event_name: String,
    execution_id: String,
    process_instance_id: String,
    activity_id: String,
    created_at: String,
}

impl SubscriptionRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            event_type: row.try_get("event_type")?,
            event_name: row.try_get("event_name")?,
            execution_id: row.try_get("execution_id")?,
            process_instance_id: row.try_get("process_instance_id")?,
            activity_id: row.try_get("activity_id")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_subscription(self) -> Result<EventSubscription, RepositoryError> {
        Ok(EventSubscription {
            id: parse_uuid(&self.id)?,
            event_type: self.event_type.parse().map_err(RepositoryError::Query)?,
            event_name: self.event_name,
            execution_id: parse_uuid(&self.execution_id)?,
            process_instance_id: parse_uuid(&self.process_instance_id)?,
            activity_id: self.activity_id,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

struct IdentityLinkRow {
    id: String,
    process_instance_id: String,
    task_id: Option<String>,
    link_type: String,
    user_id: Option<String>,
    group_id: Option<String>,
}

impl IdentityLinkRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            process_instance_id: row.try_get("process_instance_id")?,
            task_id: row.try_get("task_id")?,
            link_type: row.try_get("link_type")?,
            user_id: row.try_get("user_id")?,
            group_id: row.try_get("group_id")?,
        })
    }

    fn into_identity_link(self) -> Result<IdentityLink, RepositoryError> {
        Ok(IdentityLink {
            id: parse_uuid(&self.id)?,
            process_instance_id: parse_uuid(&self.process_instance_id)?,
            task_id: self.task_id.as_deref().map(parse_uuid).transpose()?,
            link_type: self.link_type.parse().map_err(RepositoryError::Query)?,
            user_id: self.user_id,
            group_id: self.group_id,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_millis(ms: i64) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| RepositoryError::Query(format!("invalid timestamp: {ms}")))
}

fn query_err(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

/// Decode every row with `decode`, failing on the first bad row.
fn decode_rows<T, R>(
    rows: &[SqliteRow],
    from_row: fn(&SqliteRow) -> Result<R, sqlx::Error>,
    decode: fn(R) -> Result<T, RepositoryError>,
) -> Result<Vec<T>, RepositoryError> {
    rows.iter()
        .map(|row| from_row(row).map_err(query_err).and_then(decode))
        .collect()
}

/// Raise the revision of every instance in `ids` by one.
async fn bump_revisions(
    tx: &mut Transaction<'_, Sqlite>,
    ids: impl IntoIterator<Item = Uuid>,
) -> Result<(), RepositoryError> {
    for id in ids {
        sqlx::query("UPDATE process_instances SET revision = revision + 1 WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut **tx)
            .await
            .map_err(query_err)?;
    }
    Ok(())
}

/// Delete the stored runtime rows of an instance, keeping its header.
async fn delete_runtime_rows(
    tx: &mut Transaction<'_, Sqlite>,
    process_instance_id: &str,
) -> Result<(), RepositoryError> {
    for table in [
        "identity_links",
        "event_subscriptions",
        "variables",
        "jobs",
        "tasks",
        "executions",
    ] {
        sqlx::query(&format!("DELETE FROM {table} WHERE process_instance_id = ?"))
            .bind(process_instance_id)
            .execute(&mut **tx)
            .await
            .map_err(query_err)?;
    }
    Ok(())
}

async fn insert_runtime_rows(
    tx: &mut Transaction<'_, Sqlite>,
    snapshot: &InstanceSnapshot,
) -> Result<(), RepositoryError> {
    for e in &snapshot.executions {
        sqlx::query(
            r#"INSERT INTO executions
               (id, process_instance_id, parent_id, process_definition_id, tenant_id,
                current_flow_element_id, is_active, is_scope, is_ended, is_concurrent,
                is_multi_instance_root, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(e.id.to_string())
        .bind(e.process_instance_id.to_string())
        .bind(e.parent_id.map(|id| id.to_string()))
        .bind(e.process_definition_id.to_string())
        .bind(&e.tenant_id)
        .bind(&e.current_flow_element_id)
        .bind(e.is_active)
        .bind(e.is_scope)
        .bind(e.is_ended)
        .bind(e.is_concurrent)
        .bind(e.is_multi_instance_root)
        .bind(format_datetime(&e.created_at))
        .execute(&mut **tx)
        .await
        .map_err(query_err)?;
    }

    for t in &snapshot.tasks {
        sqlx::query(
            r#"INSERT INTO tasks
               (id, execution_id, process_instance_id, task_definition_key, name, assignee, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(t.id.to_string())
        .bind(t.execution_id.to_string())
        .bind(t.process_instance_id.to_string())
        .bind(&t.task_definition_key)
        .bind(&t.name)
        .bind(&t.assignee)
        .bind(format_datetime(&t.created_at))
        .execute(&mut **tx)
        .await
        .map_err(query_err)?;
    }

    for j in &snapshot.jobs {
        sqlx::query(
            r#"INSERT INTO jobs
               (id, job_type, execution_id, process_instance_id, process_definition_id,
                activity_id, exclusive, tenant_id, retries, due_at, lock_owner,
                lock_expires_at, exception_message, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(j.id.to_string())
        .bind(j.job_type.to_string())
        .bind(j.execution_id.to_string())
        .bind(j.process_instance_id.to_string())
        .bind(j.process_definition_id.to_string())
        .bind(&j.activity_id)
        .bind(j.exclusive)
        .bind(&j.tenant_id)
        .bind(i64::from(j.retries))
        .bind(j.due_at.timestamp_millis())
        .bind(&j.lock_owner)
        .bind(j.lock_expires_at.map(|t| t.timestamp_millis()))
        .bind(&j.exception_message)
        .bind(format_datetime(&j.created_at))
        .execute(&mut **tx)
        .await
        .map_err(query_err)?;
    }

    for v in &snapshot.variables {
        let value = serde_json::to_string(&v.value)
            .map_err(|e| RepositoryError::Query(format!("serialize variable '{}': {e}", v.name)))?;
        sqlx::query(
            "INSERT INTO variables (id, execution_id, process_instance_id, name, value) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(v.id.to_string())
        .bind(v.execution_id.to_string())
        .bind(v.process_instance_id.to_string())
        .bind(&v.name)
        .bind(&value)
        .execute(&mut **tx)
        .await
        .map_err(query_err)?;
    }

    for s in &snapshot.event_subscriptions {
        sqlx::query(
            r#"INSERT INTO event_subscriptions
               (id, event_type, event_name, execution_id, process_instance_id, activity_id, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(s.id.to_string())
        .bind(s.event_type.to_string())
        .bind(&s.event_name)
        .bind(s.execution_id.to_string())
        .bind(s.process_instance_id.to_string())
        .bind(&s.activity_id)
        .bind(format_datetime(&s.created_at))
        .execute(&mut **tx)
        .await
        .map_err(query_err)?;
    }

    for l in &snapshot.identity_links {
        sqlx::query(
            r#"INSERT INTO identity_links (id, process_instance_id, task_id, link_type, user_id, group_id)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(l.id.to_string())
        .bind(l.process_instance_id.to_string())
        .bind(l.task_id.map(|id| id.to_string()))
        .bind(l.link_type.to_string())
        .bind(&l.user_id)
        .bind(&l.group_id)
        .execute(&mut **tx)
        .await
        .map_err(query_err)?;
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// RuntimeRepository impl
// ---------------------------------------------------------------------------

impl RuntimeRepository for SqliteRuntimeRepository {
    async fn save_definition(&self, def: &ProcessDefinition) -> Result<(), RepositoryError> {
        let definition_json = serde_json::to_string(def)
            .map_err(|e| RepositoryError::Query(format!("serialize definition: {e}")))?;

        let result = sqlx::query(
            r#"INSERT INTO process_definitions (id, key, name, version, tenant_id, definition, deployed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(def.id.to_string())
        .bind(&def.key)
        .bind(&def.name)
        .bind(i64::from(def.version))
        .bind(&def.tenant_id)
        .bind(&definition_json)
        .bind(format_datetime(&Utc::now()))
        .execute(&self.pool.writer)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.message().contains("UNIQUE") => {
                Err(RepositoryError::Conflict(format!(
                    "definition '{}' version {} already deployed",
                    def.key, def.version
                )))
            }
            Err(e) => Err(query_err(e)),
        }
    }

    async fn get_definition(&self, id: &Uuid) -> Result<Option<ProcessDefinition>, RepositoryError> {
        let row = sqlx::query("SELECT definition FROM process_definitions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        match row {
            Some(row) => {
                let r = DefinitionRow::from_row(&row).map_err(query_err)?;
                Ok(Some(r.into_definition()?))
            }
            None => Ok(None),
        }
    }

    async fn get_latest_definition(
        &self,
        key: &str,
        tenant_id: Option<&str>,
    ) -> Result<Option<ProcessDefinition>, RepositoryError> {
        let row = sqlx::query(
            "SELECT definition FROM process_definitions WHERE key = ? AND COALESCE(tenant_id, '') = ? ORDER BY version DESC LIMIT 1",
        )
        .bind(key)
        .bind(tenant_id.unwrap_or(""))
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_err)?;

        match row {
            Some(row) => {
                let r = DefinitionRow::from_row(&row).map_err(query_err)?;
                Ok(Some(r.into_definition()?))
            }
            None => Ok(None),
        }
    }

    async fn list_definitions(&self) -> Result<Vec<ProcessDefinition>, RepositoryError> {
        let rows = sqlx::query("SELECT definition FROM process_definitions ORDER BY key ASC, version ASC")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;
        decode_rows(&rows, DefinitionRow::from_row, DefinitionRow::into_definition)
    }

    async fn load_instance(&self, id: &Uuid) -> Result<Option<InstanceSnapshot>, RepositoryError> {
        let id = id.to_string();
        let Some(header) = sqlx::query("SELECT * FROM process_instances WHERE id = ?")
            .bind(&id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?
        else {
            return Ok(None);
        };
        let instance = InstanceRow::from_row(&header)
            .map_err(query_err)?
            .into_instance()?;

        let fetch = |sql: &'static str| {
            sqlx::query(sql)
                .bind(id.clone())
                .fetch_all(&self.pool.reader)
        };
        let executions = fetch("SELECT * FROM executions WHERE process_instance_id = ? ORDER BY id")
            .await
            .map_err(query_err)?;
        let tasks = fetch("SELECT * FROM tasks WHERE process_instance_id = ? ORDER BY id")
            .await
            .map_err(query_err)?;
        let jobs = fetch("SELECT * FROM jobs WHERE process_instance_id = ? ORDER BY id")
            .await
            .map_err(query_err)?;
        let variables = fetch("SELECT * FROM variables WHERE process_instance_id = ? ORDER BY id")
            .await
            .map_err(query_err)?;
        let subscriptions =
            fetch("SELECT * FROM event_subscriptions WHERE process_instance_id = ? ORDER BY id")
                .await
                .map_err(query_err)?;
        let links = fetch("SELECT * FROM identity_links WHERE process_instance_id = ? ORDER BY id")
            .await
            .map_err(query_err)?;

        Ok(Some(InstanceSnapshot {
            instance,
            executions: decode_rows(&executions, ExecutionRow::from_row, ExecutionRow::into_execution)?,
            tasks: decode_rows(&tasks, TaskRow::from_row, TaskRow::into_task)?,
            jobs: decode_rows(&jobs, JobRow::from_row, JobRow::into_job)?,
            variables: decode_rows(&variables, VariableRow::from_row, VariableRow::into_variable)?,
            event_subscriptions: decode_rows(
                &subscriptions,
                SubscriptionRow::from_row,
                SubscriptionRow::into_subscription,
            )?,
            identity_links: decode_rows(
                &links,
                IdentityLinkRow::from_row,
                IdentityLinkRow::into_identity_link,
            )?,
        }))
    }

    async fn save_instance(
        &self,
        snapshot: &InstanceSnapshot,
        expected_revision: i64,
    ) -> Result<i64, RepositoryError> {
        let instance = &snapshot.instance;
        let id = instance.id.to_string();
        let revision = expected_revision + 1;

        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        let stored: Option<(i64,)> =
            sqlx::query_as("SELECT revision FROM process_instances WHERE id = ?")
                .bind(&id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(query_err)?;
        let stored_revision = stored.map_or(0, |(r,)| r);
        if stored_revision != expected_revision {
            return Err(RepositoryError::Conflict(format!(
                "process instance {id}: expected revision {expected_revision}, found {stored_revision}"
            )));
        }

        sqlx::query(
            r#"INSERT INTO process_instances
               (id, process_definition_id, process_definition_key, business_key, tenant_id,
                status, revision, started_at, ended_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 status = excluded.status,
                 revision = excluded.revision,
                 business_key = excluded.business_key,
                 ended_at = excluded.ended_at"#,
        )
        .bind(&id)
        .bind(instance.process_definition_id.to_string())
        .bind(&instance.process_definition_key)
        .bind(&instance.business_key)
        .bind(&instance.tenant_id)
        .bind(instance.status.to_string())
        .bind(revision)
        .bind(format_datetime(&instance.started_at))
        .bind(instance.ended_at.as_ref().map(format_datetime))
        .execute(&mut *tx)
        .await
        .map_err(query_err)?;

        delete_runtime_rows(&mut tx, &id).await?;
        insert_runtime_rows(&mut tx, snapshot).await?;

        tx.commit().await.map_err(query_err)?;
        tracing::trace!(process_instance_id = %id, revision, "instance saved");
        Ok(revision)
    }

    async fn list_instances(
        &self,
        status: Option<ProcessInstanceStatus>,
        limit: u32,
    ) -> Result<Vec<ProcessInstance>, RepositoryError> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    "SELECT * FROM process_instances WHERE status = ? ORDER BY started_at DESC, id DESC LIMIT ?",
                )
                .bind(status.to_string())
                .bind(i64::from(limit))
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM process_instances ORDER BY started_at DESC, id DESC LIMIT ?")
                    .bind(i64::from(limit))
                    .fetch_all(&self.pool.reader)
                    .await
            }
        }
        .map_err(query_err)?;
        decode_rows(&rows, InstanceRow::from_row, InstanceRow::into_instance)
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<Execution>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;
        row.map(|row| ExecutionRow::from_row(&row).map_err(query_err)?.into_execution())
            .transpose()
    }

    async fn get_task(&self, id: &Uuid) -> Result<Option<Task>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;
        row.map(|row| TaskRow::from_row(&row).map_err(query_err)?.into_task())
            .transpose()
    }

    async fn list_tasks(&self, process_instance_id: Option<&Uuid>) -> Result<Vec<Task>, RepositoryError> {
        let rows = match process_instance_id {
            Some(id) => {
                sqlx::query(
                    "SELECT * FROM tasks WHERE process_instance_id = ? ORDER BY created_at ASC, id ASC",
                )
                .bind(id.to_string())
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM tasks ORDER BY created_at ASC, id ASC")
                    .fetch_all(&self.pool.reader)
                    .await
            }
        }
        .map_err(query_err)?;
        decode_rows(&rows, TaskRow::from_row, TaskRow::into_task)
    }

    async fn find_event_subscriptions(
        &self,
        event_type: EventType,
        event_name: &str,
        process_instance_id: Option<&Uuid>,
    ) -> Result<Vec<EventSubscription>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT * FROM event_subscriptions
               WHERE event_type = ? AND event_name = ?
                 AND (? IS NULL OR process_instance_id = ?)
               ORDER BY created_at ASC, id ASC"#,
        )
        .bind(event_type.to_string())
        .bind(event_name)
        .bind(process_instance_id.map(|id| id.to_string()))
        .bind(process_instance_id.map(|id| id.to_string()))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;
        decode_rows(&rows, SubscriptionRow::from_row, SubscriptionRow::into_subscription)
    }

    async fn acquire_jobs(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        lock_until: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Job>, RepositoryError> {
        let now_ms = now.timestamp_millis();
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        let rows = sqlx::query(
            r#"SELECT * FROM jobs
               WHERE retries > 0 AND due_at <= ?
                 AND (lock_expires_at IS NULL OR lock_expires_at <= ?)
               ORDER BY due_at ASC, id ASC
               LIMIT ?"#,
        )
        .bind(now_ms)
        .bind(now_ms)
        .bind(i64::from(limit))
        .fetch_all(&mut *tx)
        .await
        .map_err(query_err)?;
        let mut jobs = decode_rows(&rows, JobRow::from_row, JobRow::into_job)?;

        let mut instances = Vec::new();
        for job in &mut jobs {
            sqlx::query("UPDATE jobs SET lock_owner = ?, lock_expires_at = ? WHERE id = ?")
                .bind(owner)
                .bind(lock_until.timestamp_millis())
                .bind(job.id.to_string())
                .execute(&mut *tx)
                .await
                .map_err(query_err)?;
            job.lock_owner = Some(owner.to_string());
            job.lock_expires_at = Some(lock_until);
            if !instances.contains(&job.process_instance_id) {
                instances.push(job.process_instance_id);
            }
        }
        bump_revisions(&mut tx, instances).await?;

        tx.commit().await.map_err(query_err)?;
        Ok(jobs)
    }

    async fn get_job(&self, id: &Uuid) -> Result<Option<Job>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;
        row.map(|row| JobRow::from_row(&row).map_err(query_err)?.into_job())
            .transpose()
    }

    async fn list_jobs(&self, process_instance_id: Option<&Uuid>) -> Result<Vec<Job>, RepositoryError> {
        let rows = match process_instance_id {
            Some(id) => {
                sqlx::query("SELECT * FROM jobs WHERE process_instance_id = ? ORDER BY due_at ASC, id ASC")
                    .bind(id.to_string())
                    .fetch_all(&self.pool.reader)
                    .await
            }
            None => {
                sqlx::query("SELECT * FROM jobs ORDER BY due_at ASC, id ASC")
                    .fetch_all(&self.pool.reader)
                    .await
            }
        }
        .map_err(query_err)?;
        decode_rows(&rows, JobRow::from_row, JobRow::into_job)
    }

    async fn record_job_failure(
        &self,
        job_id: &Uuid,
        retries: u32,
        due_at: DateTime<Utc>,
        message: &str,
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        let instance: Option<(String,)> =
            sqlx::query_as("SELECT process_instance_id FROM jobs WHERE id = ?")
                .bind(job_id.to_string())
                .fetch_optional(&mut *tx)
                .await
                .map_err(query_err)?;
        let Some((process_instance_id,)) = instance else {
            return Err(RepositoryError::NotFound);
        };

        sqlx::query(
            r#"UPDATE jobs
               SET retries = ?, due_at = ?, exception_message = ?,
                   lock_owner = NULL, lock_expires_at = NULL
               WHERE id = ?"#,
        )
        .bind(i64::from(retries))
        .bind(due_at.timestamp_millis())
        .bind(message)
        .bind(job_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(query_err)?;
        bump_revisions(&mut tx, [parse_uuid(&process_instance_id)?]).await?;

        tx.commit().await.map_err(query_err)?;
        Ok(())
    }
}
