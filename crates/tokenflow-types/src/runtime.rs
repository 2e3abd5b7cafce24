//! Runtime entities of a process instance.
//!
//! The execution tree (`Execution`) plus the collections each execution owns:
//! tasks, jobs, variables, event subscriptions and identity links. An
//! `InstanceSnapshot` bundles everything belonging to one process instance
//! and is the unit the engine loads and persists per unit of work.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// A node of the live execution tree: the process instance root, a scope,
/// or a single token position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    /// UUIDv7, so sorting by ID gives creation order.
    pub id: Uuid,
    /// ID of the root execution.
    pub process_instance_id: Uuid,
    /// `None` only for the root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    pub process_definition_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    /// Node or sequence-flow ID in the process graph.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_flow_element_id: Option<String>,
    pub is_active: bool,
    pub is_scope: bool,
    pub is_ended: bool,
    /// Created by a fan-out next to a sibling.
    pub is_concurrent: bool,
    pub is_multi_instance_root: bool,
    pub created_at: DateTime<Utc>,
}

impl Execution {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

// ---------------------------------------------------------------------------
// Tasks and identity links
// ---------------------------------------------------------------------------

/// A human task waiting for completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub process_instance_id: Uuid,
    /// ID of the user-task node that created this task.
    pub task_definition_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityLinkType {
    Starter,
    Candidate,
    Assignee,
}

impl fmt::Display for IdentityLinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityLinkType::Starter => write!(f, "starter"),
            IdentityLinkType::Candidate => write!(f, "candidate"),
            IdentityLinkType::Assignee => write!(f, "assignee"),
        }
    }
}

impl FromStr for IdentityLinkType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starter" => Ok(IdentityLinkType::Starter),
            "candidate" => Ok(IdentityLinkType::Candidate),
            "assignee" => Ok(IdentityLinkType::Assignee),
            other => Err(format!("invalid identity link type: '{other}'")),
        }
    }
}

/// Associates a user or group with a process instance or one of its tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityLink {
    pub id: Uuid,
    pub process_instance_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,
    pub link_type: IdentityLinkType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Deferred ContinueProcess for an asynchronous activity.
    AsyncContinuation,
    /// Fires a timer catch or boundary event when due.
    Timer,
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobType::AsyncContinuation => write!(f, "async_continuation"),
            JobType::Timer => write!(f, "timer"),
        }
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "async_continuation" => Ok(JobType::AsyncContinuation),
            "timer" => Ok(JobType::Timer),
            other => Err(format!("invalid job type: '{other}'")),
        }
    }
}

/// A durable unit of deferred work, claimed and run by the job executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: JobType,
    pub execution_id: Uuid,
    pub process_instance_id: Uuid,
    pub process_definition_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_id: Option<String>,
    pub exclusive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    /// Remaining attempts; zero means dead-lettered.
    pub retries: u32,
    pub due_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn is_dead_letter(&self) -> bool {
        self.retries == 0
    }
}

// ---------------------------------------------------------------------------
// Variables and event subscriptions
// ---------------------------------------------------------------------------

/// A named JSON value declared on one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub process_instance_id: Uuid,
    pub name: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Message,
    Signal,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Message => write!(f, "message"),
            EventType::Signal => write!(f, "signal"),
        }
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message" => Ok(EventType::Message),
            "signal" => Ok(EventType::Signal),
            other => Err(format!("invalid event type: '{other}'")),
        }
    }
}

/// An execution waiting for a named message or signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSubscription {
    pub id: Uuid,
    pub event_type: EventType,
    pub event_name: String,
    pub execution_id: Uuid,
    pub process_instance_id: Uuid,
    /// Catch or boundary event node that subscribed.
    pub activity_id: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Process instance
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessInstanceStatus {
    Running,
    Completed,
}

impl fmt::Display for ProcessInstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessInstanceStatus::Running => write!(f, "running"),
            ProcessInstanceStatus::Completed => write!(f, "completed"),
        }
    }
}

impl FromStr for ProcessInstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(ProcessInstanceStatus::Running),
            "completed" => Ok(ProcessInstanceStatus::Completed),
            other => Err(format!("invalid process instance status: '{other}'")),
        }
    }
}

/// Header record of a process instance. `revision` guards concurrent
/// units of work (optimistic locking).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInstance {
    /// Same as the root execution ID.
    pub id: Uuid,
    pub process_definition_id: Uuid,
    pub process_definition_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    pub status: ProcessInstanceStatus,
    /// Zero until first persisted.
    pub revision: i64,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

/// Everything persisted for one process instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub instance: ProcessInstance,
    #[serde(default)]
    pub executions: Vec<Execution>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub jobs: Vec<Job>,
    #[serde(default)]
    pub variables: Vec<Variable>,
    #[serde(default)]
    pub event_subscriptions: Vec<EventSubscription>,
    #[serde(default)]
    pub identity_links: Vec<IdentityLink>,
}

impl InstanceSnapshot {
    /// Number of active executions in the tree.
    pub fn active_execution_count(&self) -> usize {
        self.executions.iter().filter(|e| e.is_active).count()
    }
}
