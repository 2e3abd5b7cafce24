//! Process definition types -- the canonical IR for deployed processes.
//!
//! A `ProcessDefinition` is a container of flow nodes (events, activities,
//! gateways) connected by sequence flows. Sub-processes nest their own nodes
//! and flows. These types are produced from YAML by the definition parser in
//! tokenflow-core and stored as JSON by tokenflow-infra.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Process definition
// ---------------------------------------------------------------------------

/// A deployable process definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessDefinition {
    /// UUIDv7 definition ID (one per deployed version).
    #[serde(default = "Uuid::now_v7")]
    pub id: Uuid,
    /// Stable key shared by all versions (e.g. "order-fulfilment").
    pub key: String,
    /// Human-readable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Version number, assigned on deploy.
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    /// Process-level listeners (`start` fires once per instance, `end` on completion).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub listeners: Vec<ListenerDefinition>,
    /// Top-level flow nodes.
    pub nodes: Vec<FlowNodeDefinition>,
    /// Top-level sequence flows.
    #[serde(default)]
    pub flows: Vec<SequenceFlowDefinition>,
}

fn default_version() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Flow nodes
// ---------------------------------------------------------------------------

/// A node in the process graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowNodeDefinition {
    /// Unique ID across the whole definition, including nested sub-processes.
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub kind: NodeKind,
    /// Continue in a separate unit of work via an async-continuation job.
    #[serde(default, rename = "async")]
    pub is_async: bool,
    /// Exclusive jobs of one instance are never run concurrently.
    #[serde(default = "default_true")]
    pub exclusive: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub listeners: Vec<ListenerDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multi_instance: Option<MultiInstanceDefinition>,
}

/// Element type of a flow node, tagged by `type` in YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    StartEvent,
    EndEvent,
    /// End event that throws a business error.
    ErrorEndEvent { error_code: String },
    /// Activity without behavior; the token passes straight through.
    Task,
    UserTask {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        assignee: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        candidate_groups: Vec<String>,
    },
    /// Activity delegating to a registered service handler by name.
    ServiceTask { handler: String },
    ExclusiveGateway {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<String>,
    },
    ParallelGateway,
    InclusiveGateway {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<String>,
    },
    IntermediateCatchEvent { event: EventDefinition },
    BoundaryEvent {
        attached_to: String,
        #[serde(default = "default_true")]
        cancel_activity: bool,
        event: EventDefinition,
    },
    SubProcess {
        nodes: Vec<FlowNodeDefinition>,
        #[serde(default)]
        flows: Vec<SequenceFlowDefinition>,
    },
}

impl NodeKind {
    /// Snake-case type name, as written in YAML.
    pub fn type_name(&self) -> &'static str {
        match self {
            NodeKind::StartEvent => "start_event",
            NodeKind::EndEvent => "end_event",
            NodeKind::ErrorEndEvent { .. } => "error_end_event",
            NodeKind::Task => "task",
            NodeKind::UserTask { .. } => "user_task",
            NodeKind::ServiceTask { .. } => "service_task",
            NodeKind::ExclusiveGateway { .. } => "exclusive_gateway",
            NodeKind::ParallelGateway => "parallel_gateway",
            NodeKind::InclusiveGateway { .. } => "inclusive_gateway",
            NodeKind::IntermediateCatchEvent { .. } => "intermediate_catch_event",
            NodeKind::BoundaryEvent { .. } => "boundary_event",
            NodeKind::SubProcess { .. } => "sub_process",
        }
    }

    /// Activities can carry boundary events and multi-instance markers.
    pub fn is_activity(&self) -> bool {
        matches!(
            self,
            NodeKind::Task
                | NodeKind::UserTask { .. }
                | NodeKind::ServiceTask { .. }
                | NodeKind::SubProcess { .. }
        )
    }

    pub fn is_sub_process(&self) -> bool {
        matches!(self, NodeKind::SubProcess { .. })
    }

    /// Default sequence flow ID for gateways that support one.
    pub fn default_flow(&self) -> Option<&str> {
        match self {
            NodeKind::ExclusiveGateway { default } | NodeKind::InclusiveGateway { default } => {
                default.as_deref()
            }
            _ => None,
        }
    }
}

/// Event trigger definition for catch and boundary events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventDefinition {
    Timer { duration_secs: u64 },
    Message { name: String },
    Signal { name: String },
    /// Catches business errors; `None` catches every code.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_code: Option<String>,
    },
    Compensation,
}

impl EventDefinition {
    /// Whether this definition catches a business error with the given code.
    pub fn catches_error(&self, code: &str) -> bool {
        match self {
            EventDefinition::Error { error_code: None } => true,
            EventDefinition::Error {
                error_code: Some(expected),
            } => expected == code,
            _ => false,
        }
    }
}

/// Multi-instance loop characteristics of an activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiInstanceDefinition {
    /// Number of instances to run.
    pub cardinality: u32,
    /// Run instances one after another instead of all at once.
    #[serde(default)]
    pub sequential: bool,
}

// ---------------------------------------------------------------------------
// Sequence flows
// ---------------------------------------------------------------------------

/// A directed edge between two nodes in the same container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceFlowDefinition {
    pub id: String,
    pub source: String,
    pub target: String,
    /// JEXL guard evaluated against the execution's visible variables.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub listeners: Vec<ListenerDefinition>,
}

// ---------------------------------------------------------------------------
// Listeners
// ---------------------------------------------------------------------------

/// Binds a registered execution listener to a lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerDefinition {
    pub event: ListenerEvent,
    /// Name under which the listener is registered with the engine.
    pub handler: String,
}

/// Execution-listener lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenerEvent {
    Start,
    Take,
    End,
}

impl fmt::Display for ListenerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerEvent::Start => write!(f, "start"),
            ListenerEvent::Take => write!(f, "take"),
            ListenerEvent::End => write!(f, "end"),
        }
    }
}

impl FromStr for ListenerEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "start" => Ok(ListenerEvent::Start),
            "take" => Ok(ListenerEvent::Take),
            "end" => Ok(ListenerEvent::End),
            other => Err(format!("invalid listener event: '{other}'")),
        }
    }
}
