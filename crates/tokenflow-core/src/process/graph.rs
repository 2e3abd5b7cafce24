//! Executable process graph built once per deployed definition.
//!
//! `ProcessGraph` indexes every node and sequence flow of a definition
//! (including nested sub-processes) by ID, records incoming/outgoing flows
//! and attached boundary events per node, binds each node to its activity
//! behavior, and keeps a petgraph digraph for reachability queries used by
//! inclusive-gateway joins.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use tokenflow_types::process::{
    FlowNodeDefinition, ListenerDefinition, MultiInstanceDefinition, NodeKind, ProcessDefinition,
    SequenceFlowDefinition,
};

use crate::behavior::{ActivityBehavior, BehaviorFactory};

use super::definition::{validate_definition, DefinitionError};

// ---------------------------------------------------------------------------
// Flow elements
// ---------------------------------------------------------------------------

/// A flow node with its resolved connections.
#[derive(Debug, Clone)]
pub struct FlowNode {
    pub id: String,
    pub name: Option<String>,
    pub kind: NodeKind,
    pub is_async: bool,
    pub exclusive: bool,
    pub listeners: Vec<ListenerDefinition>,
    pub multi_instance: Option<MultiInstanceDefinition>,
    /// Incoming sequence-flow IDs, in definition order.
    pub incoming: Vec<String>,
    /// Outgoing sequence-flow IDs, in definition order.
    pub outgoing: Vec<String>,
    /// Boundary-event node IDs attached to this node.
    pub boundary_events: Vec<String>,
    /// ID of the enclosing sub-process, `None` at the top level.
    pub parent_container: Option<String>,
}

impl FlowNode {
    pub fn is_sub_process(&self) -> bool {
        self.kind.is_sub_process()
    }

    pub fn is_boundary_event(&self) -> bool {
        matches!(self.kind, NodeKind::BoundaryEvent { .. })
    }
}

/// A sequence flow with the container it belongs to.
#[derive(Debug, Clone)]
pub struct SequenceFlow {
    pub id: String,
    pub source: String,
    pub target: String,
    pub condition: Option<String>,
    pub listeners: Vec<ListenerDefinition>,
    pub parent_container: Option<String>,
}

/// What an execution can be positioned on.
#[derive(Debug, Clone)]
pub enum FlowElement {
    Node(Arc<FlowNode>),
    Flow(Arc<SequenceFlow>),
}

impl FlowElement {
    pub fn id(&self) -> &str {
        match self {
            FlowElement::Node(node) => &node.id,
            FlowElement::Flow(flow) => &flow.id,
        }
    }

    fn parent_container(&self) -> Option<&str> {
        match self {
            FlowElement::Node(node) => node.parent_container.as_deref(),
            FlowElement::Flow(flow) => flow.parent_container.as_deref(),
        }
    }
}

// ---------------------------------------------------------------------------
// ProcessGraph
// ---------------------------------------------------------------------------

/// Read-only, shareable graph of one deployed process definition.
pub struct ProcessGraph {
    definition: Arc<ProcessDefinition>,
    nodes: HashMap<String, Arc<FlowNode>>,
    flows: HashMap<String, Arc<SequenceFlow>>,
    /// Start node per container (`None` = top level).
    initial_nodes: HashMap<Option<String>, String>,
    behaviors: HashMap<String, Arc<dyn ActivityBehavior>>,
    inactive_nodes: Vec<String>,
    reachability: DiGraph<String, ()>,
    indices: HashMap<String, NodeIndex>,
}

impl ProcessGraph {
    /// Validate `definition` and build its executable graph, binding each
    /// node to the behavior supplied by `factory`.
    pub fn build(
        definition: ProcessDefinition,
        factory: &dyn BehaviorFactory,
    ) -> Result<Self, DefinitionError> {
        validate_definition(&definition)?;

        let mut builder = GraphBuilder::default();
        builder.add_container(None, &definition.nodes, &definition.flows);

        let mut nodes = HashMap::with_capacity(builder.nodes.len());
        let mut behaviors = HashMap::new();
        let mut inactive_nodes = Vec::new();
        for (id, node) in builder.nodes {
            let node = Arc::new(node);
            if let Some(behavior) = factory.create(&node) {
                if behavior.inactive_aware().is_some() {
                    inactive_nodes.push(id.clone());
                }
                behaviors.insert(id.clone(), behavior);
            }
            nodes.insert(id, node);
        }
        inactive_nodes.sort();

        let flows: HashMap<String, Arc<SequenceFlow>> = builder
            .flows
            .into_iter()
            .map(|(id, flow)| (id, Arc::new(flow)))
            .collect();

        let (reachability, indices) = build_reachability(&nodes, &flows);

        Ok(Self {
            definition: Arc::new(definition),
            nodes,
            flows,
            initial_nodes: builder.initial_nodes,
            behaviors,
            inactive_nodes,
            reachability,
            indices,
        })
    }

    pub fn definition(&self) -> &ProcessDefinition {
        &self.definition
    }

    pub fn id(&self) -> uuid::Uuid {
        self.definition.id
    }

    /// Look up a node or sequence flow. With `recursive == false` only
    /// top-level elements are returned.
    pub fn get_flow_element(&self, id: &str, recursive: bool) -> Option<FlowElement> {
        let element = self
            .nodes
            .get(id)
            .map(|n| FlowElement::Node(Arc::clone(n)))
            .or_else(|| self.flows.get(id).map(|f| FlowElement::Flow(Arc::clone(f))))?;
        if !recursive && element.parent_container().is_some() {
            return None;
        }
        Some(element)
    }

    pub fn node(&self, id: &str) -> Option<Arc<FlowNode>> {
        self.nodes.get(id).cloned()
    }

    pub fn flow(&self, id: &str) -> Option<Arc<SequenceFlow>> {
        self.flows.get(id).cloned()
    }

    /// Start node of a container (`None` = the process itself).
    pub fn initial_node(&self, container: Option<&str>) -> Option<Arc<FlowNode>> {
        self.initial_nodes
            .get(&container.map(str::to_string))
            .and_then(|id| self.node(id))
    }

    /// Outgoing flows of `node_id`, in definition order.
    pub fn outgoing_flows(&self, node_id: &str) -> Vec<Arc<SequenceFlow>> {
        self.nodes
            .get(node_id)
            .map(|n| n.outgoing.iter().filter_map(|id| self.flow(id)).collect())
            .unwrap_or_default()
    }

    /// Boundary-event nodes attached to `node_id`.
    pub fn boundary_events(&self, node_id: &str) -> Vec<Arc<FlowNode>> {
        self.nodes
            .get(node_id)
            .map(|n| n.boundary_events.iter().filter_map(|id| self.node(id)).collect())
            .unwrap_or_default()
    }

    /// Behavior bound to `node_id`; `None` means pass-through.
    pub fn behavior(&self, node_id: &str) -> Option<Arc<dyn ActivityBehavior>> {
        self.behaviors.get(node_id).cloned()
    }

    /// Nodes whose behavior reacts to executions left inactive on them.
    pub fn nodes_with_inactive_behavior(&self) -> &[String] {
        &self.inactive_nodes
    }

    /// Whether a token at `from` (node or flow) can still arrive at node `to`.
    ///
    /// Follows sequence flows; a node without outgoing flows inside a
    /// sub-process continues from the sub-process node itself.
    pub fn is_reachable(&self, from: &str, to: &str) -> bool {
        let from = match self.flows.get(from) {
            Some(flow) => flow.target.as_str(),
            None => from,
        };
        if from == to {
            return true;
        }
        match (self.indices.get(from), self.indices.get(to)) {
            (Some(a), Some(b)) => has_path_connecting(&self.reachability, *a, *b, None),
            _ => false,
        }
    }
}

impl fmt::Debug for ProcessGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessGraph")
            .field("id", &self.definition.id)
            .field("key", &self.definition.key)
            .field("nodes", &self.nodes.len())
            .field("flows", &self.flows.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Construction helpers
// ---------------------------------------------------------------------------

#[derive(Default)]
struct GraphBuilder {
    nodes: HashMap<String, FlowNode>,
    flows: HashMap<String, SequenceFlow>,
    initial_nodes: HashMap<Option<String>, String>,
}

impl GraphBuilder {
    fn add_container(
        &mut self,
        container: Option<&str>,
        nodes: &[FlowNodeDefinition],
        flows: &[SequenceFlowDefinition],
    ) {
        for def in nodes {
            if matches!(def.kind, NodeKind::StartEvent) {
                self.initial_nodes
                    .insert(container.map(str::to_string), def.id.clone());
            }
            self.nodes.insert(
                def.id.clone(),
                FlowNode {
                    id: def.id.clone(),
                    name: def.name.clone(),
                    kind: def.kind.clone(),
                    is_async: def.is_async,
                    exclusive: def.exclusive,
                    listeners: def.listeners.clone(),
                    multi_instance: def.multi_instance.clone(),
                    incoming: Vec::new(),
                    outgoing: Vec::new(),
                    boundary_events: Vec::new(),
                    parent_container: container.map(str::to_string),
                },
            );
        }

        for def in flows {
            if let Some(source) = self.nodes.get_mut(&def.source) {
                source.outgoing.push(def.id.clone());
            }
            if let Some(target) = self.nodes.get_mut(&def.target) {
                target.incoming.push(def.id.clone());
            }
            self.flows.insert(
                def.id.clone(),
                SequenceFlow {
                    id: def.id.clone(),
                    source: def.source.clone(),
                    target: def.target.clone(),
                    condition: def.condition.clone(),
                    listeners: def.listeners.clone(),
                    parent_container: container.map(str::to_string),
                },
            );
        }

        for def in nodes {
            if let NodeKind::BoundaryEvent { attached_to, .. } = &def.kind {
                if let Some(host) = self.nodes.get_mut(attached_to) {
                    host.boundary_events.push(def.id.clone());
                }
            }
            if let NodeKind::SubProcess {
                nodes: inner_nodes,
                flows: inner_flows,
            } = &def.kind
            {
                self.add_container(Some(&def.id), inner_nodes, inner_flows);
            }
        }
    }
}

fn build_reachability(
    nodes: &HashMap<String, Arc<FlowNode>>,
    flows: &HashMap<String, Arc<SequenceFlow>>,
) -> (DiGraph<String, ()>, HashMap<String, NodeIndex>) {
    let mut graph = DiGraph::new();
    let mut indices = HashMap::with_capacity(nodes.len());

    let mut ids: Vec<&String> = nodes.keys().collect();
    ids.sort();
    for id in ids {
        indices.insert(id.clone(), graph.add_node(id.clone()));
    }

    for flow in flows.values() {
        if let (Some(a), Some(b)) = (indices.get(&flow.source), indices.get(&flow.target)) {
            graph.add_edge(*a, *b, ());
        }
    }

    // Sinks inside a sub-process continue from the sub-process node.
    for node in nodes.values() {
        if !node.outgoing.is_empty() || node.is_boundary_event() {
            continue;
        }
        if let Some(container) = &node.parent_container {
            if let (Some(a), Some(b)) = (indices.get(&node.id), indices.get(container)) {
                graph.add_edge(*a, *b, ());
            }
        }
    }

    (graph, indices)
}
