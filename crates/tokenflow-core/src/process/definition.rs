//! Process definition parsing, validation, and filesystem operations.
//!
//! Converts between YAML files and the canonical `ProcessDefinition` IR and
//! validates structural constraints (unique IDs, flows within one container,
//! one start event per container, boundary attachment, gateway defaults).

use std::collections::HashSet;
use std::path::Path;

use tokenflow_types::process::{
    EventDefinition, FlowNodeDefinition, NodeKind, ProcessDefinition, SequenceFlowDefinition,
};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while loading a process definition.
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `ProcessDefinition`.
pub fn parse_process_yaml(yaml: &str) -> Result<ProcessDefinition, DefinitionError> {
    let def: ProcessDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Serialize a `ProcessDefinition` to a YAML string.
pub fn serialize_process_yaml(def: &ProcessDefinition) -> Result<String, DefinitionError> {
    serde_yaml_ng::to_string(def).map_err(|e| DefinitionError::ParseError(e.to_string()))
}

/// Load and validate a process definition from a YAML file.
pub fn load_process_file(path: &Path) -> Result<ProcessDefinition, DefinitionError> {
    let content = std::fs::read_to_string(path)?;
    parse_process_yaml(&content)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `ProcessDefinition`.
///
/// Checks:
/// - Key is non-empty and contains only alphanumerics, hyphens and underscores
/// - Node and flow IDs are unique across all nesting levels
/// - Every container has exactly one start event
/// - Flows connect nodes of the same container
/// - Boundary events are attached to an activity in the same container
/// - Gateway defaults name one of the gateway's outgoing flows
/// - Multi-instance cardinality >= 1, only on activities
/// - Message and signal events name what they wait for
pub fn validate_definition(def: &ProcessDefinition) -> Result<(), DefinitionError> {
    if def.key.is_empty() {
        return Err(DefinitionError::ValidationError(
            "process key must not be empty".to_string(),
        ));
    }
    if !def
        .key
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(DefinitionError::ValidationError(format!(
            "process key '{}' contains invalid characters (only alphanumeric, hyphens and underscores allowed)",
            def.key
        )));
    }

    let mut seen_ids = HashSet::new();
    validate_container(&def.key, &def.nodes, &def.flows, &mut seen_ids)
}

fn validate_container<'a>(
    container: &str,
    nodes: &'a [FlowNodeDefinition],
    flows: &'a [SequenceFlowDefinition],
    seen_ids: &mut HashSet<&'a str>,
) -> Result<(), DefinitionError> {
    if nodes.is_empty() {
        return Err(DefinitionError::ValidationError(format!(
            "'{container}' must have at least one node"
        )));
    }

    for id in nodes.iter().map(|n| n.id.as_str()).chain(flows.iter().map(|f| f.id.as_str())) {
        if id.is_empty() {
            return Err(DefinitionError::ValidationError(format!(
                "'{container}' contains an element with an empty ID"
            )));
        }
        if !seen_ids.insert(id) {
            return Err(DefinitionError::ValidationError(format!(
                "duplicate element ID: '{id}'"
            )));
        }
    }

    let start_count = nodes
        .iter()
        .filter(|n| matches!(n.kind, NodeKind::StartEvent))
        .count();
    if start_count != 1 {
        return Err(DefinitionError::ValidationError(format!(
            "'{container}' must have exactly one start event, found {start_count}"
        )));
    }

    let local_ids: HashSet<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
    for flow in flows {
        for endpoint in [&flow.source, &flow.target] {
            if !local_ids.contains(endpoint.as_str()) {
                return Err(DefinitionError::ValidationError(format!(
                    "sequence flow '{}' references '{}' which is not a node of '{container}'",
                    flow.id, endpoint
                )));
            }
        }
    }

    for node in nodes {
        validate_node(node, nodes, flows)?;
        if let NodeKind::SubProcess {
            nodes: inner_nodes,
            flows: inner_flows,
        } = &node.kind
        {
            validate_container(&node.id, inner_nodes, inner_flows, seen_ids)?;
        }
    }

    Ok(())
}

fn validate_node(
    node: &FlowNodeDefinition,
    siblings: &[FlowNodeDefinition],
    flows: &[SequenceFlowDefinition],
) -> Result<(), DefinitionError> {
    if let Some(mi) = &node.multi_instance {
        if !node.kind.is_activity() {
            return Err(DefinitionError::ValidationError(format!(
                "multi-instance is only supported on activities, '{}' is a {}",
                node.id,
                node.kind.type_name()
            )));
        }
        if mi.cardinality < 1 {
            return Err(DefinitionError::ValidationError(format!(
                "multi-instance cardinality of '{}' must be >= 1",
                node.id
            )));
        }
    }

    if let Some(default) = node.kind.default_flow() {
        let is_outgoing = flows
            .iter()
            .any(|f| f.id == default && f.source == node.id);
        if !is_outgoing {
            return Err(DefinitionError::ValidationError(format!(
                "default flow '{default}' of '{}' is not one of its outgoing flows",
                node.id
            )));
        }
    }

    match &node.kind {
        NodeKind::IntermediateCatchEvent { event } => {
            validate_event_name(&node.id, event)?;
            if !matches!(
                event,
                EventDefinition::Timer { .. }
                    | EventDefinition::Message { .. }
                    | EventDefinition::Signal { .. }
            ) {
                return Err(DefinitionError::ValidationError(format!(
                    "intermediate catch event '{}' must wait for a timer, message or signal",
                    node.id
                )));
            }
        }
        NodeKind::BoundaryEvent {
            attached_to, event, ..
        } => {
            validate_event_name(&node.id, event)?;
            let host = siblings.iter().find(|n| &n.id == attached_to);
            match host {
                Some(host) if host.kind.is_activity() => {}
                Some(host) => {
                    return Err(DefinitionError::ValidationError(format!(
                        "boundary event '{}' is attached to '{}', which is a {} and not an activity",
                        node.id,
                        attached_to,
                        host.kind.type_name()
                    )));
                }
                None => {
                    return Err(DefinitionError::ValidationError(format!(
                        "boundary event '{}' is attached to unknown activity '{}'",
                        node.id, attached_to
                    )));
                }
            }
            if flows.iter().any(|f| f.target == node.id) {
                return Err(DefinitionError::ValidationError(format!(
                    "boundary event '{}' cannot have incoming sequence flows",
                    node.id
                )));
            }
            if node.is_async {
                return Err(DefinitionError::ValidationError(format!(
                    "boundary event '{}' cannot be asynchronous",
                    node.id
                )));
            }
        }
        _ => {}
    }

    Ok(())
}

fn validate_event_name(node_id: &str, event: &EventDefinition) -> Result<(), DefinitionError> {
    let name = match event {
        EventDefinition::Message { name } | EventDefinition::Signal { name } => name,
        _ => return Ok(()),
    };
    if name.trim().is_empty() {
        return Err(DefinitionError::ValidationError(format!(
            "event of '{node_id}' must name the message or signal it waits for"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE: &str = r#"
key: simple
nodes:
  - id: start
    type: start_event
  - id: work
    type: user_task
  - id: end
    type: end_event
flows:
  - { id: f1, source: start, target: work }
  - { id: f2, source: work, target: end }
"#;

    #[test]
    fn parses_valid_definition() {
        let def = parse_process_yaml(SIMPLE).unwrap();
        assert_eq!(def.key, "simple");
        assert_eq!(def.nodes.len(), 3);
        assert_eq!(def.flows.len(), 2);
    }

    #[test]
    fn serialize_and_reparse_keeps_structure() {
        let def = parse_process_yaml(SIMPLE).unwrap();
        let yaml = serialize_process_yaml(&def).unwrap();
        let again = parse_process_yaml(&yaml).unwrap();
        assert_eq!(again.id, def.id);
        assert_eq!(again.flows[1].target, "end");
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("simple.yaml");
        std::fs::write(&path, SIMPLE).unwrap();
        let def = load_process_file(&path).unwrap();
        assert_eq!(def.key, "simple");
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = load_process_file(Path::new("/definitely/not/here.yaml")).unwrap_err();
        assert!(matches!(err, DefinitionError::IoError(_)));
    }

    #[test]
    fn rejects_invalid_key() {
        let yaml = SIMPLE.replace("key: simple", "key: \"has space\"");
        let err = parse_process_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("invalid characters"));
    }

    #[test]
    fn rejects_duplicate_ids_across_levels() {
        let yaml = r#"
key: dup
nodes:
  - id: start
    type: start_event
  - id: sub
    type: sub_process
    nodes:
      - id: start
        type: start_event
"#;
        let err = parse_process_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("duplicate element ID: 'start'"));
    }

    #[test]
    fn rejects_missing_start_event() {
        let yaml = r#"
key: nostart
nodes:
  - id: work
    type: task
"#;
        let err = parse_process_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("exactly one start event"));
    }

    #[test]
    fn rejects_flow_crossing_containers() {
        let yaml = r#"
key: crossing
nodes:
  - id: start
    type: start_event
  - id: sub
    type: sub_process
    nodes:
      - id: inner_start
        type: start_event
flows:
  - { id: f1, source: start, target: inner_start }
"#;
        let err = parse_process_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("not a node of 'crossing'"));
    }

    #[test]
    fn rejects_boundary_on_gateway() {
        let yaml = r#"
key: boundary
nodes:
  - id: start
    type: start_event
  - id: gw
    type: parallel_gateway
  - id: b
    type: boundary_event
    attached_to: gw
    event: { kind: signal, name: stop }
"#;
        let err = parse_process_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("not an activity"));
    }

    #[test]
    fn rejects_default_flow_that_is_not_outgoing() {
        let yaml = r#"
key: gateway
nodes:
  - id: start
    type: start_event
  - id: gw
    type: exclusive_gateway
    default: f1
  - id: end
    type: end_event
flows:
  - { id: f1, source: start, target: gw }
  - { id: f2, source: gw, target: end }
"#;
        let err = parse_process_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("default flow 'f1'"));
    }

    #[test]
    fn rejects_zero_cardinality_and_unnamed_events() {
        let yaml = r#"
key: mi
nodes:
  - id: start
    type: start_event
  - id: work
    type: task
    multi_instance: { cardinality: 0 }
"#;
        assert!(parse_process_yaml(yaml).is_err());

        let yaml = r#"
key: timer
nodes:
  - id: start
    type: start_event
  - id: wait
    type: intermediate_catch_event
    event: { kind: message, name: "" }
"#;
        let err = parse_process_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("must name the message"));
    }

    #[test]
    fn rejects_error_catch_as_intermediate_event() {
        let yaml = r#"
key: catch
nodes:
  - id: start
    type: start_event
  - id: wait
    type: intermediate_catch_event
    event: { kind: error }
"#;
        let err = parse_process_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("timer, message or signal"));
    }
}
