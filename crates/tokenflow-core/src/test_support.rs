//! Helpers shared by unit tests: deploy YAML into a service set and run
//! units of work directly against an `InstanceState`.

use std::sync::Arc;

use chrono::Utc;
use tokenflow_types::event::EngineEvent;
use tokenflow_types::runtime::{ProcessInstance, ProcessInstanceStatus};
use uuid::Uuid;

use crate::behavior::DefaultBehaviorFactory;
use crate::context::{CommandContext, EngineServices};
use crate::error::EngineError;
use crate::process::definition::parse_process_yaml;
use crate::process::ProcessGraph;
use crate::runtime::InstanceState;

pub(crate) fn deploy(services: &EngineServices, yaml: &str) -> Arc<ProcessGraph> {
    let definition = parse_process_yaml(yaml).unwrap();
    let graph = ProcessGraph::build(definition, &DefaultBehaviorFactory).unwrap();
    services.definitions.insert(Arc::new(graph))
}

/// Fresh state with a root execution and one child on the start event.
pub(crate) fn new_instance(graph: &ProcessGraph) -> (InstanceState, Uuid) {
    let definition = graph.definition();
    let mut state = InstanceState::new(ProcessInstance {
        id: Uuid::now_v7(),
        process_definition_id: definition.id,
        process_definition_key: definition.key.clone(),
        business_key: None,
        tenant_id: definition.tenant_id.clone(),
        status: ProcessInstanceStatus::Running,
        revision: 0,
        started_at: Utc::now(),
        ended_at: None,
    });
    let root = state.create_root_execution().unwrap();
    let child = state.create_child_execution(root).unwrap();
    let start = graph.initial_node(None).unwrap();
    state.set_current_flow_element(child, Some(&start.id)).unwrap();
    (state, child)
}

pub(crate) fn start_instance(
    services: &EngineServices,
    graph: &ProcessGraph,
) -> Result<(InstanceState, Vec<EngineEvent>), EngineError> {
    let (state, child) = new_instance(graph);
    run_unit(services, state, |ctx| {
        ctx.agenda_mut().plan_continue_process(child);
        Ok(())
    })
}

/// Seed a context, drain its agenda and hand back the result.
pub(crate) fn run_unit(
    services: &EngineServices,
    state: InstanceState,
    seed: impl FnOnce(&mut CommandContext<'_>) -> Result<(), EngineError>,
) -> Result<(InstanceState, Vec<EngineEvent>), EngineError> {
    let mut ctx = CommandContext::new(services, state);
    seed(&mut ctx)?;
    ctx.run_agenda()?;
    Ok(ctx.into_parts())
}

/// Executions positioned on `element_id`.
pub(crate) fn executions_at(state: &InstanceState, element_id: &str) -> Vec<Uuid> {
    state
        .executions()
        .filter(|e| e.current_flow_element_id.as_deref() == Some(element_id))
        .map(|e| e.id)
        .collect()
}
