//! Routing of business errors to error boundary events.
//!
//! A business error raised at an execution travels up the execution tree.
//! The first activity on the way that carries an error boundary event
//! catching the code is interrupted, and the process continues from that
//! boundary event. Instances of a multi-instance activity are skipped so
//! the boundary on the multi-instance root handles them.

use serde_json::json;
use tokenflow_types::process::NodeKind;
use uuid::Uuid;

use crate::behavior::{fire_interrupting, multi_instance};
use crate::context::CommandContext;
use crate::error::EngineError;
use crate::process::FlowNode;

pub const ERROR_CODE_VARIABLE: &str = "errorCode";
pub const ERROR_MESSAGE_VARIABLE: &str = "errorMessage";

/// Deliver the business error `code` raised at `execution_id` to the nearest
/// catching error boundary event.
///
/// Returns [`EngineError::UnhandledBusinessFault`] when nothing catches it.
pub fn propagate_error(
    ctx: &mut CommandContext<'_>,
    code: &str,
    message: Option<&str>,
    execution_id: Uuid,
) -> Result<(), EngineError> {
    let raised_at = ctx
        .state()
        .execution(execution_id)?
        .current_flow_element_id
        .clone()
        .unwrap_or_default();

    let mut chain = vec![execution_id];
    chain.extend(ctx.state().ancestors(execution_id)?);

    for candidate in chain {
        let Some(element_id) = ctx
            .state()
            .execution(candidate)?
            .current_flow_element_id
            .clone()
        else {
            continue;
        };
        if multi_instance::is_instance(ctx, candidate)? {
            continue;
        }
        let graph = ctx.graph_for(candidate)?;
        let Some(node) = graph.node(&element_id) else {
            continue;
        };
        let Some(boundary) = graph
            .boundary_events(&node.id)
            .into_iter()
            .find(|boundary| catches(boundary, code))
        else {
            continue;
        };

        let catcher = boundary_execution(ctx, candidate, &boundary.id)?;
        let state = ctx.state_mut();
        state.set_local_variable(catcher, ERROR_CODE_VARIABLE, json!(code))?;
        if let Some(message) = message {
            state.set_local_variable(catcher, ERROR_MESSAGE_VARIABLE, json!(message))?;
        }
        tracing::debug!(%code, raised_at = %raised_at, boundary = %boundary.id, activity_id = %node.id, "business error caught");
        return fire_interrupting(ctx, catcher);
    }

    tracing::warn!(%code, activity_id = %raised_at, "business error not caught by any boundary event");
    Err(EngineError::UnhandledBusinessFault {
        code: code.to_string(),
        activity_id: raised_at,
    })
}

fn catches(boundary: &FlowNode, code: &str) -> bool {
    match &boundary.kind {
        NodeKind::BoundaryEvent { event, .. } => event.catches_error(code),
        _ => false,
    }
}

/// The child of `attached_id` listening on `boundary_id`, created if the
/// activity never armed one.
fn boundary_execution(
    ctx: &mut CommandContext<'_>,
    attached_id: Uuid,
    boundary_id: &str,
) -> Result<Uuid, EngineError> {
    for child in ctx.state().children(attached_id) {
        if ctx.state().execution(child)?.current_flow_element_id.as_deref() == Some(boundary_id) {
            return Ok(child);
        }
    }
    let state = ctx.state_mut();
    let child = state.create_child_execution(attached_id)?;
    state.set_current_flow_element(child, Some(boundary_id))?;
    Ok(child)
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokenflow_types::event::EngineEvent;

    use super::*;
    use crate::context::EngineServices;
    use crate::test_support::{deploy, executions_at, start_instance};

    const CAUGHT_IN_SUB_PROCESS: &str = r#"
key: payment
nodes:
  - { id: start, type: start_event }
  - id: charge
    type: sub_process
    nodes:
      - { id: c_start, type: start_event }
      - { id: c_fork, type: parallel_gateway }
      - { id: c_wait, type: user_task }
      - { id: c_fail, type: error_end_event, error_code: CARD_DECLINED }
    flows:
      - { id: c0, source: c_start, target: c_fork }
      - { id: c1, source: c_fork, target: c_wait }
      - { id: c2, source: c_fork, target: c_fail }
  - id: declined
    type: boundary_event
    attached_to: charge
    event: { kind: error, error_code: CARD_DECLINED }
  - { id: notify, type: user_task }
  - { id: done, type: end_event }
flows:
  - { id: f0, source: start, target: charge }
  - { id: f1, source: charge, target: done }
  - { id: f2, source: declined, target: notify }
"#;

    #[test]
    fn error_end_event_interrupts_enclosing_sub_process() {
        let services = EngineServices::default();
        let graph = deploy(&services, CAUGHT_IN_SUB_PROCESS);
        let (state, events) = start_instance(&services, &graph).unwrap();

        assert!(executions_at(&state, "charge").is_empty());
        assert!(executions_at(&state, "c_wait").is_empty());
        let at_notify = executions_at(&state, "notify");
        assert_eq!(at_notify.len(), 1);
        assert_eq!(
            state.local_variable(at_notify[0], ERROR_CODE_VARIABLE),
            Some(&json!("CARD_DECLINED"))
        );
        let tasks: Vec<_> = state.tasks().map(|t| t.task_definition_key.as_str()).collect();
        assert_eq!(tasks, vec!["notify"]);
        assert!(events.iter().any(|e| matches!(
            e,
            EngineEvent::ActivityCancelled { activity_id: Some(id), .. } if id == "charge"
        )));
        let root = state.root().unwrap().id;
        assert_eq!(state.execution(at_notify[0]).unwrap().parent_id, Some(root));
    }

    #[test]
    fn code_mismatch_is_unhandled() {
        let services = EngineServices::default();
        let graph = deploy(
            &services,
            &CAUGHT_IN_SUB_PROCESS.replace("error_code: CARD_DECLINED }\n  - { id: notify", "error_code: TIMEOUT }\n  - { id: notify"),
        );
        let err = start_instance(&services, &graph).unwrap_err();
        assert!(matches!(
            err,
            EngineError::UnhandledBusinessFault { ref code, ref activity_id }
                if code == "CARD_DECLINED" && activity_id == "c_fail"
        ));
    }

    #[test]
    fn catch_all_boundary_on_multi_instance_activity() {
        let services = EngineServices::default();
        services.service_handlers.register(
            "reserve",
            std::sync::Arc::new(
                |_: &crate::service::ServiceRequest<'_>| -> Result<
                    serde_json::Map<String, serde_json::Value>,
                    crate::service::ServiceError,
                > {
                    Err(crate::service::ServiceError::Business {
                        code: "OUT_OF_STOCK".into(),
                        message: Some("no seats left".into()),
                    })
                },
            ),
        );
        let graph = deploy(
            &services,
            r#"
key: booking
nodes:
  - { id: start, type: start_event }
  - id: reserve
    type: service_task
    handler: reserve
    multi_instance: { cardinality: 2 }
  - id: failed
    type: boundary_event
    attached_to: reserve
    event: { kind: error }
  - { id: apologise, type: user_task }
  - { id: done, type: end_event }
flows:
  - { id: f0, source: start, target: reserve }
  - { id: f1, source: reserve, target: done }
  - { id: f2, source: failed, target: apologise }
"#,
        );
        let (state, _) = start_instance(&services, &graph).unwrap();
        assert!(executions_at(&state, "reserve").is_empty());
        assert!(state.executions().all(|e| !e.is_multi_instance_root));
        let at_apologise = executions_at(&state, "apologise");
        assert_eq!(at_apologise.len(), 1);
        assert_eq!(
            state.local_variable(at_apologise[0], ERROR_MESSAGE_VARIABLE),
            Some(&json!("no seats left"))
        );
    }
}
