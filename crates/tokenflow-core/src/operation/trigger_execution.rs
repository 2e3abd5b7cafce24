//! TriggerExecution: deliver an external signal to a waiting execution.

use serde_json::Value;
use uuid::Uuid;

use crate::context::CommandContext;
use crate::error::EngineError;

pub(super) fn run(
    ctx: &mut CommandContext<'_>,
    execution_id: Uuid,
    signal: Option<&str>,
    payload: Option<&Value>,
) -> Result<(), EngineError> {
    let node = ctx.current_node(execution_id)?;
    let graph = ctx.graph_for(execution_id)?;
    let behavior = graph
        .behavior(&node.id)
        .ok_or_else(|| EngineError::NotTriggerable {
            activity_id: node.id.clone(),
        })?;
    let triggerable = behavior
        .triggerable()
        .ok_or_else(|| EngineError::NotTriggerable {
            activity_id: node.id.clone(),
        })?;

    tracing::debug!(%execution_id, activity_id = %node.id, signal, "triggering execution");
    triggerable
        .trigger(ctx, execution_id, signal, payload)
        .map_err(|e| e.in_activity(execution_id, &node.id))
}

#[cfg(test)]
mod tests {
    use crate::context::EngineServices;
    use crate::error::EngineError;
    use crate::test_support::{deploy, new_instance, run_unit};

    #[test]
    fn non_triggerable_node_is_rejected() {
        let services = EngineServices::default();
        let graph = deploy(
            &services,
            r#"
key: plain
nodes:
  - { id: start, type: start_event }
  - { id: end, type: end_event }
flows:
  - { id: f0, source: start, target: end }
"#,
        );
        let (state, child) = new_instance(&graph);
        let err = run_unit(&services, state, |ctx| {
            ctx.agenda_mut().plan_trigger_execution(child, None, None);
            Ok(())
        })
        .unwrap_err();
        assert!(err.is_invariant_violation());
        assert!(matches!(err, EngineError::NotTriggerable { activity_id } if activity_id == "start"));
    }
}
