//! ExecuteInactiveBehaviors: after the agenda drains, let inactive-aware
//! behaviors re-check the executions waiting on their nodes. A join that
//! was blocked by a branch which has since ended fires here.

use std::collections::BTreeSet;

use uuid::Uuid;

use crate::context::CommandContext;
use crate::error::EngineError;

pub(super) fn run(ctx: &mut CommandContext<'_>) -> Result<(), EngineError> {
    let definition_ids: BTreeSet<Uuid> = ctx
        .agenda()
        .involved_executions()
        .filter_map(|id| ctx.state().find_execution(id))
        .map(|e| e.process_definition_id)
        .collect();

    for definition_id in definition_ids {
        let graph = ctx.graph(definition_id)?;
        for node_id in graph.nodes_with_inactive_behavior() {
            let Some(behavior) = graph.behavior(node_id) else {
                continue;
            };
            let Some(inactive) = behavior.inactive_aware() else {
                continue;
            };

            let waiting: Vec<Uuid> = ctx
                .state()
                .executions()
                .filter(|e| {
                    !e.is_active
                        && !e.is_ended
                        && e.current_flow_element_id.as_deref() == Some(node_id.as_str())
                })
                .map(|e| e.id)
                .collect();

            for execution_id in waiting {
                // An earlier join in this pass may have consumed it.
                let still_waiting = ctx
                    .state()
                    .find_execution(execution_id)
                    .is_some_and(|e| !e.is_active && !e.is_ended);
                if still_waiting {
                    tracing::trace!(%execution_id, activity_id = %node_id, "re-checking inactive execution");
                    inactive.execute_inactive(ctx, execution_id)?;
                }
            }
        }
    }
    Ok(())
}
