//! User task: creates a human task and waits for its completion.

use chrono::Utc;
use serde_json::Value;
use tokenflow_types::event::EngineEvent;
use tokenflow_types::runtime::{IdentityLink, IdentityLinkType, Task};
use uuid::Uuid;

use crate::context::CommandContext;
use crate::error::EngineError;

use super::{apply_payload, leave, ActivityBehavior, TriggerableActivityBehavior};

#[derive(Debug, Clone, Default)]
pub struct UserTaskBehavior {
    pub name: Option<String>,
    pub assignee: Option<String>,
    pub candidate_groups: Vec<String>,
}

impl ActivityBehavior for UserTaskBehavior {
    fn execute(&self, ctx: &mut CommandContext<'_>, execution_id: Uuid) -> Result<(), EngineError> {
        let node = ctx.current_node(execution_id)?;
        let process_instance_id = ctx.process_instance_id();
        let task = Task {
            id: Uuid::now_v7(),
            execution_id,
            process_instance_id,
            task_definition_key: node.id.clone(),
            name: self.name.clone(),
            assignee: self.assignee.clone(),
            created_at: Utc::now(),
        };
        let task_id = task.id;

        let state = ctx.state_mut();
        state.insert_task(task);
        if let Some(assignee) = &self.assignee {
            state.insert_identity_link(IdentityLink {
                id: Uuid::now_v7(),
                process_instance_id,
                task_id: Some(task_id),
                link_type: IdentityLinkType::Assignee,
                user_id: Some(assignee.clone()),
                group_id: None,
            });
        }
        for group in &self.candidate_groups {
            state.insert_identity_link(IdentityLink {
                id: Uuid::now_v7(),
                process_instance_id,
                task_id: Some(task_id),
                link_type: IdentityLinkType::Candidate,
                user_id: None,
                group_id: Some(group.clone()),
            });
        }

        tracing::debug!(%task_id, %execution_id, activity_id = %node.id, "user task created");
        ctx.emit(EngineEvent::TaskCreated {
            process_instance_id,
            task_id,
            task_definition_key: node.id.clone(),
        });
        Ok(())
    }

    fn triggerable(&self) -> Option<&dyn TriggerableActivityBehavior> {
        Some(self)
    }
}

impl TriggerableActivityBehavior for UserTaskBehavior {
    fn trigger(
        &self,
        ctx: &mut CommandContext<'_>,
        execution_id: Uuid,
        _signal: Option<&str>,
        payload: Option<&Value>,
    ) -> Result<(), EngineError> {
        ctx.state_mut().delete_tasks_for_execution(execution_id);
        apply_payload(ctx, execution_id, payload)?;
        leave(ctx, execution_id)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokenflow_types::runtime::IdentityLinkType;

    use crate::context::EngineServices;
    use crate::test_support::{deploy, run_unit, start_instance};

    const REVIEW: &str = r#"
key: review
nodes:
  - { id: start, type: start_event }
  - id: review
    type: user_task
    name: Review order
    assignee: alice
    candidate_groups: [sales, support]
  - { id: end, type: end_event }
flows:
  - { id: f0, source: start, target: review }
  - { id: f1, source: review, target: end }
"#;

    #[test]
    fn creates_task_with_identity_links() {
        let services = EngineServices::default();
        let graph = deploy(&services, REVIEW);
        let (state, _) = start_instance(&services, &graph).unwrap();

        let task = state.tasks().next().unwrap();
        assert_eq!(task.task_definition_key, "review");
        assert_eq!(task.name.as_deref(), Some("Review order"));
        assert_eq!(task.assignee.as_deref(), Some("alice"));

        let links: Vec<_> = state.identity_links().collect();
        assert_eq!(links.len(), 3);
        assert_eq!(
            links
                .iter()
                .filter(|l| l.link_type == IdentityLinkType::Candidate)
                .count(),
            2
        );
    }

    #[test]
    fn completing_applies_variables_and_continues() {
        let services = EngineServices::default();
        let graph = deploy(&services, REVIEW);
        let (state, _) = start_instance(&services, &graph).unwrap();
        let execution = state.tasks().next().unwrap().execution_id;

        let (state, _) = run_unit(&services, state, |ctx| {
            ctx.agenda_mut().plan_trigger_execution(
                execution,
                None,
                Some(json!({ "approved": true })),
            );
            Ok(())
        })
        .unwrap();
        assert_eq!(state.tasks().count(), 0);
        assert_eq!(state.identity_links().count(), 0);
        assert!(state.root().is_none());
    }
}
