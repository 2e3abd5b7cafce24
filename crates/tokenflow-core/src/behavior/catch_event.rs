//! Intermediate catch events and boundary events.
//!
//! Both arm the same triggers when an execution arrives: a timer job, or a
//! message/signal subscription. Error boundaries arm nothing; they are
//! fired by error propagation.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tokenflow_types::event::EngineEvent;
use tokenflow_types::process::EventDefinition;
use tokenflow_types::runtime::{EventType, JobType};
use uuid::Uuid;

use crate::context::CommandContext;
use crate::error::EngineError;

use super::{apply_payload, leave, ActivityBehavior, TriggerableActivityBehavior};

/// Register the trigger for `event` on `execution_id`.
fn arm(
    ctx: &mut CommandContext<'_>,
    execution_id: Uuid,
    event: &EventDefinition,
) -> Result<(), EngineError> {
    let node = ctx.current_node(execution_id)?;
    match event {
        EventDefinition::Timer { duration_secs } => {
            let due_at = i64::try_from(*duration_secs)
                .ok()
                .and_then(Duration::try_seconds)
                .and_then(|delay| Utc::now().checked_add_signed(delay))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            ctx.create_job(execution_id, JobType::Timer, &node.id, node.exclusive, due_at)?;
        }
        EventDefinition::Message { name } => {
            ctx.create_subscription(execution_id, EventType::Message, name, &node.id)?;
        }
        EventDefinition::Signal { name } => {
            ctx.create_subscription(execution_id, EventType::Signal, name, &node.id)?;
        }
        EventDefinition::Error { .. } | EventDefinition::Compensation => {}
    }
    Ok(())
}

/// Drop the timer jobs and subscriptions an execution armed.
fn disarm(ctx: &mut CommandContext<'_>, execution_id: Uuid) {
    let state = ctx.state_mut();
    state.delete_jobs_for_execution(execution_id);
    state.delete_subscriptions_for_execution(execution_id);
}

// ---------------------------------------------------------------------------
// Intermediate catch event
// ---------------------------------------------------------------------------

/// Waits on the sequence flow until its timer, message or signal arrives.
#[derive(Debug, Clone)]
pub struct IntermediateCatchEventBehavior {
    pub event: EventDefinition,
}

impl ActivityBehavior for IntermediateCatchEventBehavior {
    fn execute(&self, ctx: &mut CommandContext<'_>, execution_id: Uuid) -> Result<(), EngineError> {
        arm(ctx, execution_id, &self.event)
    }

    fn triggerable(&self) -> Option<&dyn TriggerableActivityBehavior> {
        Some(self)
    }
}

impl TriggerableActivityBehavior for IntermediateCatchEventBehavior {
    fn trigger(
        &self,
        ctx: &mut CommandContext<'_>,
        execution_id: Uuid,
        _signal: Option<&str>,
        payload: Option<&Value>,
    ) -> Result<(), EngineError> {
        disarm(ctx, execution_id);
        apply_payload(ctx, execution_id, payload)?;
        leave(ctx, execution_id)
    }
}

// ---------------------------------------------------------------------------
// Boundary event
// ---------------------------------------------------------------------------

/// Listens on an activity. Interrupting boundaries cancel the activity when
/// they fire; non-interrupting ones spawn a parallel path and keep
/// listening.
#[derive(Debug, Clone)]
pub struct BoundaryEventBehavior {
    pub event: EventDefinition,
    pub cancel_activity: bool,
}

impl ActivityBehavior for BoundaryEventBehavior {
    fn execute(&self, ctx: &mut CommandContext<'_>, execution_id: Uuid) -> Result<(), EngineError> {
        arm(ctx, execution_id, &self.event)
    }

    fn triggerable(&self) -> Option<&dyn TriggerableActivityBehavior> {
        Some(self)
    }
}

impl TriggerableActivityBehavior for BoundaryEventBehavior {
    fn trigger(
        &self,
        ctx: &mut CommandContext<'_>,
        execution_id: Uuid,
        _signal: Option<&str>,
        payload: Option<&Value>,
    ) -> Result<(), EngineError> {
        apply_payload(ctx, execution_id, payload)?;
        if self.cancel_activity {
            fire_interrupting(ctx, execution_id)
        } else {
            fire_non_interrupting(ctx, execution_id)
        }
    }
}

/// Cancel the activity a boundary execution is attached to and continue
/// from the boundary event.
///
/// The boundary execution moves up to the scope above the activity, so it
/// survives the activity's teardown.
pub(crate) fn fire_interrupting(
    ctx: &mut CommandContext<'_>,
    boundary_id: Uuid,
) -> Result<(), EngineError> {
    let attached_id = ctx
        .state()
        .execution(boundary_id)?
        .parent_id
        .ok_or(EngineError::NoEnclosingScope(boundary_id))?;
    let scope_id = ctx.state().find_parent_scope(attached_id)?;
    let attached = ctx.state().execution(attached_id)?.clone();

    disarm(ctx, boundary_id);
    ctx.state_mut().reparent(boundary_id, scope_id)?;
    {
        let boundary = ctx.state_mut().execution_mut(boundary_id)?;
        boundary.is_active = true;
        boundary.is_concurrent = attached.is_concurrent;
    }

    if attached.is_scope {
        // Operations already planned inside the cancelled scope must not run.
        let state = ctx.state_mut();
        for inner in state.descendants(attached_id) {
            let execution = state.execution_mut(inner)?;
            execution.is_ended = true;
            execution.is_active = false;
        }
        state.set_active(attached_id, false)?;
        ctx.agenda_mut().plan_destroy_scope(attached_id);
    } else {
        ctx.state_mut().delete_subtree(attached_id)?;
        ctx.emit(EngineEvent::ActivityCancelled {
            process_instance_id: ctx.process_instance_id(),
            execution_id: attached_id,
            activity_id: attached.current_flow_element_id.clone(),
        });
    }

    tracing::debug!(%boundary_id, %attached_id, "interrupting boundary event fired");
    ctx.agenda_mut()
        .plan_take_outgoing_sequence_flows(boundary_id, true);
    Ok(())
}

/// Continue from the boundary event on a new execution while the activity
/// and the boundary listener stay in place.
pub(crate) fn fire_non_interrupting(
    ctx: &mut CommandContext<'_>,
    boundary_id: Uuid,
) -> Result<(), EngineError> {
    let boundary = ctx.state().execution(boundary_id)?.clone();
    let attached_id = boundary
        .parent_id
        .ok_or(EngineError::NoEnclosingScope(boundary_id))?;
    let scope_id = ctx.state().find_parent_scope(attached_id)?;

    // A fired timer cannot fire again.
    let state = ctx.state_mut();
    state.delete_jobs_for_execution(boundary_id);
    let branch = state.create_child_execution(scope_id)?;
    let entry = state.execution_mut(branch)?;
    entry.current_flow_element_id = boundary.current_flow_element_id.clone();
    entry.is_concurrent = true;

    tracing::debug!(%boundary_id, %branch, "non-interrupting boundary event fired");
    ctx.agenda_mut().plan_take_outgoing_sequence_flows(branch, true);
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokenflow_types::runtime::{EventType, JobType};

    use crate::context::EngineServices;
    use crate::test_support::{deploy, executions_at, run_unit, start_instance};

    #[test]
    fn message_catch_waits_and_applies_payload() {
        let services = EngineServices::default();
        let graph = deploy(
            &services,
            r#"
key: wait-message
nodes:
  - { id: start, type: start_event }
  - id: paid
    type: intermediate_catch_event
    event: { kind: message, name: payment }
  - { id: ship, type: user_task }
flows:
  - { id: f0, source: start, target: paid }
  - { id: f1, source: paid, target: ship }
"#,
        );
        let (state, _) = start_instance(&services, &graph).unwrap();
        let subs = state.find_subscriptions(EventType::Message, "payment");
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].activity_id, "paid");
        let waiting = subs[0].execution_id;

        let (state, _) = run_unit(&services, state, |ctx| {
            ctx.agenda_mut().plan_trigger_execution(
                waiting,
                Some("payment".into()),
                Some(json!({ "amount": 12 })),
            );
            Ok(())
        })
        .unwrap();
        assert_eq!(state.subscriptions().count(), 0);
        assert_eq!(executions_at(&state, "ship").len(), 1);
        let root = state.root().unwrap().id;
        assert_eq!(state.local_variable(root, "amount"), Some(&json!(12)));
    }

    const TIMEOUT: &str = r#"
key: review-timeout
nodes:
  - { id: start, type: start_event }
  - { id: review, type: user_task }
  - id: timeout
    type: boundary_event
    attached_to: review
    event: { kind: timer, duration_secs: 3600 }
  - id: nudge
    type: boundary_event
    attached_to: review
    cancel_activity: false
    event: { kind: signal, name: nudge }
  - { id: done, type: end_event }
  - { id: escalated, type: user_task }
  - { id: reminded, type: user_task }
flows:
  - { id: f0, source: start, target: review }
  - { id: f1, source: review, target: done }
  - { id: f2, source: timeout, target: escalated }
  - { id: f3, source: nudge, target: reminded }
"#;

    #[test]
    fn boundary_events_are_armed_with_the_activity() {
        let services = EngineServices::default();
        let graph = deploy(&services, TIMEOUT);
        let (state, _) = start_instance(&services, &graph).unwrap();

        let review = executions_at(&state, "review")[0];
        let timer = executions_at(&state, "timeout")[0];
        assert_eq!(state.execution(timer).unwrap().parent_id, Some(review));
        let jobs: Vec<_> = state.jobs().collect();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_type, JobType::Timer);
        assert!(jobs[0].due_at > chrono::Utc::now() + chrono::Duration::minutes(59));
        assert_eq!(state.find_subscriptions(EventType::Signal, "nudge").len(), 1);
    }

    #[test]
    fn completing_activity_removes_boundary_listeners() {
        let services = EngineServices::default();
        let graph = deploy(&services, TIMEOUT);
        let (state, _) = start_instance(&services, &graph).unwrap();
        let review = executions_at(&state, "review")[0];

        let (state, _) = run_unit(&services, state, |ctx| {
            ctx.agenda_mut().plan_trigger_execution(review, None, None);
            Ok(())
        })
        .unwrap();
        assert!(state.root().is_none());
        assert_eq!(state.jobs().count(), 0);
        assert_eq!(state.subscriptions().count(), 0);
    }

    #[test]
    fn interrupting_timer_cancels_activity() {
        let services = EngineServices::default();
        let graph = deploy(&services, TIMEOUT);
        let (state, _) = start_instance(&services, &graph).unwrap();
        let review = executions_at(&state, "review")[0];
        let timer = executions_at(&state, "timeout")[0];

        let (state, _) = run_unit(&services, state, |ctx| {
            ctx.agenda_mut().plan_trigger_execution(timer, None, None);
            Ok(())
        })
        .unwrap();
        assert!(state.find_execution(review).is_none());
        assert_eq!(state.tasks().count(), 1);
        assert_eq!(state.tasks().next().unwrap().task_definition_key, "escalated");
        assert_eq!(state.subscriptions().count(), 0);
        assert_eq!(state.jobs().count(), 0);
        let root = state.root().unwrap().id;
        assert_eq!(state.execution(timer).unwrap().parent_id, Some(root));
    }

    #[test]
    fn non_interrupting_signal_keeps_activity() {
        let services = EngineServices::default();
        let graph = deploy(&services, TIMEOUT);
        let (state, _) = start_instance(&services, &graph).unwrap();
        let review = executions_at(&state, "review")[0];
        let nudge = executions_at(&state, "nudge")[0];

        let (state, _) = run_unit(&services, state, |ctx| {
            ctx.agenda_mut()
                .plan_trigger_execution(nudge, Some("nudge".into()), None);
            Ok(())
        })
        .unwrap();
        assert!(state.find_execution(review).is_some());
        assert!(state.find_execution(nudge).is_some());
        assert_eq!(executions_at(&state, "reminded").len(), 1);
        assert_eq!(state.tasks().count(), 2);
        assert_eq!(state.find_subscriptions(EventType::Signal, "nudge").len(), 1);
    }
}
