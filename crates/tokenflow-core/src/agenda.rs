//! FIFO queue of pending interpreter operations.
//!
//! Every state transition of a unit of work goes through the agenda: a
//! behavior never calls into the next element directly, it plans an
//! operation. The agenda also remembers every execution an operation was
//! planned for, which drives the final inactive-behavior pass.

use std::collections::{BTreeSet, VecDeque};

use serde_json::Value;
use uuid::Uuid;

use crate::operation::Operation;

#[derive(Debug, Default)]
pub struct Agenda {
    operations: VecDeque<Operation>,
    involved: BTreeSet<Uuid>,
}

impl Agenda {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Pop the oldest planned operation.
    pub fn next_operation(&mut self) -> Option<Operation> {
        self.operations.pop_front()
    }

    /// Append an operation and record its execution as involved.
    pub fn plan_operation(&mut self, operation: Operation) {
        if let Some(id) = operation.execution_id() {
            self.involved.insert(id);
        }
        self.operations.push_back(operation);
    }

    /// Executions any operation of this unit of work was planned for.
    pub fn involved_executions(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.involved.iter().copied()
    }

    pub fn operations(&self) -> impl Iterator<Item = &Operation> {
        self.operations.iter()
    }

    // -----------------------------------------------------------------------
    // Planners
    // -----------------------------------------------------------------------

    pub fn plan_continue_process(&mut self, execution_id: Uuid) {
        self.plan_operation(Operation::ContinueProcess {
            execution_id,
            force_synchronous: false,
            in_compensation: false,
        });
    }

    /// Continue ignoring the `async` marker (used by async-continuation jobs).
    pub fn plan_continue_process_synchronous(&mut self, execution_id: Uuid) {
        self.plan_operation(Operation::ContinueProcess {
            execution_id,
            force_synchronous: true,
            in_compensation: false,
        });
    }

    /// Continue without arming boundary events.
    pub fn plan_continue_process_in_compensation(&mut self, execution_id: Uuid) {
        self.plan_operation(Operation::ContinueProcess {
            execution_id,
            force_synchronous: false,
            in_compensation: true,
        });
    }

    pub fn plan_continue_multi_instance(&mut self, execution_id: Uuid) {
        self.plan_operation(Operation::ContinueMultiInstance { execution_id });
    }

    pub fn plan_take_outgoing_sequence_flows(
        &mut self,
        execution_id: Uuid,
        evaluate_conditions: bool,
    ) {
        self.plan_operation(Operation::TakeOutgoingSequenceFlows {
            execution_id,
            evaluate_conditions,
        });
    }

    pub fn plan_end_execution(&mut self, execution_id: Uuid) {
        self.plan_operation(Operation::EndExecution { execution_id });
    }

    pub fn plan_destroy_scope(&mut self, execution_id: Uuid) {
        self.plan_operation(Operation::DestroyScope { execution_id });
    }

    pub fn plan_trigger_execution(
        &mut self,
        execution_id: Uuid,
        signal: Option<String>,
        payload: Option<Value>,
    ) {
        self.plan_operation(Operation::TriggerExecution {
            execution_id,
            signal,
            payload,
        });
    }

    pub fn plan_execute_inactive_behaviors(&mut self) {
        self.plan_operation(Operation::ExecuteInactiveBehaviors);
    }
}
