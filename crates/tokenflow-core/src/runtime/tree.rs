//! In-memory state of one process instance during a unit of work.
//!
//! `InstanceState` is an arena keyed by UUID: executions reference their
//! parent by ID and children are found by scanning, so the tree never holds
//! owning back-references. Tasks, jobs, variables, event subscriptions and
//! identity links are owned by executions and removed with them.
//!
//! All collections are `BTreeMap`s keyed by UUIDv7, so iteration follows
//! creation order and snapshots are deterministic.

use std::collections::{BTreeMap, HashSet};

use chrono::Utc;
use serde_json::{Map, Value};
use tokenflow_types::runtime::{
    EventSubscription, EventType, Execution, IdentityLink, InstanceSnapshot, Job, ProcessInstance,
    Task, Variable,
};
use uuid::Uuid;

use crate::error::EngineError;

#[derive(Debug, Clone)]
pub struct InstanceState {
    instance: ProcessInstance,
    executions: BTreeMap<Uuid, Execution>,
    tasks: BTreeMap<Uuid, Task>,
    jobs: BTreeMap<Uuid, Job>,
    variables: BTreeMap<Uuid, Variable>,
    subscriptions: BTreeMap<Uuid, EventSubscription>,
    identity_links: BTreeMap<Uuid, IdentityLink>,
}

impl InstanceState {
    /// Empty state for a new, not yet persisted instance.
    pub fn new(instance: ProcessInstance) -> Self {
        Self {
            instance,
            executions: BTreeMap::new(),
            tasks: BTreeMap::new(),
            jobs: BTreeMap::new(),
            variables: BTreeMap::new(),
            subscriptions: BTreeMap::new(),
            identity_links: BTreeMap::new(),
        }
    }

    pub fn from_snapshot(snapshot: InstanceSnapshot) -> Self {
        Self {
            instance: snapshot.instance,
            executions: snapshot.executions.into_iter().map(|e| (e.id, e)).collect(),
            tasks: snapshot.tasks.into_iter().map(|t| (t.id, t)).collect(),
            jobs: snapshot.jobs.into_iter().map(|j| (j.id, j)).collect(),
            variables: snapshot.variables.into_iter().map(|v| (v.id, v)).collect(),
            subscriptions: snapshot
                .event_subscriptions
                .into_iter()
                .map(|s| (s.id, s))
                .collect(),
            identity_links: snapshot
                .identity_links
                .into_iter()
                .map(|l| (l.id, l))
                .collect(),
        }
    }

    pub fn into_snapshot(self) -> InstanceSnapshot {
        InstanceSnapshot {
            instance: self.instance,
            executions: self.executions.into_values().collect(),
            tasks: self.tasks.into_values().collect(),
            jobs: self.jobs.into_values().collect(),
            variables: self.variables.into_values().collect(),
            event_subscriptions: self.subscriptions.into_values().collect(),
            identity_links: self.identity_links.into_values().collect(),
        }
    }

    pub fn instance(&self) -> &ProcessInstance {
        &self.instance
    }

    pub fn instance_mut(&mut self) -> &mut ProcessInstance {
        &mut self.instance
    }

    pub fn process_instance_id(&self) -> Uuid {
        self.instance.id
    }

    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    /// The root execution, while the instance has not completed.
    pub fn root(&self) -> Option<&Execution> {
        self.executions.get(&self.instance.id)
    }

    pub fn find_execution(&self, id: Uuid) -> Option<&Execution> {
        self.executions.get(&id)
    }

    pub fn execution(&self, id: Uuid) -> Result<&Execution, EngineError> {
        self.executions
            .get(&id)
            .ok_or(EngineError::ExecutionNotFound(id))
    }

    pub fn execution_mut(&mut self, id: Uuid) -> Result<&mut Execution, EngineError> {
        self.executions
            .get_mut(&id)
            .ok_or(EngineError::ExecutionNotFound(id))
    }

    pub fn executions(&self) -> impl Iterator<Item = &Execution> {
        self.executions.values()
    }

    pub fn execution_count(&self) -> usize {
        self.executions.len()
    }

    /// Create the root execution. Its ID is the process instance ID.
    pub fn create_root_execution(&mut self) -> Result<Uuid, EngineError> {
        let id = self.instance.id;
        if self.executions.contains_key(&id) {
            return Err(EngineError::CorruptTree(format!(
                "root execution {id} already exists"
            )));
        }
        self.executions.insert(
            id,
            Execution {
                id,
                process_instance_id: id,
                parent_id: None,
                process_definition_id: self.instance.process_definition_id,
                tenant_id: self.instance.tenant_id.clone(),
                current_flow_element_id: None,
                is_active: true,
                is_scope: true,
                is_ended: false,
                is_concurrent: false,
                is_multi_instance_root: false,
                created_at: Utc::now(),
            },
        );
        Ok(id)
    }

    /// Create an active, non-scope child of `parent_id` with no position.
    pub fn create_child_execution(&mut self, parent_id: Uuid) -> Result<Uuid, EngineError> {
        let parent = self.execution(parent_id)?;
        if parent.is_ended {
            return Err(EngineError::ExecutionEnded(parent_id));
        }
        let child = Execution {
            id: Uuid::now_v7(),
            process_instance_id: parent.process_instance_id,
            parent_id: Some(parent_id),
            process_definition_id: parent.process_definition_id,
            tenant_id: parent.tenant_id.clone(),
            current_flow_element_id: None,
            is_active: true,
            is_scope: false,
            is_ended: false,
            is_concurrent: false,
            is_multi_instance_root: false,
            created_at: Utc::now(),
        };
        let id = child.id;
        self.executions.insert(id, child);
        Ok(id)
    }

    pub fn set_current_flow_element(
        &mut self,
        id: Uuid,
        element_id: Option<&str>,
    ) -> Result<(), EngineError> {
        self.execution_mut(id)?.current_flow_element_id = element_id.map(str::to_string);
        Ok(())
    }

    pub fn set_active(&mut self, id: Uuid, active: bool) -> Result<(), EngineError> {
        self.execution_mut(id)?.is_active = active;
        Ok(())
    }

    /// Move `id` under `new_parent`. Refuses moves that would create a cycle.
    pub fn reparent(&mut self, id: Uuid, new_parent: Uuid) -> Result<(), EngineError> {
        if id == new_parent || self.ancestors(new_parent)?.contains(&id) {
            return Err(EngineError::CorruptTree(format!(
                "cannot move execution {id} below its own descendant {new_parent}"
            )));
        }
        self.execution(new_parent)?;
        self.execution_mut(id)?.parent_id = Some(new_parent);
        Ok(())
    }

    /// Direct children of `id`, in creation order.
    pub fn children(&self, id: Uuid) -> Vec<Uuid> {
        self.executions
            .values()
            .filter(|e| e.parent_id == Some(id))
            .map(|e| e.id)
            .collect()
    }

    /// Parent of `id`; `None` for the root.
    pub fn parent(&self, id: Uuid) -> Result<Option<&Execution>, EngineError> {
        match self.execution(id)?.parent_id {
            Some(parent_id) => self.execution(parent_id).map(Some),
            None => Ok(None),
        }
    }

    /// Every execution below `id`, parents before their children.
    pub fn descendants(&self, id: Uuid) -> Vec<Uuid> {
        let mut found = Vec::new();
        let mut frontier = self.children(id);
        while let Some(next) = frontier.pop() {
            if found.contains(&next) {
                continue;
            }
            found.push(next);
            frontier.extend(self.children(next));
        }
        found
    }

    /// Parent chain of `id`, nearest first. Fails on dangling parents or
    /// cycles.
    pub fn ancestors(&self, id: Uuid) -> Result<Vec<Uuid>, EngineError> {
        let mut chain = Vec::new();
        let mut current = self.execution(id)?.parent_id;
        while let Some(parent_id) = current {
            if chain.len() > self.executions.len() || parent_id == id || chain.contains(&parent_id) {
                return Err(EngineError::CorruptTree(format!(
                    "parent cycle detected above execution {id}"
                )));
            }
            let parent = self.executions.get(&parent_id).ok_or_else(|| {
                EngineError::CorruptTree(format!(
                    "execution {id} has dangling ancestor {parent_id}"
                ))
            })?;
            chain.push(parent_id);
            current = parent.parent_id;
        }
        Ok(chain)
    }

    /// `id` itself if it is a scope, otherwise its nearest scope ancestor.
    pub fn find_enclosing_scope(&self, id: Uuid) -> Result<Uuid, EngineError> {
        if self.execution(id)?.is_scope {
            return Ok(id);
        }
        self.find_parent_scope(id)
    }

    /// Nearest scope strictly above `id`.
    pub fn find_parent_scope(&self, id: Uuid) -> Result<Uuid, EngineError> {
        for ancestor in self.ancestors(id)? {
            if self.execution(ancestor)?.is_scope {
                return Ok(ancestor);
            }
        }
        Err(EngineError::NoEnclosingScope(id))
    }

    /// Active executions, excluding `except`.
    pub fn active_execution_count(&self, except: Option<Uuid>) -> usize {
        self.executions
            .values()
            .filter(|e| e.is_active && !e.is_ended && Some(e.id) != except)
            .count()
    }

    /// Check the tree is well-formed: one root, every parent present and no
    /// cycles.
    pub fn verify_integrity(&self) -> Result<(), EngineError> {
        let roots = self.executions.values().filter(|e| e.is_root()).count();
        if roots > 1 {
            return Err(EngineError::CorruptTree(format!("{roots} root executions")));
        }
        for id in self.executions.keys() {
            self.ancestors(*id)?;
        }
        Ok(())
    }

    /// Remove an execution and everything it owns. Children are left
    /// untouched; use [`delete_subtree`](Self::delete_subtree) for those.
    pub fn delete_execution(&mut self, id: Uuid) -> Result<Execution, EngineError> {
        self.delete_execution_data(id);
        self.executions
            .remove(&id)
            .ok_or(EngineError::ExecutionNotFound(id))
    }

    /// Remove `id` and all its descendants, deepest first. Returns the number
    /// of executions removed.
    pub fn delete_subtree(&mut self, id: Uuid) -> Result<usize, EngineError> {
        self.execution(id)?;
        let mut order = Vec::new();
        let mut stack = vec![id];
        let mut seen = HashSet::new();
        while let Some(next) = stack.pop() {
            if !seen.insert(next) {
                return Err(EngineError::CorruptTree(format!(
                    "execution {next} reached twice while deleting {id}"
                )));
            }
            order.push(next);
            stack.extend(self.children(next));
        }
        for execution_id in order.iter().rev() {
            self.delete_execution(*execution_id)?;
        }
        Ok(order.len())
    }

    /// Remove the tasks, jobs, variables and subscriptions owned by `id`.
    pub fn delete_execution_data(&mut self, id: Uuid) {
        self.delete_tasks_for_execution(id);
        self.delete_jobs_for_execution(id);
        self.delete_subscriptions_for_execution(id);
        self.delete_variables_for_execution(id);
    }

    // -----------------------------------------------------------------------
    // Tasks and identity links
    // -----------------------------------------------------------------------

    pub fn insert_task(&mut self, task: Task) {
        self.tasks.insert(task.id, task);
    }

    pub fn task(&self, id: Uuid) -> Option<&Task> {
        self.tasks.get(&id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn tasks_for_execution(&self, execution_id: Uuid) -> Vec<&Task> {
        self.tasks
            .values()
            .filter(|t| t.execution_id == execution_id)
            .collect()
    }

    /// Delete the tasks of an execution together with their identity links.
    pub fn delete_tasks_for_execution(&mut self, execution_id: Uuid) -> usize {
        let ids: Vec<Uuid> = self
            .tasks
            .values()
            .filter(|t| t.execution_id == execution_id)
            .map(|t| t.id)
            .collect();
        for id in &ids {
            self.tasks.remove(id);
            self.identity_links.retain(|_, l| l.task_id != Some(*id));
        }
        ids.len()
    }

    pub fn insert_identity_link(&mut self, link: IdentityLink) {
        self.identity_links.insert(link.id, link);
    }

    pub fn identity_links(&self) -> impl Iterator<Item = &IdentityLink> {
        self.identity_links.values()
    }

    pub fn delete_identity_links(&mut self) {
        self.identity_links.clear();
    }

    // -----------------------------------------------------------------------
    // Jobs
    // -----------------------------------------------------------------------

    pub fn insert_job(&mut self, job: Job) {
        self.jobs.insert(job.id, job);
    }

    pub fn job(&self, id: Uuid) -> Option<&Job> {
        self.jobs.get(&id)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn remove_job(&mut self, id: Uuid) -> Option<Job> {
        self.jobs.remove(&id)
    }

    pub fn delete_jobs_for_execution(&mut self, execution_id: Uuid) {
        self.jobs.retain(|_, j| j.execution_id != execution_id);
    }

    // -----------------------------------------------------------------------
    // Event subscriptions
    // -----------------------------------------------------------------------

    pub fn insert_subscription(&mut self, subscription: EventSubscription) {
        self.subscriptions.insert(subscription.id, subscription);
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &EventSubscription> {
        self.subscriptions.values()
    }

    /// Subscriptions for a named message or signal, in creation order.
    pub fn find_subscriptions(&self, event_type: EventType, name: &str) -> Vec<&EventSubscription> {
        self.subscriptions
            .values()
            .filter(|s| s.event_type == event_type && s.event_name == name)
            .collect()
    }

    pub fn delete_subscriptions_for_execution(&mut self, execution_id: Uuid) {
        self.subscriptions.retain(|_, s| s.execution_id != execution_id);
    }

    // -----------------------------------------------------------------------
    // Variables
    // -----------------------------------------------------------------------

    /// Variable declared directly on `execution_id`.
    pub fn local_variable(&self, execution_id: Uuid, name: &str) -> Option<&Value> {
        self.variables
            .values()
            .find(|v| v.execution_id == execution_id && v.name == name)
            .map(|v| &v.value)
    }

    /// Nearest declaration of `name`, searching `execution_id` then its
    /// ancestors.
    pub fn variable(&self, execution_id: Uuid, name: &str) -> Result<Option<&Value>, EngineError> {
        if let Some(value) = self.local_variable(execution_id, name) {
            return Ok(Some(value));
        }
        for ancestor in self.ancestors(execution_id)? {
            if let Some(value) = self.local_variable(ancestor, name) {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    pub fn set_local_variable(
        &mut self,
        execution_id: Uuid,
        name: &str,
        value: Value,
    ) -> Result<(), EngineError> {
        self.execution(execution_id)?;
        if let Some(existing) = self
            .variables
            .values_mut()
            .find(|v| v.execution_id == execution_id && v.name == name)
        {
            existing.value = value;
            return Ok(());
        }
        let variable = Variable {
            id: Uuid::now_v7(),
            execution_id,
            process_instance_id: self.instance.id,
            name: name.to_string(),
            value,
        };
        self.variables.insert(variable.id, variable);
        Ok(())
    }

    /// Update the nearest execution that declares `name`; declare it on the
    /// root when nobody does.
    pub fn set_variable(
        &mut self,
        execution_id: Uuid,
        name: &str,
        value: Value,
    ) -> Result<(), EngineError> {
        let mut chain = vec![execution_id];
        chain.extend(self.ancestors(execution_id)?);
        let owner = chain
            .iter()
            .copied()
            .find(|id| self.local_variable(*id, name).is_some())
            .or_else(|| chain.last().copied())
            .unwrap_or(execution_id);
        self.set_local_variable(owner, name, value)
    }

    pub fn remove_local_variable(&mut self, execution_id: Uuid, name: &str) -> Option<Value> {
        let id = self
            .variables
            .values()
            .find(|v| v.execution_id == execution_id && v.name == name)
            .map(|v| v.id)?;
        self.variables.remove(&id).map(|v| v.value)
    }

    /// All variables visible from `execution_id`; nearer declarations win.
    pub fn visible_variables(&self, execution_id: Uuid) -> Result<Map<String, Value>, EngineError> {
        let mut chain = self.ancestors(execution_id)?;
        chain.reverse();
        chain.push(execution_id);

        let mut visible = Map::new();
        for id in chain {
            for variable in self.variables.values().filter(|v| v.execution_id == id) {
                visible.insert(variable.name.clone(), variable.value.clone());
            }
        }
        Ok(visible)
    }

    pub fn variables(&self) -> impl Iterator<Item = &Variable> {
        self.variables.values()
    }

    pub fn delete_variables_for_execution(&mut self, execution_id: Uuid) {
        self.variables.retain(|_, v| v.execution_id != execution_id);
    }
}
