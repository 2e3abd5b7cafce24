//! In-memory cache of deployed process graphs.
//!
//! Graphs are immutable once built and shared as `Arc<ProcessGraph>`. The
//! cache indexes them by definition ID and keeps the latest version per
//! (tenant, key) so new instances start on the newest deployment.

use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

use super::graph::ProcessGraph;

/// Concurrent map of deployed definitions.
#[derive(Debug, Default)]
pub struct DefinitionCache {
    by_id: DashMap<Uuid, Arc<ProcessGraph>>,
    /// (tenant, key) -> (version, definition ID)
    latest: DashMap<(Option<String>, String), (u32, Uuid)>,
}

impl DefinitionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a graph, replacing any graph with the same definition ID.
    pub fn insert(&self, graph: Arc<ProcessGraph>) -> Arc<ProcessGraph> {
        let def = graph.definition();
        let latest_key = (def.tenant_id.clone(), def.key.clone());
        let version = def.version;
        let id = def.id;

        self.latest
            .entry(latest_key)
            .and_modify(|current| {
                if version >= current.0 {
                    *current = (version, id);
                }
            })
            .or_insert((version, id));
        self.by_id.insert(id, Arc::clone(&graph));
        graph
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<ProcessGraph>> {
        self.by_id.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Newest cached version of `key` for `tenant`.
    pub fn latest(&self, key: &str, tenant: Option<&str>) -> Option<Arc<ProcessGraph>> {
        let (_, id) = *self
            .latest
            .get(&(tenant.map(str::to_string), key.to_string()))?
            .value();
        self.get(&id)
    }

    /// Drop a graph. The latest-version index forgets it too.
    pub fn evict(&self, id: &Uuid) -> bool {
        let removed = self.by_id.remove(id).is_some();
        self.latest.retain(|_, (_, latest_id)| latest_id != id);
        removed
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::DefaultBehaviorFactory;
    use crate::process::definition::parse_process_yaml;

    fn graph(version: u32) -> Arc<ProcessGraph> {
        let mut def = parse_process_yaml(
            r#"
key: simple
nodes:
  - id: start
    type: start_event
  - id: end
    type: end_event
flows:
  - { id: f1, source: start, target: end }
"#,
        )
        .unwrap();
        def.version = version;
        Arc::new(ProcessGraph::build(def, &DefaultBehaviorFactory).unwrap())
    }

    #[test]
    fn latest_tracks_highest_version() {
        let cache = DefinitionCache::new();
        let v2 = cache.insert(graph(2));
        let v1 = cache.insert(graph(1));

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.latest("simple", None).unwrap().id(), v2.id());
        assert!(Arc::ptr_eq(&cache.get(&v1.id()).unwrap(), &v1));
        assert!(cache.latest("simple", Some("acme")).is_none());
    }

    #[test]
    fn evict_removes_from_both_indexes() {
        let cache = DefinitionCache::new();
        let g = cache.insert(graph(1));
        assert!(cache.evict(&g.id()));
        assert!(cache.get(&g.id()).is_none());
        assert!(cache.latest("simple", None).is_none());
        assert!(cache.is_empty());
        assert!(!cache.evict(&g.id()));
    }
}
