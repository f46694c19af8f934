use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use crate::backend::{GraphBackend, NodeRef};
use crate::GraphError;

type NodeKey = (String, String);
type EdgeKey = (String, String, String, String, String);

#[derive(Default)]
struct MemoryGraphInner {
    nodes: BTreeMap<NodeKey, Map<String, Value>>,
    edges: BTreeMap<EdgeKey, Map<String, Value>>,
    writes: u64,
}

/// In-process graph backend with MERGE semantics. Used by tests and as a
/// stand-in when no graph server is reachable from a dev checkout.
#[derive(Default)]
pub struct MemoryGraph {
    inner: Mutex<MemoryGraphInner>,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryGraphInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Total backend calls that mutated (or attempted to mutate) the graph.
    pub fn write_count(&self) -> u64 {
        self.lock().writes
    }

    pub fn node(&self, label: &str, id: &str) -> Option<Map<String, Value>> {
        self.lock()
            .nodes
            .get(&(label.to_string(), id.to_string()))
            .cloned()
    }

    pub fn nodes_with_label(&self, label: &str) -> Vec<(String, Map<String, Value>)> {
        self.lock()
            .nodes
            .iter()
            .filter(|((l, _), _)| l == label)
            .map(|((_, id), props)| (id.clone(), props.clone()))
            .collect()
    }

    pub fn node_count(&self) -> usize {
        self.lock().nodes.len()
    }

    pub fn has_edge(
        &self,
        from_label: &str,
        from_id: &str,
        rel: &str,
        to_label: &str,
        to_id: &str,
    ) -> bool {
        self.lock()
            .edges
            .contains_key(&edge_key(from_label, from_id, rel, to_label, to_id))
    }

    pub fn edge_props(
        &self,
        from_label: &str,
        from_id: &str,
        rel: &str,
        to_label: &str,
        to_id: &str,
    ) -> Option<Map<String, Value>> {
        self.lock()
            .edges
            .get(&edge_key(from_label, from_id, rel, to_label, to_id))
            .cloned()
    }

    pub fn edge_count(&self) -> usize {
        self.lock().edges.len()
    }
}

fn edge_key(from_label: &str, from_id: &str, rel: &str, to_label: &str, to_id: &str) -> EdgeKey {
    (
        from_label.to_string(),
        from_id.to_string(),
        rel.to_string(),
        to_label.to_string(),
        to_id.to_string(),
    )
}

fn merge_into(target: &mut Map<String, Value>, props: &Map<String, Value>) {
    for (key, value) in props {
        target.insert(key.clone(), value.clone());
    }
}

#[async_trait]
impl GraphBackend for MemoryGraph {
    async fn merge_node(
        &self,
        label: &str,
        id: &str,
        props: &Map<String, Value>,
    ) -> Result<(), GraphError> {
        let mut inner = self.lock();
        inner.writes += 1;
        let entry = inner
            .nodes
            .entry((label.to_string(), id.to_string()))
            .or_default();
        entry.insert("id".to_string(), Value::String(id.to_string()));
        merge_into(entry, props);
        Ok(())
    }

    async fn merge_edge(
        &self,
        from: NodeRef<'_>,
        rel: &str,
        to: NodeRef<'_>,
        props: &Map<String, Value>,
        create_endpoints: bool,
    ) -> Result<(), GraphError> {
        let mut inner = self.lock();
        inner.writes += 1;

        let from_key = (from.label.to_string(), from.id.to_string());
        let to_key = (to.label.to_string(), to.id.to_string());
        if create_endpoints {
            for (key, id) in [(&from_key, from.id), (&to_key, to.id)] {
                let entry = inner.nodes.entry(key.clone()).or_default();
                entry.insert("id".to_string(), Value::String(id.to_string()));
            }
        } else if !inner.nodes.contains_key(&from_key) || !inner.nodes.contains_key(&to_key) {
            // MATCH semantics: missing endpoints mean no edge, not an error.
            return Ok(());
        }

        let entry = inner
            .edges
            .entry(edge_key(from.label, from.id, rel, to.label, to.id))
            .or_default();
        merge_into(entry, props);
        Ok(())
    }

    async fn merge_node_incrementing(
        &self,
        label: &str,
        id: &str,
        props: &Map<String, Value>,
        counter: &str,
    ) -> Result<(), GraphError> {
        let mut inner = self.lock();
        inner.writes += 1;
        let entry = inner
            .nodes
            .entry((label.to_string(), id.to_string()))
            .or_default();
        entry.insert("id".to_string(), Value::String(id.to_string()));
        merge_into(entry, props);
        let current = entry.get(counter).and_then(Value::as_i64).unwrap_or(0);
        entry.insert(counter.to_string(), Value::from(current + 1));
        Ok(())
    }

    async fn fetch_node(
        &self,
        label: &str,
        id: &str,
    ) -> Result<Option<Map<String, Value>>, GraphError> {
        Ok(self.node(label, id))
    }

    async fn fetch_nodes(&self, label: &str) -> Result<Vec<Map<String, Value>>, GraphError> {
        Ok(self
            .nodes_with_label(label)
            .into_iter()
            .map(|(_, props)| props)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn merge_node_is_idempotent_on_replay() {
        let graph = MemoryGraph::new();
        let props: Map<String, Value> =
            serde_json::json!({"status": "ok"}).as_object().cloned().unwrap_or_default();
        graph.merge_node("Component", "ws_event_bus", &props).await.expect("merge");
        graph.merge_node("Component", "ws_event_bus", &props).await.expect("merge again");
        assert_eq!(graph.node_count(), 1);
        let node = graph.node("Component", "ws_event_bus").expect("node");
        assert_eq!(node["status"], "ok");
        assert_eq!(node["id"], "ws_event_bus");
    }

    #[tokio::test]
    async fn match_edges_require_existing_endpoints() {
        let graph = MemoryGraph::new();
        let empty = Map::new();
        graph
            .merge_edge(
                NodeRef::new("Run", "r1"),
                "HAS_STEP",
                NodeRef::new("Step", "s1"),
                &empty,
                false,
            )
            .await
            .expect("edge");
        assert_eq!(graph.edge_count(), 0);

        graph.merge_node("Run", "r1", &empty).await.expect("run");
        graph.merge_node("Step", "s1", &empty).await.expect("step");
        graph
            .merge_edge(
                NodeRef::new("Run", "r1"),
                "HAS_STEP",
                NodeRef::new("Step", "s1"),
                &empty,
                false,
            )
            .await
            .expect("edge");
        assert!(graph.has_edge("Run", "r1", "HAS_STEP", "Step", "s1"));
    }

    #[tokio::test]
    async fn create_endpoint_edges_bootstrap_nodes() {
        let graph = MemoryGraph::new();
        let empty = Map::new();
        graph
            .merge_edge(
                NodeRef::new("Identity", "identity:denis"),
                "HAS_NEURO_LAYER",
                NodeRef::new("NeuroLayer", "neuro:layer:1"),
                &empty,
                true,
            )
            .await
            .expect("edge");
        assert!(graph.node("Identity", "identity:denis").is_some());
        assert!(graph.node("NeuroLayer", "neuro:layer:1").is_some());
        assert_eq!(graph.edge_count(), 1);
    }

    #[tokio::test]
    async fn increment_counts_from_missing_property() {
        let graph = MemoryGraph::new();
        let props: Map<String, Value> =
            serde_json::json!({"last_event_ts": "t1"}).as_object().cloned().unwrap_or_default();
        graph
            .merge_node_incrementing("VoiceSession", "vs1", &props, "error_count")
            .await
            .expect("first");
        graph
            .merge_node_incrementing("VoiceSession", "vs1", &props, "error_count")
            .await
            .expect("second");
        let node = graph.node("VoiceSession", "vs1").expect("node");
        assert_eq!(node["error_count"], 2);
    }
}
