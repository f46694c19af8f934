use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::GraphError;

/// A `(label, id)` node address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeRef<'a> {
    pub label: &'a str,
    pub id: &'a str,
}

impl<'a> NodeRef<'a> {
    pub fn new(label: &'a str, id: &'a str) -> Self {
        Self { label, id }
    }
}

/// Property-graph store with MERGE-idempotent upserts on `id`-labeled nodes.
///
/// Implementations must make every operation safe to replay: merging the same
/// node or edge twice leaves the graph unchanged apart from refreshed
/// property values.
#[async_trait]
pub trait GraphBackend: Send + Sync {
    /// `MERGE (n:label {id}) SET n += props`.
    async fn merge_node(
        &self,
        label: &str,
        id: &str,
        props: &Map<String, Value>,
    ) -> Result<(), GraphError>;

    /// Merge a relationship. With `create_endpoints` the endpoints are merged
    /// into existence first; without it the edge is only written when both
    /// endpoints already exist (a silent no-op otherwise).
    async fn merge_edge(
        &self,
        from: NodeRef<'_>,
        rel: &str,
        to: NodeRef<'_>,
        props: &Map<String, Value>,
        create_endpoints: bool,
    ) -> Result<(), GraphError>;

    /// Merge the node, apply `props`, and increment `counter` from a missing
    /// or existing numeric property.
    async fn merge_node_incrementing(
        &self,
        label: &str,
        id: &str,
        props: &Map<String, Value>,
        counter: &str,
    ) -> Result<(), GraphError>;

    async fn fetch_node(
        &self,
        label: &str,
        id: &str,
    ) -> Result<Option<Map<String, Value>>, GraphError>;

    async fn fetch_nodes(&self, label: &str) -> Result<Vec<Map<String, Value>>, GraphError>;
}
