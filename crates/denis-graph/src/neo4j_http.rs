use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::time::Duration;

use crate::backend::{GraphBackend, NodeRef};
use crate::GraphError;

/// Neo4j backend over the HTTP transactional Cypher endpoint.
///
/// Credentials come from `NEO4J_URI`/`NEO4J_USER`/`NEO4J_PASSWORD`; a missing
/// password disables the backend entirely (the client then no-ops). Timeouts
/// stay short so a slow graph can never stall the event pipeline.
pub struct Neo4jHttpBackend {
    client: reqwest::Client,
    endpoint: String,
    user: String,
    password: String,
    write_timeout: Duration,
    read_timeout: Duration,
}

impl Neo4jHttpBackend {
    pub fn from_env() -> Option<Self> {
        let password = std::env::var("NEO4J_PASSWORD")
            .or_else(|_| std::env::var("NEO4J_PASS"))
            .ok()?;
        if password.trim().is_empty() {
            return None;
        }
        let uri =
            std::env::var("NEO4J_URI").unwrap_or_else(|_| "http://127.0.0.1:7474".to_string());
        let user = std::env::var("NEO4J_USER").unwrap_or_else(|_| "neo4j".to_string());

        let connect_timeout =
            Duration::from_secs_f64(denis_core::env_f64("DENIS_GRAPH_WRITE_CONNECT_TIMEOUT_S", 0.5));
        let write_timeout =
            Duration::from_secs_f64(denis_core::env_f64("DENIS_GRAPH_WRITE_TIMEOUT_S", 1.2));
        let read_timeout =
            Duration::from_secs_f64(denis_core::env_f64("DENIS_GRAPH_READ_TIMEOUT_S", 1.5));

        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .ok()?;

        Some(Self {
            client,
            endpoint: format!("{}/db/neo4j/tx/commit", uri.trim_end_matches('/')),
            user,
            password,
            write_timeout,
            read_timeout,
        })
    }

    async fn commit(
        &self,
        statement: &str,
        parameters: Value,
        timeout: Duration,
    ) -> Result<Value, GraphError> {
        let body = json!({
            "statements": [{ "statement": statement, "parameters": parameters }]
        });
        let response = self
            .client
            .post(&self.endpoint)
            .basic_auth(&self.user, Some(&self.password))
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|err| GraphError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(GraphError::Status(status.as_u16()));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|err| GraphError::Decode(err.to_string()))?;

        if let Some(errors) = payload.get("errors").and_then(Value::as_array) {
            if let Some(first) = errors.first() {
                let message = first
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown cypher error");
                return Err(GraphError::Server(message.to_string()));
            }
        }
        Ok(payload)
    }

    fn rows(payload: &Value) -> Vec<Map<String, Value>> {
        payload
            .get("results")
            .and_then(Value::as_array)
            .and_then(|results| results.first())
            .and_then(|result| result.get("data"))
            .and_then(Value::as_array)
            .map(|data| {
                data.iter()
                    .filter_map(|entry| entry.get("row"))
                    .filter_map(Value::as_array)
                    .filter_map(|row| row.first())
                    .filter_map(Value::as_object)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl GraphBackend for Neo4jHttpBackend {
    async fn merge_node(
        &self,
        label: &str,
        id: &str,
        props: &Map<String, Value>,
    ) -> Result<(), GraphError> {
        let statement = format!("MERGE (n:{label} {{id: $id}}) SET n += $props");
        self.commit(
            &statement,
            json!({ "id": id, "props": props }),
            self.write_timeout,
        )
        .await
        .map(|_| ())
    }

    async fn merge_edge(
        &self,
        from: NodeRef<'_>,
        rel: &str,
        to: NodeRef<'_>,
        props: &Map<String, Value>,
        create_endpoints: bool,
    ) -> Result<(), GraphError> {
        let clause = if create_endpoints { "MERGE" } else { "MATCH" };
        let statement = format!(
            "{clause} (a:{from_label} {{id: $from_id}}) \
             {clause} (b:{to_label} {{id: $to_id}}) \
             MERGE (a)-[r:{rel}]->(b) SET r += $props",
            from_label = from.label,
            to_label = to.label,
        );
        self.commit(
            &statement,
            json!({ "from_id": from.id, "to_id": to.id, "props": props }),
            self.write_timeout,
        )
        .await
        .map(|_| ())
    }

    async fn merge_node_incrementing(
        &self,
        label: &str,
        id: &str,
        props: &Map<String, Value>,
        counter: &str,
    ) -> Result<(), GraphError> {
        let statement = format!(
            "MERGE (n:{label} {{id: $id}}) SET n += $props \
             SET n.{counter} = COALESCE(n.{counter}, 0) + 1"
        );
        self.commit(
            &statement,
            json!({ "id": id, "props": props }),
            self.write_timeout,
        )
        .await
        .map(|_| ())
    }

    async fn fetch_node(
        &self,
        label: &str,
        id: &str,
    ) -> Result<Option<Map<String, Value>>, GraphError> {
        let statement = format!("MATCH (n:{label} {{id: $id}}) RETURN n {{.*}}");
        let payload = self
            .commit(&statement, json!({ "id": id }), self.read_timeout)
            .await?;
        Ok(Self::rows(&payload).into_iter().next())
    }

    async fn fetch_nodes(&self, label: &str) -> Result<Vec<Map<String, Value>>, GraphError> {
        let statement = format!("MATCH (n:{label}) RETURN n {{.*}}");
        let payload = self.commit(&statement, json!({}), self.read_timeout).await?;
        Ok(Self::rows(&payload))
    }
}
