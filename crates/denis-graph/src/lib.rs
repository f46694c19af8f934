//! Graph Materialization Layer: fail-open projection of `event_v1` into the
//! operational property graph (the SSoT), plus the 12-layer neuro model.

use thiserror::Error;

mod backend;
mod client;
pub mod intent_plan;
mod materializer;
mod memory;
mod neo4j_http;
pub mod neuro;

pub use backend::{GraphBackend, NodeRef};
pub use client::{GraphClient, GraphStatus};
pub use intent_plan::{create_intent_plan_tasks, IntentPlanResult};
pub use materializer::{Materializer, MaterializerStats, MappingResult};
pub use memory::MemoryGraph;
pub use neo4j_http::Neo4jHttpBackend;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("graph transport error: {0}")]
    Transport(String),
    #[error("graph returned status {0}")]
    Status(u16),
    #[error("graph server error: {0}")]
    Server(String),
    #[error("graph response decode error: {0}")]
    Decode(String),
}
