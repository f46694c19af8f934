use denis_graph::{GraphClient, Materializer};
use denis_hub::EventHub;
use denis_persona::{Frontdoor, FrontdoorPolicy};
use denis_store::{EventStore, MutationLog};
use std::sync::Arc;

use crate::telemetry::TelemetryStore;

/// Shared server state: explicit construction, no process-wide globals.
#[derive(Clone)]
pub struct AppState {
    pub frontdoor: Arc<Frontdoor>,
    pub graph: Arc<GraphClient>,
    pub telemetry: Arc<TelemetryStore>,
    pub bearer_token: Option<String>,
}

impl AppState {
    /// Production wiring from the environment: on-disk stores, env-gated
    /// graph backend, env frontdoor policy.
    pub fn from_env() -> anyhow::Result<Self> {
        let store = Arc::new(EventStore::open(EventStore::default_path())?);
        let dedupe = Arc::new(MutationLog::open(MutationLog::default_path())?);
        let graph = Arc::new(GraphClient::from_env());
        let policy = FrontdoorPolicy::from_env();
        Ok(Self::assemble(store, dedupe, graph, policy, bearer_from_env()))
    }

    /// Explicit wiring (tests, embedding).
    pub fn with_components(
        store: Arc<EventStore>,
        dedupe: Arc<MutationLog>,
        graph: Arc<GraphClient>,
        policy: FrontdoorPolicy,
        bearer_token: Option<String>,
    ) -> Self {
        Self::assemble(store, dedupe, graph, policy, bearer_token)
    }

    fn assemble(
        store: Arc<EventStore>,
        dedupe: Arc<MutationLog>,
        graph: Arc<GraphClient>,
        policy: FrontdoorPolicy,
        bearer_token: Option<String>,
    ) -> Self {
        let hub = Arc::new(EventHub::new());
        let materializer = Arc::new(Materializer::new(graph.clone(), dedupe));
        let frontdoor = Arc::new(Frontdoor::with_policy(store, hub, materializer, policy));
        Self {
            frontdoor,
            graph,
            telemetry: Arc::new(TelemetryStore::new()),
            bearer_token,
        }
    }
}

fn bearer_from_env() -> Option<String> {
    std::env::var("DENIS_API_BEARER_TOKEN")
        .ok()
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
}
