use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Counters {
    requests_total: u64,
    by_path: HashMap<String, u64>,
    by_status: HashMap<String, u64>,
    last_request_utc: String,
    chat_total: u64,
    chat_degraded: u64,
    voice_total: u64,
}

/// In-memory request/chat counters for `/telemetry` and `/health`. No
/// external deps, always fail-open.
pub struct TelemetryStore {
    started_utc: String,
    counters: Mutex<Counters>,
}

impl TelemetryStore {
    pub fn new() -> Self {
        Self {
            started_utc: denis_core::utc_now_iso(),
            counters: Mutex::new(Counters::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Counters> {
        self.counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record_request(&self, path: &str, status: u16) {
        let mut counters = self.lock();
        counters.requests_total += 1;
        *counters.by_path.entry(path.to_string()).or_default() += 1;
        *counters.by_status.entry(status.to_string()).or_default() += 1;
        counters.last_request_utc = denis_core::utc_now_iso();
    }

    pub fn record_chat(&self, degraded: bool) {
        let mut counters = self.lock();
        counters.chat_total += 1;
        if degraded {
            counters.chat_degraded += 1;
        }
    }

    pub fn record_voice(&self) {
        self.lock().voice_total += 1;
    }

    pub fn requests_block(&self) -> Value {
        let counters = self.lock();
        json!({
            "total_1h": counters.requests_total,
            "error_rate_1h": 0.0,
            "latency_p95_ms": 0,
            "by_path": counters.by_path,
            "by_status": counters.by_status,
            "last_request_utc": counters.last_request_utc,
        })
    }

    pub fn chat_block(&self) -> Value {
        let counters = self.lock();
        json!({
            "total": counters.chat_total,
            "degraded_total": counters.chat_degraded,
            "voice_total": counters.voice_total,
        })
    }

    pub fn started_utc(&self) -> &str {
        &self.started_utc
    }
}

impl Default for TelemetryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let store = TelemetryStore::new();
        store.record_request("/health", 200);
        store.record_request("/health", 200);
        store.record_request("/v1/events", 200);
        store.record_chat(false);
        store.record_chat(true);

        let requests = store.requests_block();
        assert_eq!(requests["total_1h"], 3);
        assert_eq!(requests["by_path"]["/health"], 2);
        assert_eq!(requests["by_status"]["200"], 3);

        let chat = store.chat_block();
        assert_eq!(chat["total"], 2);
        assert_eq!(chat["degraded_total"], 1);
    }
}
