use std::collections::HashMap;

/// Running emitter counters, updated on every `persona_emit`.
#[derive(Debug, Default)]
pub(crate) struct EmitterStats {
    pub total: u64,
    pub stored_true: u64,
    pub stored_false: u64,
    pub by_channel: HashMap<String, u64>,
    pub by_type: HashMap<String, u64>,
    pub last_emit_ts: String,
}

impl EmitterStats {
    pub fn record(&mut self, channel: &str, event_type: &str, stored: bool) {
        self.total += 1;
        if stored {
            self.stored_true += 1;
        } else {
            self.stored_false += 1;
        }
        *self.by_channel.entry(channel.to_string()).or_default() += 1;
        *self.by_type.entry(event_type.to_string()).or_default() += 1;
        self.last_emit_ts = denis_core::utc_now_iso();
    }

    pub fn snapshot(&self) -> EmitterStatsSnapshot {
        let mut by_type_top: Vec<(String, u64)> = self
            .by_type
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        by_type_top.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        by_type_top.truncate(25);

        EmitterStatsSnapshot {
            emitter: denis_core::EMITTER_PERSONA,
            total: self.total,
            stored_true: self.stored_true,
            stored_false: self.stored_false,
            by_channel: self.by_channel.clone(),
            by_type_top,
            last_emit_ts: self.last_emit_ts.clone(),
        }
    }
}

/// Point-in-time emitter counters for `/telemetry`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmitterStatsSnapshot {
    pub emitter: &'static str,
    pub total: u64,
    pub stored_true: u64,
    pub stored_false: u64,
    pub by_channel: HashMap<String, u64>,
    pub by_type_top: Vec<(String, u64)>,
    pub last_emit_ts: String,
}

impl EmitterStatsSnapshot {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "emitter": self.emitter,
            "total": self.total,
            "stored_true": self.stored_true,
            "stored_false": self.stored_false,
            "by_channel": self.by_channel,
            "by_type_top": self.by_type_top.iter().cloned().collect::<HashMap<_, _>>(),
            "last_emit_ts": self.last_emit_ts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_tracks_channels_and_types() {
        let mut stats = EmitterStats::default();
        stats.record("ops", "ops.metric", true);
        stats.record("ops", "run.step", true);
        stats.record("text", "chat.message", false);

        let snap = stats.snapshot();
        assert_eq!(snap.total, 3);
        assert_eq!(snap.stored_true, 2);
        assert_eq!(snap.stored_false, 1);
        assert_eq!(snap.by_channel["ops"], 2);
        assert_eq!(snap.by_type_top.len(), 3);
        assert!(!snap.last_emit_ts.is_empty());
    }
}
