//! 12-layer neuro model: pure data and derivation, no I/O.

use serde_json::{Map, Value};

pub const CONSCIOUSNESS_ID: &str = "denis:consciousness";

/// Fixed definition order; `layer_index` is 1-based.
pub const LAYER_DEFINITIONS: [(i64, &str, &str); 12] = [
    (1, "sensory_io", "Sensory/IO"),
    (2, "attention", "Attention"),
    (3, "intent_goals", "Intent/Goals"),
    (4, "plans_procedures", "Plans/Procedures"),
    (5, "memory_short", "Memory Short"),
    (6, "memory_long", "Memory Long"),
    (7, "safety_governance", "Safety/Governance"),
    (8, "ops_awareness", "Ops Awareness"),
    (9, "social_persona", "Social/Persona"),
    (10, "self_monitoring", "Self-Monitoring"),
    (11, "learning_plasticity", "Learning/Plasticity"),
    (12, "meta_consciousness", "Meta/Consciousness"),
];

/// Critical layers carry double weight in the fatigue mean.
const CRITICAL_FATIGUE_KEYS: [&str; 3] = ["sensory_io", "ops_awareness", "meta_consciousness"];

#[derive(Debug, Clone, PartialEq)]
pub struct NeuroLayerState {
    pub layer_index: i64,
    pub layer_key: String,
    pub title: String,
    pub freshness_score: f64,
    pub status: String,
    pub signals_count: i64,
    pub last_update_ts: String,
    pub notes_hash: String,
}

impl NeuroLayerState {
    pub fn id(&self) -> String {
        format!("neuro:layer:{}", self.layer_index)
    }

    pub fn to_props(&self) -> Map<String, Value> {
        let mut props = Map::new();
        props.insert("layer_index".into(), Value::from(self.layer_index));
        props.insert("layer_key".into(), Value::String(self.layer_key.clone()));
        props.insert("title".into(), Value::String(self.title.clone()));
        props.insert("freshness_score".into(), Value::from(self.freshness_score));
        props.insert("status".into(), Value::String(self.status.clone()));
        props.insert("signals_count".into(), Value::from(self.signals_count));
        props.insert(
            "last_update_ts".into(),
            Value::String(self.last_update_ts.clone()),
        );
        props.insert("notes_hash".into(), Value::String(self.notes_hash.clone()));
        props
    }

    pub fn from_props(props: &Map<String, Value>) -> Self {
        Self {
            layer_index: props.get("layer_index").and_then(Value::as_i64).unwrap_or(0),
            layer_key: str_prop(props, "layer_key", ""),
            title: str_prop(props, "title", ""),
            freshness_score: props
                .get("freshness_score")
                .and_then(Value::as_f64)
                .unwrap_or(0.5),
            status: str_prop(props, "status", "ok"),
            signals_count: props
                .get("signals_count")
                .and_then(Value::as_i64)
                .unwrap_or(0),
            last_update_ts: str_prop(props, "last_update_ts", ""),
            notes_hash: str_prop(props, "notes_hash", ""),
        }
    }
}

fn str_prop(props: &Map<String, Value>, key: &str, default: &str) -> String {
    props
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or(default)
        .to_string()
}

/// The 12 layers with fresh defaults.
pub fn default_layers() -> Vec<NeuroLayerState> {
    let now = denis_core::utc_now_iso();
    LAYER_DEFINITIONS
        .iter()
        .map(|(index, key, title)| NeuroLayerState {
            layer_index: *index,
            layer_key: (*key).to_string(),
            title: (*title).to_string(),
            freshness_score: 0.5,
            status: "ok".to_string(),
            signals_count: 0,
            last_update_ts: now.clone(),
            notes_hash: String::new(),
        })
        .collect()
}

/// Derived singleton summarizing mode, risk, fatigue, confidence and the
/// operating modes.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsciousnessState {
    pub mode: String,
    pub focus_topic_hash: String,
    pub fatigue_level: f64,
    pub risk_level: f64,
    pub confidence_level: f64,
    pub last_wake_ts: String,
    pub last_turn_ts: String,
    pub guardrails_mode: String,
    pub memory_mode: String,
    pub voice_mode: String,
    pub ops_mode: String,
}

impl Default for ConsciousnessState {
    fn default() -> Self {
        Self {
            mode: "awake".to_string(),
            focus_topic_hash: String::new(),
            fatigue_level: 0.0,
            risk_level: 0.0,
            confidence_level: 0.7,
            last_wake_ts: String::new(),
            last_turn_ts: String::new(),
            guardrails_mode: "normal".to_string(),
            memory_mode: "balanced".to_string(),
            voice_mode: "off".to_string(),
            ops_mode: "normal".to_string(),
        }
    }
}

impl ConsciousnessState {
    pub fn to_props(&self) -> Map<String, Value> {
        let mut props = Map::new();
        props.insert("mode".into(), Value::String(self.mode.clone()));
        props.insert(
            "focus_topic_hash".into(),
            Value::String(self.focus_topic_hash.clone()),
        );
        props.insert("fatigue_level".into(), Value::from(self.fatigue_level));
        props.insert("risk_level".into(), Value::from(self.risk_level));
        props.insert(
            "confidence_level".into(),
            Value::from(self.confidence_level),
        );
        props.insert(
            "last_wake_ts".into(),
            Value::String(self.last_wake_ts.clone()),
        );
        props.insert(
            "last_turn_ts".into(),
            Value::String(self.last_turn_ts.clone()),
        );
        props.insert(
            "guardrails_mode".into(),
            Value::String(self.guardrails_mode.clone()),
        );
        props.insert("memory_mode".into(), Value::String(self.memory_mode.clone()));
        props.insert("voice_mode".into(), Value::String(self.voice_mode.clone()));
        props.insert("ops_mode".into(), Value::String(self.ops_mode.clone()));
        props
    }
}

/// Runtime signals feeding the derivation next to the layer states.
#[derive(Debug, Clone, Copy)]
pub struct DeriveSignals {
    pub ops_healthy: bool,
    pub voice_enabled: bool,
    pub active_plans: bool,
    pub graph_up: bool,
}

impl Default for DeriveSignals {
    fn default() -> Self {
        Self {
            ops_healthy: true,
            voice_enabled: false,
            active_plans: false,
            graph_up: true,
        }
    }
}

/// Derive `ConsciousnessState` from all 12 layers plus runtime signals.
pub fn derive_consciousness(
    layers: &[NeuroLayerState],
    signals: &DeriveSignals,
) -> ConsciousnessState {
    let now = denis_core::utc_now_iso();
    let by_key = |key: &str| layers.iter().find(|layer| layer.layer_key == key);

    // Mode: degraded beats focused beats awake.
    let mode = if !signals.graph_up || !signals.ops_healthy {
        "degraded"
    } else if by_key("ops_awareness")
        .map(|l| l.status == "degraded" || l.status == "error")
        .unwrap_or(false)
    {
        "degraded"
    } else if by_key("meta_consciousness")
        .map(|l| l.freshness_score < 0.2)
        .unwrap_or(false)
    {
        "degraded"
    } else if signals.active_plans {
        "focused"
    } else if by_key("attention")
        .map(|l| l.freshness_score > 0.8 && l.signals_count > 2)
        .unwrap_or(false)
    {
        "focused"
    } else {
        "awake"
    };

    // Risk: safety_governance primary, intent_goals secondary.
    let mut risk: f64 = 0.0;
    if let Some(l7) = by_key("safety_governance") {
        if l7.signals_count > 0 {
            risk = (l7.signals_count as f64 * 0.1).min(1.0);
        }
        if l7.status == "degraded" {
            risk = risk.max(0.5);
        }
    }
    if let Some(l3) = by_key("intent_goals") {
        if l3.signals_count > 3 {
            risk = (risk + l3.signals_count as f64 * 0.03).min(1.0);
        }
    }

    // Fatigue: weighted freshness mean, critical layers doubled.
    let mut weighted_sum = 0.0;
    let mut weight_total = 0.0;
    for layer in layers {
        let weight = if CRITICAL_FATIGUE_KEYS.contains(&layer.layer_key.as_str()) {
            2.0
        } else {
            1.0
        };
        weighted_sum += layer.freshness_score * weight;
        weight_total += weight;
    }
    let avg_freshness = if weight_total > 0.0 {
        weighted_sum / weight_total
    } else {
        0.5
    };
    let mut fatigue = (1.0 - avg_freshness).clamp(0.0, 1.0);
    if let Some(l11) = by_key("learning_plasticity") {
        if l11.freshness_score < 0.3 {
            fatigue = (fatigue + 0.1).min(1.0);
        }
    }

    // Confidence: self_monitoring primary, social_persona and
    // meta_consciousness erode it.
    let mut confidence: f64 = 0.7;
    if let Some(l10) = by_key("self_monitoring") {
        if l10.status == "degraded" {
            confidence = 0.4;
        } else if l10.signals_count > 5 {
            confidence = (0.7 - l10.signals_count as f64 * 0.05).max(0.3);
        }
    }
    if let Some(l9) = by_key("social_persona") {
        if l9.status == "degraded" {
            confidence = confidence.min(0.5);
        }
    }
    if let Some(l12) = by_key("meta_consciousness") {
        if l12.signals_count > 3 {
            confidence = (confidence - l12.signals_count as f64 * 0.03).max(0.2);
        }
    }

    let guardrails_mode = if risk > 0.5 || mode == "degraded" {
        "strict"
    } else {
        "normal"
    };

    let memory_mode = if by_key("memory_long")
        .map(|l| l.freshness_score > 0.7)
        .unwrap_or(false)
    {
        "long"
    } else if by_key("memory_short")
        .map(|l| l.freshness_score < 0.3)
        .unwrap_or(false)
    {
        "short"
    } else {
        "balanced"
    };

    let voice_mode = if signals.voice_enabled { "on" } else { "off" };

    let ops_mode = if by_key("ops_awareness")
        .map(|l| l.status == "degraded" || l.status == "error")
        .unwrap_or(false)
    {
        "incident"
    } else {
        "normal"
    };

    ConsciousnessState {
        mode: mode.to_string(),
        focus_topic_hash: String::new(),
        fatigue_level: round3(fatigue),
        risk_level: round3(risk),
        confidence_level: round3(confidence),
        last_wake_ts: now.clone(),
        last_turn_ts: now,
        guardrails_mode: guardrails_mode.to_string(),
        memory_mode: memory_mode.to_string(),
        voice_mode: voice_mode.to_string(),
        ops_mode: ops_mode.to_string(),
    }
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(layers: &mut [NeuroLayerState], key: &str, f: impl Fn(&mut NeuroLayerState)) {
        let layer = layers
            .iter_mut()
            .find(|l| l.layer_key == key)
            .expect("layer exists");
        f(layer);
    }

    #[test]
    fn fresh_defaults_derive_awake_normal() {
        let layers = default_layers();
        let cs = derive_consciousness(&layers, &DeriveSignals::default());
        assert_eq!(cs.mode, "awake");
        assert_eq!(cs.guardrails_mode, "normal");
        assert_eq!(cs.ops_mode, "normal");
        assert_eq!(cs.memory_mode, "balanced");
        assert_eq!(cs.voice_mode, "off");
        assert_eq!(cs.risk_level, 0.0);
        assert_eq!(cs.fatigue_level, 0.5);
        assert_eq!(cs.confidence_level, 0.7);
    }

    #[test]
    fn graph_down_means_degraded_and_strict() {
        let layers = default_layers();
        let cs = derive_consciousness(
            &layers,
            &DeriveSignals {
                graph_up: false,
                ..DeriveSignals::default()
            },
        );
        assert_eq!(cs.mode, "degraded");
        assert_eq!(cs.guardrails_mode, "strict");
    }

    #[test]
    fn degraded_ops_awareness_opens_an_incident() {
        let mut layers = default_layers();
        set(&mut layers, "ops_awareness", |l| {
            l.status = "degraded".to_string()
        });
        let cs = derive_consciousness(&layers, &DeriveSignals::default());
        assert_eq!(cs.mode, "degraded");
        assert_eq!(cs.ops_mode, "incident");
    }

    #[test]
    fn attention_with_signals_focuses() {
        let mut layers = default_layers();
        set(&mut layers, "attention", |l| {
            l.freshness_score = 0.9;
            l.signals_count = 3;
        });
        let cs = derive_consciousness(&layers, &DeriveSignals::default());
        assert_eq!(cs.mode, "focused");
    }

    #[test]
    fn active_plans_focus_without_attention() {
        let layers = default_layers();
        let cs = derive_consciousness(
            &layers,
            &DeriveSignals {
                active_plans: true,
                ..DeriveSignals::default()
            },
        );
        assert_eq!(cs.mode, "focused");
    }

    #[test]
    fn safety_signals_raise_risk_and_strictness() {
        let mut layers = default_layers();
        set(&mut layers, "safety_governance", |l| {
            l.signals_count = 4;
            l.status = "degraded".to_string();
        });
        let cs = derive_consciousness(&layers, &DeriveSignals::default());
        assert_eq!(cs.risk_level, 0.5);
        // risk == 0.5 stays "normal": strict requires risk above the threshold.
        assert_eq!(cs.guardrails_mode, "normal");

        set(&mut layers, "safety_governance", |l| l.signals_count = 7);
        let cs = derive_consciousness(&layers, &DeriveSignals::default());
        assert_eq!(cs.risk_level, 0.7);
        assert_eq!(cs.guardrails_mode, "strict");
    }

    #[test]
    fn intent_constraints_add_risk() {
        let mut layers = default_layers();
        set(&mut layers, "intent_goals", |l| l.signals_count = 5);
        let cs = derive_consciousness(&layers, &DeriveSignals::default());
        assert_eq!(cs.risk_level, 0.15);
    }

    #[test]
    fn stale_plasticity_adds_fatigue() {
        let mut layers = default_layers();
        set(&mut layers, "learning_plasticity", |l| {
            l.freshness_score = 0.2
        });
        let cs = derive_consciousness(&layers, &DeriveSignals::default());
        assert!(cs.fatigue_level > 0.5);
    }

    #[test]
    fn self_monitoring_degraded_caps_confidence() {
        let mut layers = default_layers();
        set(&mut layers, "self_monitoring", |l| {
            l.status = "degraded".to_string()
        });
        let cs = derive_consciousness(&layers, &DeriveSignals::default());
        assert_eq!(cs.confidence_level, 0.4);
    }

    #[test]
    fn meta_signals_erode_confidence() {
        let mut layers = default_layers();
        set(&mut layers, "meta_consciousness", |l| l.signals_count = 5);
        let cs = derive_consciousness(&layers, &DeriveSignals::default());
        assert_eq!(cs.confidence_level, 0.55);
    }

    #[test]
    fn memory_modes_follow_freshness() {
        let mut layers = default_layers();
        set(&mut layers, "memory_long", |l| l.freshness_score = 0.8);
        let cs = derive_consciousness(&layers, &DeriveSignals::default());
        assert_eq!(cs.memory_mode, "long");

        let mut layers = default_layers();
        set(&mut layers, "memory_short", |l| l.freshness_score = 0.2);
        let cs = derive_consciousness(&layers, &DeriveSignals::default());
        assert_eq!(cs.memory_mode, "short");
    }

    #[test]
    fn voice_mode_tracks_flag() {
        let layers = default_layers();
        let cs = derive_consciousness(
            &layers,
            &DeriveSignals {
                voice_enabled: true,
                ..DeriveSignals::default()
            },
        );
        assert_eq!(cs.voice_mode, "on");
    }

    #[test]
    fn layer_props_round_trip() {
        let layers = default_layers();
        assert_eq!(layers.len(), 12);
        for layer in &layers {
            let back = NeuroLayerState::from_props(&layer.to_props());
            assert_eq!(&back, layer);
        }
        assert_eq!(layers[0].id(), "neuro:layer:1");
        assert_eq!(layers[11].layer_key, "meta_consciousness");
    }
}
