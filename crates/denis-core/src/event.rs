use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::{DEFAULT_CONVERSATION_ID, EMITTER_PERSONA, SCHEMA_VERSION};

/// `event_v1` envelope. `event_id` stays 0 until the store assigns one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventV1 {
    #[serde(default)]
    pub event_id: i64,
    pub ts: String,
    pub conversation_id: String,
    pub emitter: String,
    pub correlation_id: String,
    pub turn_id: String,
    #[serde(default)]
    pub trace_id: Option<String>,
    pub channel: Channel,
    pub stored: bool,
    #[serde(rename = "type")]
    pub r#type: String,
    pub severity: Severity,
    pub schema_version: String,
    #[serde(default = "default_ui_hint")]
    pub ui_hint: Value,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl EventV1 {
    /// Synthetic hub/frontdoor error event (ephemeral, never persisted).
    pub fn synthetic_error(
        conversation_id: &str,
        correlation_id: &str,
        turn_id: &str,
        trace_id: Option<String>,
        payload: Map<String, Value>,
    ) -> Self {
        Self {
            event_id: 0,
            ts: crate::utc_now_iso(),
            conversation_id: conversation_id.to_string(),
            emitter: EMITTER_PERSONA.to_string(),
            correlation_id: correlation_id.to_string(),
            turn_id: turn_id.to_string(),
            trace_id,
            channel: Channel::Ops,
            stored: false,
            r#type: "error".to_string(),
            severity: Severity::Warning,
            schema_version: SCHEMA_VERSION.to_string(),
            ui_hint: error_ui_hint(),
            payload,
        }
    }
}

pub fn default_ui_hint() -> Value {
    serde_json::json!({"render": "event", "icon": "dot", "collapsible": true})
}

pub fn error_ui_hint() -> Value {
    serde_json::json!({"render": "error", "icon": "alert", "collapsible": true})
}

pub fn normalize_conversation_id(raw: Option<&str>) -> String {
    match raw.map(str::trim) {
        Some(value) if !value.is_empty() => value.to_string(),
        _ => DEFAULT_CONVERSATION_ID.to_string(),
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Default for Severity {
    fn default() -> Self {
        Self::Info
    }
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "warning" | "warn" => Ok(Severity::Warning),
            "error" => Ok(Severity::Error),
            other => Err(format!("Unknown severity: {other}")),
        }
    }
}

/// Coarse routing tag used by UIs and filters; inferred from the event type
/// when the emitter does not pick one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Text,
    Voice,
    ControlRoom,
    Rag,
    Tool,
    Scrape,
    Ops,
    Compiler,
    Neuro,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Text => "text",
            Channel::Voice => "voice",
            Channel::ControlRoom => "control_room",
            Channel::Rag => "rag",
            Channel::Tool => "tool",
            Channel::Scrape => "scrape",
            Channel::Ops => "ops",
            Channel::Compiler => "compiler",
            Channel::Neuro => "neuro",
        }
    }

    pub fn infer(event_type: &str) -> Channel {
        let t = event_type.trim();
        if t.starts_with("compiler.") || t.starts_with("retrieval.") {
            return Channel::Compiler;
        }
        if t.starts_with("voice.") {
            return Channel::Voice;
        }
        if t.starts_with("control_room.") {
            return Channel::ControlRoom;
        }
        if t.starts_with("rag.") {
            return Channel::Rag;
        }
        if t.starts_with("tool.") {
            return Channel::Tool;
        }
        if t.starts_with("scrape.") || t.starts_with("scraping.") {
            return Channel::Scrape;
        }
        if t.starts_with("neuro.") || t.starts_with("persona.") {
            return Channel::Neuro;
        }
        if t == "chat.message" || t.starts_with("plan.") {
            return Channel::Text;
        }
        Channel::Ops
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "text" => Ok(Channel::Text),
            "voice" => Ok(Channel::Voice),
            "control_room" => Ok(Channel::ControlRoom),
            "rag" => Ok(Channel::Rag),
            "tool" => Ok(Channel::Tool),
            "scrape" => Ok(Channel::Scrape),
            "ops" => Ok(Channel::Ops),
            "compiler" => Ok(Channel::Compiler),
            "neuro" => Ok(Channel::Neuro),
            other => Err(format!("Unknown channel: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_inference_covers_prefixes() {
        assert_eq!(Channel::infer("compiler.result"), Channel::Compiler);
        assert_eq!(Channel::infer("retrieval.start"), Channel::Compiler);
        assert_eq!(Channel::infer("voice.asr.final"), Channel::Voice);
        assert_eq!(Channel::infer("control_room.task.created"), Channel::ControlRoom);
        assert_eq!(Channel::infer("rag.search.start"), Channel::Rag);
        assert_eq!(Channel::infer("tool.result"), Channel::Tool);
        assert_eq!(Channel::infer("scraping.page"), Channel::Scrape);
        assert_eq!(Channel::infer("scrape.page"), Channel::Scrape);
        assert_eq!(Channel::infer("neuro.wake.start"), Channel::Neuro);
        assert_eq!(Channel::infer("persona.state.update"), Channel::Neuro);
        assert_eq!(Channel::infer("chat.message"), Channel::Text);
        assert_eq!(Channel::infer("plan.created"), Channel::Text);
        assert_eq!(Channel::infer("agent.reasoning.summary"), Channel::Ops);
        assert_eq!(Channel::infer("error"), Channel::Ops);
        assert_eq!(Channel::infer("graph.mutation"), Channel::Ops);
        assert_eq!(Channel::infer("indexing.upsert"), Channel::Ops);
        assert_eq!(Channel::infer("run.step"), Channel::Ops);
        assert_eq!(Channel::infer("something.unknown"), Channel::Ops);
    }

    #[test]
    fn envelope_serializes_type_field_name() {
        let ev = EventV1::synthetic_error("conv", "corr", "turn", None, Map::new());
        let value = serde_json::to_value(&ev).expect("serialize");
        assert_eq!(value["type"], "error");
        assert_eq!(value["channel"], "ops");
        assert_eq!(value["severity"], "warning");
        assert_eq!(value["emitter"], "denis_persona");
        assert_eq!(value["event_id"], 0);

        let back: EventV1 = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back, ev);
    }

    #[test]
    fn normalize_conversation_id_defaults() {
        assert_eq!(normalize_conversation_id(None), "default");
        assert_eq!(normalize_conversation_id(Some("  ")), "default");
        assert_eq!(normalize_conversation_id(Some("conv2")), "conv2");
    }
}
