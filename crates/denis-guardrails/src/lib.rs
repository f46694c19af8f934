//! Payload and graph-property guardrails.
//!
//! Two pure sanitizers with fail-open behavior: denied keys are dropped,
//! secret-shaped substrings are redacted, strings and lists are capped.
//! Event payloads keep their nested shape; graph properties are flattened to
//! scalars or JSON strings before they ever reach the graph.

use serde_json::{Map, Value};
use std::sync::OnceLock;

mod policy;
mod redact;

pub use policy::{EventPolicy, GraphPolicy, DENY_KEYS_DEFAULT};
pub use redact::redact_str;

/// Outcome of sanitizing one event payload.
#[derive(Debug, Clone, PartialEq)]
pub struct PayloadSanitizeResult {
    pub payload: Map<String, Value>,
    pub violations: u32,
    pub dropped_keys: Vec<String>,
    pub truncated: u32,
}

/// Outcome of sanitizing one graph property dict.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphPropsResult {
    pub props: Map<String, Value>,
    pub violations: u32,
    pub dropped_keys: Vec<String>,
    pub truncated: u32,
}

#[derive(Debug, Default)]
struct SanitizeStats {
    violations: u32,
    dropped_keys: Vec<String>,
    truncated: u32,
    truncations: Vec<Value>,
    list_caps: Vec<Value>,
}

/// Sanitize an event payload with the env-derived policy.
pub fn sanitize_event_payload(payload: &Map<String, Value>) -> PayloadSanitizeResult {
    sanitize_event_payload_with(&EventPolicy::from_env(), payload)
}

pub fn sanitize_event_payload_with(
    policy: &EventPolicy,
    payload: &Map<String, Value>,
) -> PayloadSanitizeResult {
    if !policy.enabled {
        return PayloadSanitizeResult {
            payload: payload.clone(),
            violations: 0,
            dropped_keys: Vec::new(),
            truncated: 0,
        };
    }

    let mut stats = SanitizeStats::default();
    let mut out = sanitize_map(policy, payload, "", &mut stats);

    if stats.violations > 0 {
        let summary = serde_json::json!({
            "violations": stats.violations,
            "dropped_keys": stats.dropped_keys.iter().take(50).collect::<Vec<_>>(),
            "truncated": stats.truncated,
            "truncations": stats.truncations.iter().take(20).collect::<Vec<_>>(),
            "list_caps": stats.list_caps.iter().take(20).collect::<Vec<_>>(),
        });
        out.insert("_guardrails".to_string(), summary);
    }

    PayloadSanitizeResult {
        payload: out,
        violations: stats.violations,
        dropped_keys: stats.dropped_keys,
        truncated: stats.truncated,
    }
}

fn sanitize_map(
    policy: &EventPolicy,
    map: &Map<String, Value>,
    path: &str,
    stats: &mut SanitizeStats,
) -> Map<String, Value> {
    let mut out = Map::new();
    for (key, value) in map {
        let child_path = if path.is_empty() {
            key.clone()
        } else {
            format!("{path}.{key}")
        };
        if policy.is_denied_key(key) {
            stats.violations += 1;
            stats.dropped_keys.push(child_path);
            continue;
        }
        out.insert(key.clone(), sanitize_value(policy, value, &child_path, stats));
    }
    out
}

fn sanitize_value(
    policy: &EventPolicy,
    value: &Value,
    path: &str,
    stats: &mut SanitizeStats,
) -> Value {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) => value.clone(),
        Value::String(s) => Value::String(sanitize_string(policy, s, path, stats)),
        Value::Object(map) => Value::Object(sanitize_map(policy, map, path, stats)),
        Value::Array(items) => {
            let mut items: &[Value] = items;
            if items.len() > policy.max_list_len {
                stats.violations += 1;
                stats.truncated += 1;
                stats.list_caps.push(serde_json::json!({
                    "path": path,
                    "orig_len": items.len(),
                    "cap": policy.max_list_len,
                }));
                items = &items[..policy.max_list_len];
            }
            let child_path = format!("{path}[]");
            Value::Array(
                items
                    .iter()
                    .map(|item| sanitize_value(policy, item, &child_path, stats))
                    .collect(),
            )
        }
    }
}

fn sanitize_string(
    policy: &EventPolicy,
    raw: &str,
    path: &str,
    stats: &mut SanitizeStats,
) -> String {
    let redacted = redact_str(raw);
    let chars = redacted.chars().count();
    if chars <= policy.max_str_len {
        return redacted;
    }
    stats.truncated += 1;
    stats.violations += 1;
    stats.truncations.push(serde_json::json!({
        "path": path,
        "orig_len": chars,
        "sha256": denis_core::sha256_hex(&redacted),
    }));
    truncate_with_ellipsis(&redacted, policy.max_str_len)
}

/// Cap to `max_len` chars, the last one being an ellipsis marker.
fn truncate_with_ellipsis(s: &str, max_len: usize) -> String {
    let mut out: String = s.chars().take(max_len.saturating_sub(1)).collect();
    out.push('\u{2026}');
    out
}

/// Sanitize graph node properties with the env-derived policy.
pub fn sanitize_graph_props(props: &Map<String, Value>) -> GraphPropsResult {
    sanitize_graph_props_with(&GraphPolicy::from_env(), props)
}

pub fn sanitize_graph_props_with(
    policy: &GraphPolicy,
    props: &Map<String, Value>,
) -> GraphPropsResult {
    if !policy.enabled {
        return GraphPropsResult {
            props: props.clone(),
            violations: 0,
            dropped_keys: Vec::new(),
            truncated: 0,
        };
    }

    let mut out = Map::new();
    let mut violations: u32 = 0;
    let mut dropped: Vec<String> = Vec::new();
    let mut truncated: u32 = 0;

    for (key, value) in props {
        if policy.is_denied_key(key) {
            violations += 1;
            dropped.push(key.clone());
            continue;
        }

        match value {
            Value::Null | Value::Bool(_) | Value::Number(_) => {
                out.insert(key.clone(), value.clone());
            }
            Value::String(s) => {
                let redacted = redact_str(s);
                let chars = redacted.chars().count();
                if chars > policy.max_str_len {
                    violations += 1;
                    truncated += 1;
                    out.insert(
                        format!("{key}__sha256"),
                        Value::String(denis_core::sha256_hex(&redacted)),
                    );
                    out.insert(
                        format!("{key}__orig_len"),
                        Value::from(s.chars().count()),
                    );
                    out.insert(
                        key.clone(),
                        Value::String(truncate_with_ellipsis(&redacted, policy.max_str_len)),
                    );
                } else {
                    out.insert(key.clone(), Value::String(redacted));
                }
            }
            Value::Array(items) => {
                let mut capped = items.clone();
                if capped.len() > policy.max_list_len {
                    violations += 1;
                    truncated += 1;
                    capped.truncate(policy.max_list_len);
                }
                let (stored, extra_violation) =
                    stringify_aggregate(policy, &Value::Array(capped), key, &mut out);
                if extra_violation {
                    violations += 1;
                    truncated += 1;
                }
                out.insert(key.clone(), Value::String(stored));
            }
            Value::Object(_) => {
                let (stored, extra_violation) = stringify_aggregate(policy, value, key, &mut out);
                if extra_violation {
                    violations += 1;
                    truncated += 1;
                }
                out.insert(key.clone(), Value::String(stored));
            }
        }
    }

    if violations > 0 {
        out.insert("_guardrails_violations".to_string(), Value::from(violations));
        out.insert("_guardrails_truncated".to_string(), Value::from(truncated));
        out.insert(
            "_guardrails_dropped_keys".to_string(),
            Value::String(
                dropped
                    .iter()
                    .take(20)
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(","),
            ),
        );
    }

    GraphPropsResult {
        props: out,
        violations,
        dropped_keys: dropped,
        truncated,
    }
}

/// JSON-stringify an aggregate value, redact, and cap. Returns the stored
/// string and whether the cap produced companion `__sha256`/`__orig_len`
/// keys (an extra violation).
fn stringify_aggregate(
    policy: &GraphPolicy,
    value: &Value,
    key: &str,
    out: &mut Map<String, Value>,
) -> (String, bool) {
    let serialized = serde_json::to_string(value).unwrap_or_else(|_| value.to_string());
    let redacted = redact_str(&serialized);
    let chars = redacted.chars().count();
    if chars > policy.max_str_len {
        out.insert(
            format!("{key}__sha256"),
            Value::String(denis_core::sha256_hex(&redacted)),
        );
        out.insert(format!("{key}__orig_len"), Value::from(chars));
        return (truncate_with_ellipsis(&redacted, policy.max_str_len), true);
    }
    (redacted, false)
}

pub(crate) fn allow_keys() -> &'static [&'static str] {
    static ALLOW: OnceLock<Vec<&'static str>> = OnceLock::new();
    ALLOW
        .get_or_init(|| {
            vec![
                "content_sha256",
                "content_len",
                "query_sha256",
                "query_len",
                "prompt_sha256",
                "prompt_len",
                "args_sha256",
                "args_len",
                "result_sha256",
                "result_len",
                "hash_sha256",
                "after_hash",
                "idempotency_key",
                "chunk_id",
                "counts_json",
            ]
        })
        .as_slice()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_policy() -> EventPolicy {
        EventPolicy {
            enabled: true,
            max_str_len: 2000,
            max_list_len: 50,
            deny_keys: DENY_KEYS_DEFAULT.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn graph_policy() -> GraphPolicy {
        GraphPolicy {
            enabled: true,
            max_str_len: 512,
            max_list_len: 50,
            deny_keys: DENY_KEYS_DEFAULT.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn payload(raw: Value) -> Map<String, Value> {
        raw.as_object().expect("object payload").clone()
    }

    #[test]
    fn denied_keys_are_dropped_and_summarized() {
        let input = payload(serde_json::json!({
            "authorization": "Bearer X",
            "token": "sk-1",
            "content": "secret",
            "ok": true,
            "content_sha256": "0".repeat(64),
            "content_len": 6,
        }));
        let result = sanitize_event_payload_with(&event_policy(), &input);

        assert!(result.violations >= 3);
        assert!(result.dropped_keys.contains(&"authorization".to_string()));
        assert!(result.dropped_keys.contains(&"token".to_string()));
        assert!(result.dropped_keys.contains(&"content".to_string()));

        let safe = &result.payload;
        assert_eq!(safe["ok"], Value::Bool(true));
        assert_eq!(safe["content_sha256"], Value::String("0".repeat(64)));
        assert_eq!(safe["content_len"], Value::from(6));
        assert!(!safe.contains_key("authorization"));
        assert!(!safe.contains_key("token"));
        assert!(!safe.contains_key("content"));
        let summary = safe["_guardrails"].as_object().expect("summary");
        assert!(summary["violations"].as_u64().expect("count") >= 3);
    }

    #[test]
    fn allowlisted_suffixes_survive_deny_substrings() {
        let input = payload(serde_json::json!({
            "prompt_sha256": "a".repeat(64),
            "prompt_len": 12,
            "session_len": 3,
            "api_key_sha256": "b".repeat(64),
        }));
        let result = sanitize_event_payload_with(&event_policy(), &input);
        assert_eq!(result.violations, 0);
        assert_eq!(result.payload.len(), 4);
    }

    #[test]
    fn bearer_and_jwt_shapes_are_redacted_in_values() {
        let input = payload(serde_json::json!({
            "note": "auth was Bearer abc.DEF-123 yesterday",
            "detail": "jwt eyJabc.eyJdef.sig-part here",
            "key_material": "sk-proj-abcdef1234567890",
        }));
        let result = sanitize_event_payload_with(&event_policy(), &input);
        let note = result.payload["note"].as_str().expect("note");
        assert!(note.contains("Bearer ***"));
        assert!(!note.contains("abc.DEF-123"));
        let detail = result.payload["detail"].as_str().expect("detail");
        assert!(detail.contains("***JWT***"));
        let key = result.payload["key_material"].as_str().expect("key");
        assert!(!key.contains("sk-proj"));
    }

    #[test]
    fn long_strings_are_capped_with_truncation_record() {
        let policy = EventPolicy {
            max_str_len: 10,
            ..event_policy()
        };
        let input = payload(serde_json::json!({"summary_hashable": "x".repeat(40)}));
        let result = sanitize_event_payload_with(&policy, &input);
        assert_eq!(result.truncated, 1);
        let s = result.payload["summary_hashable"].as_str().expect("str");
        assert_eq!(s.chars().count(), 10);
        assert!(s.ends_with('\u{2026}'));
    }

    #[test]
    fn lists_are_capped() {
        let policy = EventPolicy {
            max_list_len: 3,
            ..event_policy()
        };
        let input = payload(serde_json::json!({"items": [1, 2, 3, 4, 5]}));
        let result = sanitize_event_payload_with(&policy, &input);
        assert_eq!(result.payload["items"].as_array().expect("arr").len(), 3);
        assert_eq!(result.violations, 1);
    }

    #[test]
    fn sanitizer_is_a_fixed_point() {
        let policy = event_policy();
        let input = payload(serde_json::json!({
            "authorization": "Bearer abcdef",
            "ok": true,
            "nested": {"cookie_jar": "gone", "kept": "v"},
            "list": ["Bearer abc123", 2],
        }));
        let once = sanitize_event_payload_with(&policy, &input);
        let twice = sanitize_event_payload_with(&policy, &once.payload);
        assert_eq!(twice.violations, 0);
        assert_eq!(once.payload, twice.payload);
    }

    #[test]
    fn disabled_policy_passes_through() {
        let policy = EventPolicy {
            enabled: false,
            ..event_policy()
        };
        let input = payload(serde_json::json!({"token": "sk-1"}));
        let result = sanitize_event_payload_with(&policy, &input);
        assert_eq!(result.violations, 0);
        assert_eq!(result.payload, input);
    }

    #[test]
    fn graph_props_only_hold_scalars_or_json_strings() {
        let result = sanitize_graph_props_with(
            &graph_policy(),
            &payload(serde_json::json!({
                "status": "ok",
                "order": 2,
                "ratio": 0.5,
                "flag": false,
                "nothing": null,
                "tags": ["a", "b"],
                "counts": {"selected": 3},
            })),
        );
        assert_eq!(result.violations, 0);
        for (key, value) in &result.props {
            match value {
                Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {}
                other => panic!("non-scalar prop {key}: {other:?}"),
            }
        }
        assert_eq!(result.props["tags"], Value::String("[\"a\",\"b\"]".into()));
        assert_eq!(
            result.props["counts"],
            Value::String("{\"selected\":3}".into())
        );
    }

    #[test]
    fn graph_long_string_gains_hash_companions() {
        let policy = GraphPolicy {
            max_str_len: 16,
            ..graph_policy()
        };
        let result = sanitize_graph_props_with(
            &policy,
            &payload(serde_json::json!({"reason_safe": "y".repeat(50)})),
        );
        assert_eq!(result.truncated, 1);
        assert_eq!(
            result.props["reason_safe__orig_len"],
            Value::from(50)
        );
        assert_eq!(
            result.props["reason_safe__sha256"]
                .as_str()
                .expect("sha")
                .len(),
            64
        );
        assert_eq!(
            result.props["reason_safe"]
                .as_str()
                .expect("capped")
                .chars()
                .count(),
            16
        );
        assert_eq!(result.props["_guardrails_violations"], Value::from(1));
    }

    #[test]
    fn graph_denied_keys_recorded_in_marker() {
        let result = sanitize_graph_props_with(
            &graph_policy(),
            &payload(serde_json::json!({"session_token": "abc", "status": "ok"})),
        );
        assert_eq!(result.violations, 1);
        assert_eq!(
            result.props["_guardrails_dropped_keys"],
            Value::String("session_token".into())
        );
        assert!(!result.props.contains_key("session_token"));
    }
}
