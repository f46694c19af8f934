use denis_core::{env_flag, env_usize};

use crate::allow_keys;

/// Keys containing any of these substrings (case-insensitive) are dropped
/// unless allow-listed or carrying a safe `_sha256`/`_len` suffix.
pub const DENY_KEYS_DEFAULT: &[&str] = &[
    "prompt",
    "html",
    "snippet",
    "content",
    "cookie",
    "authorization",
    "token",
    "api_key",
    "secret",
    "session",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventPolicy {
    pub enabled: bool,
    pub max_str_len: usize,
    pub max_list_len: usize,
    pub deny_keys: Vec<String>,
}

impl EventPolicy {
    pub fn from_env() -> Self {
        Self {
            enabled: env_flag("GUARDRAILS_ENABLED", true),
            max_str_len: env_usize("MAX_STR_LEN_EVENT", 2000),
            max_list_len: env_usize("MAX_LIST_LEN_EVENT", 50),
            deny_keys: deny_keys_from("DENY_KEYS_EVENT"),
        }
    }

    pub fn is_denied_key(&self, key: &str) -> bool {
        is_denied(&self.deny_keys, key)
    }
}

impl Default for EventPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_str_len: 2000,
            max_list_len: 50,
            deny_keys: default_deny_keys(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphPolicy {
    pub enabled: bool,
    pub max_str_len: usize,
    pub max_list_len: usize,
    pub deny_keys: Vec<String>,
}

impl GraphPolicy {
    pub fn from_env() -> Self {
        Self {
            enabled: env_flag("GUARDRAILS_ENABLED", true),
            max_str_len: env_usize("MAX_STR_LEN_GRAPH", 512),
            max_list_len: env_usize("MAX_LIST_LEN_GRAPH", 50),
            deny_keys: deny_keys_from("DENY_KEYS_GRAPH"),
        }
    }

    pub fn is_denied_key(&self, key: &str) -> bool {
        is_denied(&self.deny_keys, key)
    }
}

impl Default for GraphPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_str_len: 512,
            max_list_len: 50,
            deny_keys: default_deny_keys(),
        }
    }
}

fn default_deny_keys() -> Vec<String> {
    DENY_KEYS_DEFAULT.iter().map(|s| s.to_string()).collect()
}

fn deny_keys_from(env_name: &str) -> Vec<String> {
    if let Ok(raw) = std::env::var(env_name) {
        let parts: Vec<String> = raw
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect();
        if !parts.is_empty() {
            return parts;
        }
    }
    default_deny_keys()
}

fn is_denied(deny_keys: &[String], key: &str) -> bool {
    let k = key.to_lowercase();
    if allow_keys().contains(&k.as_str()) {
        return false;
    }
    if k.ends_with("_sha256") || k.ends_with("_len") {
        return false;
    }
    deny_keys
        .iter()
        .any(|deny| k.contains(&deny.to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_list_beats_deny_substrings() {
        let policy = EventPolicy::default();
        assert!(!policy.is_denied_key("content_sha256"));
        assert!(!policy.is_denied_key("counts_json"));
        assert!(!policy.is_denied_key("idempotency_key"));
        assert!(!policy.is_denied_key("Query_Len"));
        assert!(policy.is_denied_key("content"));
        assert!(policy.is_denied_key("Authorization"));
        assert!(policy.is_denied_key("my_api_key_v2"));
    }

    #[test]
    fn safe_suffixes_pass() {
        let policy = GraphPolicy::default();
        assert!(!policy.is_denied_key("anything_sha256"));
        assert!(!policy.is_denied_key("session_len"));
        assert!(policy.is_denied_key("session_id"));
    }
}
