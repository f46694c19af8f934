use denis_core::{Channel, EventV1, Severity};
use denis_graph::Materializer;
use denis_guardrails::sanitize_event_payload;
use denis_hub::EventHub;
use denis_store::{EventStore, DEFAULT_RETENTION};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::warn;

use crate::context::{current_context, persona_emit_allowed};
use crate::stats::{EmitterStats, EmitterStatsSnapshot};

#[derive(Debug, Error)]
pub enum EmitError {
    #[error("blocked non-persona event emission (use Frontdoor::persona_emit)")]
    FrontdoorBypass,
}

/// Reaction to a non-persona module emitting directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassMode {
    /// Surface the contract breach (dev/test).
    Raise,
    /// Log-safe and drop the event (prod).
    Drop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrontdoorPolicy {
    pub enforced: bool,
    pub bypass_mode: BypassMode,
}

impl FrontdoorPolicy {
    pub fn from_env() -> Self {
        let enforced = denis_core::env_flag("PERSONA_FRONTDOOR_ENFORCE", true);
        let bypass_mode = match std::env::var("PERSONA_FRONTDOOR_BYPASS_MODE")
            .unwrap_or_default()
            .trim()
            .to_lowercase()
            .as_str()
        {
            "raise" => BypassMode::Raise,
            "drop" => BypassMode::Drop,
            _ => {
                let env = std::env::var("DENIS_ENV")
                    .or_else(|_| std::env::var("ENV"))
                    .unwrap_or_default()
                    .trim()
                    .to_lowercase();
                if env == "prod" || env == "production" {
                    BypassMode::Drop
                } else {
                    // Catch bypasses early everywhere else.
                    BypassMode::Raise
                }
            }
        };
        Self {
            enforced,
            bypass_mode,
        }
    }
}

/// One emit request. `stored: false` makes the event ephemeral (hub only).
#[derive(Debug, Clone)]
pub struct EmitParams {
    pub conversation_id: Option<String>,
    pub trace_id: Option<String>,
    pub event_type: String,
    pub severity: Severity,
    pub ui_hint: Option<Value>,
    pub payload: Map<String, Value>,
    pub correlation_id: Option<String>,
    pub turn_id: Option<String>,
    pub channel: Option<Channel>,
    pub stored: bool,
}

impl EmitParams {
    pub fn new(event_type: &str) -> Self {
        Self {
            conversation_id: None,
            trace_id: None,
            event_type: event_type.to_string(),
            severity: Severity::Info,
            ui_hint: None,
            payload: Map::new(),
            correlation_id: None,
            turn_id: None,
            channel: None,
            stored: true,
        }
    }

    pub fn conversation(mut self, conversation_id: &str) -> Self {
        self.conversation_id = Some(conversation_id.to_string());
        self
    }

    pub fn trace(mut self, trace_id: Option<&str>) -> Self {
        self.trace_id = trace_id.map(str::to_string);
        self
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn ui_hint(mut self, ui_hint: Value) -> Self {
        self.ui_hint = Some(ui_hint);
        self
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload.as_object().cloned().unwrap_or_default();
        self
    }

    pub fn ephemeral(mut self) -> Self {
        self.stored = false;
        self
    }
}

/// The sole legitimate event emitter. Stamps envelopes, runs guardrails,
/// appends to the store, publishes to the hub, and hands stored events to the
/// materializer. All outbound I/O is wrapped; nothing here raises in the
/// event path.
pub struct Frontdoor {
    store: Arc<EventStore>,
    hub: Arc<EventHub>,
    materializer: Arc<Materializer>,
    policy: FrontdoorPolicy,
    retention: i64,
    stats: Mutex<EmitterStats>,
    store_failures: AtomicU64,
    frontdoor_drops: AtomicU64,
}

impl Frontdoor {
    pub fn new(store: Arc<EventStore>, hub: Arc<EventHub>, materializer: Arc<Materializer>) -> Self {
        Self::with_policy(store, hub, materializer, FrontdoorPolicy::from_env())
    }

    pub fn with_policy(
        store: Arc<EventStore>,
        hub: Arc<EventHub>,
        materializer: Arc<Materializer>,
        policy: FrontdoorPolicy,
    ) -> Self {
        Self {
            store,
            hub,
            materializer,
            policy,
            retention: DEFAULT_RETENTION,
            stats: Mutex::new(EmitterStats::default()),
            store_failures: AtomicU64::new(0),
            frontdoor_drops: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    pub fn hub(&self) -> &EventHub {
        &self.hub
    }

    pub fn materializer(&self) -> &Materializer {
        &self.materializer
    }

    pub fn stats(&self) -> EmitterStatsSnapshot {
        self.lock_stats().snapshot()
    }

    pub fn store_failures(&self) -> u64 {
        self.store_failures.load(Ordering::Relaxed)
    }

    pub fn frontdoor_drops(&self) -> u64 {
        self.frontdoor_drops.load(Ordering::Relaxed)
    }

    fn lock_stats(&self) -> MutexGuard<'_, EmitterStats> {
        self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Emit as the persona. This is the frontdoor proper: counters are kept
    /// here and the emitter policy is satisfied by construction.
    pub async fn persona_emit(&self, params: EmitParams) -> EventV1 {
        let channel = params
            .channel
            .unwrap_or_else(|| Channel::infer(&params.event_type));
        self.lock_stats()
            .record(channel.as_str(), &params.event_type, params.stored);
        self.emit_pipeline(params).await
    }

    /// Raw emit honoring the frontdoor policy. Outside a persona emitter
    /// scope this raises (`Raise`) or returns a synthetic drop event
    /// (`Drop`); emitters should normally go through [`Self::persona_emit`].
    pub async fn emit(&self, params: EmitParams) -> Result<EventV1, EmitError> {
        if self.policy.enforced && !persona_emit_allowed() {
            self.frontdoor_drops.fetch_add(1, Ordering::Relaxed);
            match self.policy.bypass_mode {
                BypassMode::Raise => return Err(EmitError::FrontdoorBypass),
                BypassMode::Drop => {
                    warn!(
                        event = "persona_frontdoor_drop",
                        r#type = %params.event_type,
                        conversation_id = %params.conversation_id.as_deref().unwrap_or("default")
                    );
                    return Ok(self.frontdoor_drop_event(&params));
                }
            }
        }
        Ok(self.emit_pipeline(params).await)
    }

    fn frontdoor_drop_event(&self, params: &EmitParams) -> EventV1 {
        let trace = params
            .trace_id
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string);
        let correlation_id = trace.clone().unwrap_or_else(denis_core::new_id);
        let turn_id = trace.clone().unwrap_or_else(denis_core::new_id);

        let mut payload = Map::new();
        payload.insert(
            "code".to_string(),
            Value::String("persona_frontdoor_drop".into()),
        );
        payload.insert(
            "msg".to_string(),
            Value::String("Blocked non-persona event emission".into()),
        );

        let mut event = EventV1::synthetic_error(
            &denis_core::event::normalize_conversation_id(params.conversation_id.as_deref()),
            &correlation_id,
            &turn_id,
            params.trace_id.clone(),
            payload,
        );
        event.channel = Channel::infer(&params.event_type);
        event
    }

    async fn emit_pipeline(&self, params: EmitParams) -> EventV1 {
        let (event, violations) = self.emit_core(params).await;

        // Guardrail violations surface as an ops.metric (non-recursive).
        if violations > 0 && event.r#type != "ops.metric" {
            let metric = EmitParams {
                conversation_id: Some(event.conversation_id.clone()),
                trace_id: event.trace_id.clone(),
                event_type: "ops.metric".to_string(),
                severity: Severity::Warning,
                ui_hint: Some(serde_json::json!({
                    "render": "metric", "icon": "gauge", "collapsible": true
                })),
                payload: serde_json::json!({
                    "name": "guardrails.violation",
                    "value": violations,
                    "unit": "count",
                    "labels": {"event_type": event.r#type},
                })
                .as_object()
                .cloned()
                .unwrap_or_default(),
                correlation_id: Some(event.correlation_id.clone()),
                turn_id: Some(event.turn_id.clone()),
                channel: Some(Channel::Ops),
                stored: true,
            };
            let _ = self.emit_core(metric).await;
        }

        event
    }

    async fn emit_core(&self, params: EmitParams) -> (EventV1, u32) {
        let ctx = current_context();
        let trace_id = params
            .trace_id
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .or_else(|| ctx.as_ref().and_then(|c| c.trace_id.clone()));

        let conversation_id = params
            .conversation_id
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .or_else(|| ctx.as_ref().map(|c| c.conversation_id.clone()))
            .unwrap_or_else(|| denis_core::DEFAULT_CONVERSATION_ID.to_string());

        // Precedence: explicit call value, then turn context, then trace,
        // then a fresh id.
        let correlation_id = params
            .correlation_id
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .or_else(|| {
                ctx.as_ref()
                    .map(|c| c.correlation_id.clone())
                    .filter(|c| !c.is_empty())
            })
            .or_else(|| trace_id.clone())
            .unwrap_or_else(denis_core::new_id);
        let turn_id = params
            .turn_id
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .or_else(|| {
                ctx.as_ref()
                    .map(|c| c.turn_id.clone())
                    .filter(|t| !t.is_empty())
            })
            .or_else(|| trace_id.clone())
            .unwrap_or_else(denis_core::new_id);

        let channel = params
            .channel
            .unwrap_or_else(|| Channel::infer(&params.event_type));

        let sanitized = sanitize_event_payload(&params.payload);
        let violations = sanitized.violations;

        let mut event = EventV1 {
            event_id: 0,
            ts: denis_core::utc_now_iso(),
            conversation_id: conversation_id.clone(),
            emitter: denis_core::EMITTER_PERSONA.to_string(),
            correlation_id,
            turn_id,
            trace_id,
            channel,
            stored: params.stored,
            r#type: params.event_type.clone(),
            severity: params.severity,
            schema_version: denis_core::SCHEMA_VERSION.to_string(),
            ui_hint: params
                .ui_hint
                .unwrap_or_else(denis_core::event::default_ui_hint),
            payload: sanitized.payload,
        };

        if event.stored {
            match self.store.append(&conversation_id, &event, self.retention) {
                Ok(stored_event) => event = stored_event,
                Err(err) => {
                    // Degrade to publish-only; subscribers still see it live.
                    warn!(event = "event_store_append_failed", error = %err);
                    self.store_failures.fetch_add(1, Ordering::Relaxed);
                    event.stored = false;
                }
            }
        }

        self.hub.publish(&conversation_id, &event);

        if event.stored {
            self.materializer.maybe_materialize(&event).await;
        }

        (event, violations)
    }
}
