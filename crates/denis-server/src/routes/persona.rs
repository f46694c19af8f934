use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use denis_core::Severity;
use denis_persona::{with_persona_context, EmitParams, PersonaContext};

use crate::runtime::run_chat_turn;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct PersonaChatRequest {
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default = "default_model")]
    pub model: String,
}

#[derive(Debug, Deserialize)]
pub struct PersonaVoiceRequest {
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub voice_session_id: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_tts_enabled")]
    pub tts_enabled: bool,
    #[serde(default)]
    pub tts_voice: Option<String>,
}

fn default_model() -> String {
    "denis-cognitive".to_string()
}

fn default_language() -> String {
    "es".to_string()
}

fn default_tts_enabled() -> bool {
    true
}

/// Minimal persona chat entry point (non-streaming). Emits hashed
/// `chat.message` events and returns the assistant text.
pub async fn persona_chat(
    State(state): State<AppState>,
    Json(request): Json<PersonaChatRequest>,
) -> Json<Value> {
    let conversation_id =
        denis_core::event::normalize_conversation_id(request.conversation_id.as_deref());
    let user_text = request.text.trim().to_string();

    if user_text.is_empty() {
        return Json(json!({
            "ts": denis_core::utc_now_iso(),
            "conversation_id": conversation_id,
            "trace_id": request.trace_id,
            "assistant_text": "",
            "degraded": true,
            "warning": {"code": "empty_text", "msg": "text is required"},
        }));
    }

    let outcome = run_chat_turn(
        &state,
        &conversation_id,
        request.trace_id.as_deref(),
        &user_text,
        &request.model,
        &[],
    )
    .await;

    Json(json!({
        "ts": denis_core::utc_now_iso(),
        "conversation_id": conversation_id,
        "trace_id": request.trace_id,
        "assistant_text": outcome.assistant_text,
        "openai": outcome.completion,
    }))
}

/// Voice through the persona: transcript in, `voice.*` events around a
/// regular chat turn, deterministic TTS stub out. Real ASR/TTS engines are
/// external collaborators.
pub async fn persona_voice(
    State(state): State<AppState>,
    Json(request): Json<PersonaVoiceRequest>,
) -> Json<Value> {
    let conversation_id =
        denis_core::event::normalize_conversation_id(request.conversation_id.as_deref());
    let trace_id = request.trace_id.clone();
    let session_id = request
        .voice_session_id
        .clone()
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| format!("vs_{}", &denis_core::new_id()[..12]));
    state.telemetry.record_voice();

    let ctx = PersonaContext::for_request(Some(&conversation_id), trace_id.as_deref(), None, None);
    let frontdoor = state.frontdoor.clone();
    let conv = conversation_id.clone();
    let session = session_id.clone();
    let language = request.language.clone();

    with_persona_context(ctx, async move {
        frontdoor
            .persona_emit(
                EmitParams::new("voice.session.started")
                    .conversation(&conv)
                    .payload(json!({
                        "voice_session_id": session,
                        "status": "active",
                        "language": language,
                    })),
            )
            .await;
    })
    .await;

    let transcript = request
        .text
        .as_deref()
        .map(str::trim)
        .unwrap_or_default()
        .to_string();
    if transcript.is_empty() {
        let ctx =
            PersonaContext::for_request(Some(&conversation_id), trace_id.as_deref(), None, None);
        let frontdoor = state.frontdoor.clone();
        let conv = conversation_id.clone();
        let session = session_id.clone();
        with_persona_context(ctx, async move {
            frontdoor
                .persona_emit(
                    EmitParams::new("voice.error")
                        .conversation(&conv)
                        .severity(Severity::Warning)
                        .payload(json!({
                            "voice_session_id": session,
                            "code": "asr_empty",
                            "msg": "no transcript text provided",
                        })),
                )
                .await;
        })
        .await;

        return Json(json!({
            "ts": denis_core::utc_now_iso(),
            "conversation_id": conversation_id,
            "trace_id": trace_id,
            "voice_session_id": session_id,
            "assistant_text": "",
            "degraded": true,
            "warning": {"code": "asr_empty", "msg": "text is required for the webspeech stub"},
        }));
    }

    let ctx = PersonaContext::for_request(Some(&conversation_id), trace_id.as_deref(), None, None);
    let frontdoor = state.frontdoor.clone();
    let conv = conversation_id.clone();
    let session = session_id.clone();
    let transcript_for_events = transcript.clone();
    let language = request.language.clone();
    with_persona_context(ctx, async move {
        frontdoor
            .persona_emit(
                EmitParams::new("voice.asr.final")
                    .conversation(&conv)
                    .payload(json!({
                        "voice_session_id": session,
                        "transcript_sha256": denis_core::sha256_hex(&transcript_for_events),
                        "transcript_len": transcript_for_events.chars().count(),
                        "language": language,
                    })),
            )
            .await;
    })
    .await;

    let outcome = run_chat_turn(
        &state,
        &conversation_id,
        trace_id.as_deref(),
        &transcript,
        "denis-cognitive",
        &[],
    )
    .await;

    if request.tts_enabled {
        let ctx =
            PersonaContext::for_request(Some(&conversation_id), trace_id.as_deref(), None, None);
        let frontdoor = state.frontdoor.clone();
        let conv = conversation_id.clone();
        let session = session_id.clone();
        let voice = request.tts_voice.clone();
        let answer_sha = denis_core::sha256_hex(&outcome.assistant_text);
        let answer_len = outcome.assistant_text.chars().count();
        with_persona_context(ctx, async move {
            frontdoor
                .persona_emit(
                    EmitParams::new("voice.tts.requested")
                        .conversation(&conv)
                        .payload(json!({
                            "voice_session_id": session,
                            "text_sha256": answer_sha,
                            "text_len": answer_len,
                            "voice": voice,
                        })),
                )
                .await;
            frontdoor
                .persona_emit(
                    EmitParams::new("voice.tts.audio.ready")
                        .conversation(&conv)
                        .payload(json!({
                            "voice_session_id": session,
                            "provider": "deterministic",
                            "bytes_len": 0,
                        })),
                )
                .await;
            frontdoor
                .persona_emit(
                    EmitParams::new("voice.tts.done")
                        .conversation(&conv)
                        .payload(json!({"voice_session_id": session})),
                )
                .await;
        })
        .await;
    }

    Json(json!({
        "ts": denis_core::utc_now_iso(),
        "conversation_id": conversation_id,
        "trace_id": trace_id,
        "voice_session_id": session_id,
        "assistant_text": outcome.assistant_text,
        "tts": {
            "enabled": request.tts_enabled,
            "provider": "deterministic",
        },
    }))
}
