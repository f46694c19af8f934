/// Closed set of `event_v1` types the materializer understands.
///
/// Anything outside this list still flows through the bus but only refreshes
/// the `ws_event_bus` component in the graph.
pub const SUPPORTED_EVENT_TYPES: &[&str] = &[
    "chat.message",
    "run.step",
    "error",
    "indexing.upsert",
    "ops.metric",
    "agent.decision_trace_summary",
    "agent.reasoning.summary",
    "rag.search.start",
    "rag.search.result",
    "rag.context.compiled",
    "scraping.page",
    "scraping.done",
    "compiler.start",
    "compiler.result",
    "compiler.error",
    "compiler.fallback_start",
    "compiler.fallback_result",
    "retrieval.start",
    "retrieval.result",
    "voice.session.started",
    "voice.asr.partial",
    "voice.asr.final",
    "voice.tts.requested",
    "voice.tts.audio.ready",
    "voice.tts.done",
    "voice.error",
    "control_room.task.created",
    "control_room.task.updated",
    "control_room.run.spawned",
    "control_room.approval.requested",
    "control_room.approval.resolved",
    "control_room.action.updated",
    "neuro.wake.start",
    "neuro.layer.snapshot",
    "neuro.consciousness.snapshot",
    "neuro.turn.update",
    "neuro.consciousness.update",
    "persona.state.update",
];

/// Materializer dispatch table, resolved once per event at the type seam.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    ChatMessage,
    RunStep,
    Error,
    IndexingUpsert,
    OpsMetric,
    AgentDecisionTraceSummary,
    AgentReasoningSummary,
    RagSearchStart,
    RagSearchResult,
    RagContextCompiled,
    ScrapingPage,
    ScrapingDone,
    CompilerStart,
    CompilerResult,
    CompilerError,
    CompilerFallbackStart,
    CompilerFallbackResult,
    RetrievalStart,
    RetrievalResult,
    VoiceSessionStarted,
    VoiceAsrPartial,
    VoiceAsrFinal,
    VoiceTtsRequested,
    VoiceTtsAudioReady,
    VoiceTtsDone,
    VoiceError,
    ControlRoomTaskCreated,
    ControlRoomTaskUpdated,
    ControlRoomRunSpawned,
    ControlRoomApprovalRequested,
    ControlRoomApprovalResolved,
    ControlRoomActionUpdated,
    NeuroWakeStart,
    NeuroLayerSnapshot,
    NeuroConsciousnessSnapshot,
    NeuroTurnUpdate,
    NeuroConsciousnessUpdate,
    PersonaStateUpdate,
}

impl EventKind {
    pub fn from_type(event_type: &str) -> Option<EventKind> {
        let kind = match event_type {
            "chat.message" => EventKind::ChatMessage,
            "run.step" => EventKind::RunStep,
            "error" => EventKind::Error,
            "indexing.upsert" => EventKind::IndexingUpsert,
            "ops.metric" => EventKind::OpsMetric,
            "agent.decision_trace_summary" => EventKind::AgentDecisionTraceSummary,
            "agent.reasoning.summary" => EventKind::AgentReasoningSummary,
            "rag.search.start" => EventKind::RagSearchStart,
            "rag.search.result" => EventKind::RagSearchResult,
            "rag.context.compiled" => EventKind::RagContextCompiled,
            "scraping.page" => EventKind::ScrapingPage,
            "scraping.done" => EventKind::ScrapingDone,
            "compiler.start" => EventKind::CompilerStart,
            "compiler.result" => EventKind::CompilerResult,
            "compiler.error" => EventKind::CompilerError,
            "compiler.fallback_start" => EventKind::CompilerFallbackStart,
            "compiler.fallback_result" => EventKind::CompilerFallbackResult,
            "retrieval.start" => EventKind::RetrievalStart,
            "retrieval.result" => EventKind::RetrievalResult,
            "voice.session.started" => EventKind::VoiceSessionStarted,
            "voice.asr.partial" => EventKind::VoiceAsrPartial,
            "voice.asr.final" => EventKind::VoiceAsrFinal,
            "voice.tts.requested" => EventKind::VoiceTtsRequested,
            "voice.tts.audio.ready" => EventKind::VoiceTtsAudioReady,
            "voice.tts.done" => EventKind::VoiceTtsDone,
            "voice.error" => EventKind::VoiceError,
            "control_room.task.created" => EventKind::ControlRoomTaskCreated,
            "control_room.task.updated" => EventKind::ControlRoomTaskUpdated,
            "control_room.run.spawned" => EventKind::ControlRoomRunSpawned,
            "control_room.approval.requested" => EventKind::ControlRoomApprovalRequested,
            "control_room.approval.resolved" => EventKind::ControlRoomApprovalResolved,
            "control_room.action.updated" => EventKind::ControlRoomActionUpdated,
            "neuro.wake.start" => EventKind::NeuroWakeStart,
            "neuro.layer.snapshot" => EventKind::NeuroLayerSnapshot,
            "neuro.consciousness.snapshot" => EventKind::NeuroConsciousnessSnapshot,
            "neuro.turn.update" => EventKind::NeuroTurnUpdate,
            "neuro.consciousness.update" => EventKind::NeuroConsciousnessUpdate,
            "persona.state.update" => EventKind::PersonaStateUpdate,
            _ => return None,
        };
        Some(kind)
    }

    pub fn is_voice(&self) -> bool {
        matches!(
            self,
            EventKind::VoiceSessionStarted
                | EventKind::VoiceAsrPartial
                | EventKind::VoiceAsrFinal
                | EventKind::VoiceTtsRequested
                | EventKind::VoiceTtsAudioReady
                | EventKind::VoiceTtsDone
                | EventKind::VoiceError
        )
    }
}
