use std::future::Future;

tokio::task_local! {
    static PERSONA_CONTEXT: PersonaContext;
    static PERSONA_EMIT_ALLOWED: bool;
}

/// Correlation and turn context for one inbound request/turn.
///
/// Carried via a task-local so downstream emitters (RAG, tools, workers) get
/// consistent ids without threading parameters everywhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersonaContext {
    pub conversation_id: String,
    pub correlation_id: String,
    pub turn_id: String,
    pub trace_id: Option<String>,
}

impl PersonaContext {
    /// Build the context for one inbound request. Missing ids fall back:
    /// `correlation_id` to the trace or a fresh id, `turn_id` to a fresh id.
    pub fn for_request(
        conversation_id: Option<&str>,
        trace_id: Option<&str>,
        correlation_id: Option<&str>,
        turn_id: Option<&str>,
    ) -> Self {
        let conversation_id = denis_core::event::normalize_conversation_id(conversation_id);
        let trace = trace_id
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string);
        let correlation_id = correlation_id
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .or_else(|| trace.clone())
            .unwrap_or_else(denis_core::new_id);
        let turn_id = turn_id
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .unwrap_or_else(denis_core::new_id);

        Self {
            conversation_id,
            correlation_id,
            turn_id,
            trace_id: trace,
        }
    }
}

/// Run `fut` with `ctx` as the current persona turn context.
pub async fn with_persona_context<F>(ctx: PersonaContext, fut: F) -> F::Output
where
    F: Future,
{
    PERSONA_CONTEXT.scope(ctx, fut).await
}

/// The current turn context, if any was established for this task.
pub fn current_context() -> Option<PersonaContext> {
    PERSONA_CONTEXT.try_with(Clone::clone).ok()
}

/// Run `fut` with event emission allowed (the persona emitter marker).
pub async fn with_persona_emitter<F>(fut: F) -> F::Output
where
    F: Future,
{
    PERSONA_EMIT_ALLOWED.scope(true, fut).await
}

/// Whether the current task is inside a persona emitter scope.
pub fn persona_emit_allowed() -> bool {
    PERSONA_EMIT_ALLOWED.try_with(|allowed| *allowed).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn context_is_scoped_to_the_task() {
        assert!(current_context().is_none());
        let ctx = PersonaContext::for_request(Some("conv"), Some("trace-1"), None, None);
        with_persona_context(ctx.clone(), async {
            let current = current_context().expect("context set");
            assert_eq!(current, ctx);
        })
        .await;
        assert!(current_context().is_none());
    }

    #[tokio::test]
    async fn emitter_marker_is_scoped() {
        assert!(!persona_emit_allowed());
        with_persona_emitter(async {
            assert!(persona_emit_allowed());
        })
        .await;
        assert!(!persona_emit_allowed());
    }

    #[test]
    fn correlation_falls_back_to_trace_then_fresh() {
        let ctx = PersonaContext::for_request(None, Some("trace-7"), None, None);
        assert_eq!(ctx.conversation_id, "default");
        assert_eq!(ctx.correlation_id, "trace-7");
        assert_eq!(ctx.trace_id.as_deref(), Some("trace-7"));
        assert_eq!(ctx.turn_id.len(), 32);

        let ctx = PersonaContext::for_request(Some("conv"), None, None, None);
        assert_eq!(ctx.correlation_id.len(), 32);
        assert!(ctx.trace_id.is_none());

        let ctx = PersonaContext::for_request(None, Some("t"), Some("corr-x"), Some("turn-x"));
        assert_eq!(ctx.correlation_id, "corr-x");
        assert_eq!(ctx.turn_id, "turn-x");
    }
}
