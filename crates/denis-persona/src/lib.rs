//! Persona frontdoor: the only legitimate emitter into the event bus.

mod context;
mod frontdoor;
mod stats;

pub use context::{
    current_context, persona_emit_allowed, with_persona_context, with_persona_emitter,
    PersonaContext,
};
pub use frontdoor::{BypassMode, EmitError, EmitParams, Frontdoor, FrontdoorPolicy};
pub use stats::EmitterStatsSnapshot;
