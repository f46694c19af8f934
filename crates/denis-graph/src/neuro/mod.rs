pub mod sequences;
pub mod state;

pub use sequences::{
    read_consciousness, read_layers, update_sequence, wake_sequence, NeuroEmission, TurnMeta,
    IDENTITY_ID,
};
pub use state::{
    default_layers, derive_consciousness, ConsciousnessState, DeriveSignals, NeuroLayerState,
    CONSCIOUSNESS_ID, LAYER_DEFINITIONS,
};
