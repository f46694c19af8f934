pub mod routes;
pub mod runtime;
pub mod state;
pub mod telemetry;

pub use routes::build_router;
pub use state::AppState;
