//! Types the orchestrator publishes to a host UI.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` so a host can
//! forward them over whatever bus it uses.

pub mod events;

pub use events::{MessageEvent, OrchestratorState, StatusEvent};
