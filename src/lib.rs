//! Conversational action engine for the DailyOS assistant.
//!
//! Turns free-text messages into validated actions: classify the intent,
//! extract parameters, resolve entity references, ask when something is
//! missing or risky, and drive multi-turn workflows.

pub mod actions;
pub mod db;
pub mod engine;
pub mod error;
pub mod extract;
pub mod intent;
mod migrations;
pub mod providers;
pub mod resolve;
pub mod session;
pub mod state;
pub mod types;
pub mod util;
pub mod validate;
pub mod workflow;

pub use engine::{ConversationEngine, TurnOutcome};
pub use error::{ConfigError, EngineError, TreeError};
pub use state::{load_config, EngineState};
pub use types::{EngineConfig, EntityRecord, ParamValue, Params, TurnContext};
