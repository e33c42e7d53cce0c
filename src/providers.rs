//! Seams to the host application: entity lookup, action execution and
//! outbound messages.

use async_trait::async_trait;

use crate::types::{EntityRecord, Params, TurnContext};

/// Supplies entity lists (tasks, emails, sheets) for a context key.
#[async_trait]
pub trait EntityProvider: Send + Sync {
    /// A bounded, most-recent-first list. Returning nothing is fine.
    async fn fetch(&self, user_id: &str, key: &str) -> Vec<EntityRecord>;
}

/// Performs a validated action against the outside world.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// On success, the text to send back to the user.
    async fn execute(&self, intent: &str, params: &Params, ctx: &TurnContext) -> Result<String, String>;
}

/// Fire-and-forget delivery of assistant replies.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, user_id: &str, text: &str);
}

/// Provider that knows no entities.
pub struct NoEntities;

#[async_trait]
impl EntityProvider for NoEntities {
    async fn fetch(&self, _user_id: &str, _key: &str) -> Vec<EntityRecord> {
        Vec::new()
    }
}

/// Notifier that only logs.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, user_id: &str, text: &str) {
        log::info!("Reply to {}: {}", user_id, text);
    }
}
