//! Interactive console for the conversation engine.
//!
//! Reads one message per line from stdin. Prefix a line with `@name ` to
//! speak as another user. Actions are printed instead of executed.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};

use dailyos_converse::providers::{ActionExecutor, Notifier};
use dailyos_converse::state::EngineState;
use dailyos_converse::types::{Params, TurnContext};

const DEFAULT_USER: &str = "local";

/// Prints the action and its params.
struct DryRun;

#[async_trait]
impl ActionExecutor for DryRun {
    async fn execute(&self, intent: &str, params: &Params, _ctx: &TurnContext) -> Result<String, String> {
        let rendered = serde_json::to_string(params).map_err(|e| e.to_string())?;
        Ok(format!("[{}] {}", intent, rendered))
    }
}

struct Console;

#[async_trait]
impl Notifier for Console {
    async fn notify(&self, user_id: &str, text: &str) {
        println!("{}> {}", user_id, text);
    }
}

fn split_user(line: &str) -> (&str, &str) {
    match line.strip_prefix('@').and_then(|rest| rest.split_once(' ')) {
        Some((user, text)) if !user.is_empty() => (user, text.trim()),
        _ => (DEFAULT_USER, line),
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let state = match EngineState::open_default() {
        Ok(state) => state,
        Err(e) => {
            eprintln!("Failed to start: {}", e);
            std::process::exit(1);
        }
    };
    let _watcher = state.watch_tree();
    let engine = state.engine(Arc::new(DryRun)).with_notifier(Arc::new(Console));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                log::warn!("stdin read failed: {}", e);
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (user, text) = split_user(line);
        if let Err(e) = engine.handle_message(user, text, TurnContext::default()).await {
            log::warn!("Turn failed for {}: {}", user, e);
            if e.is_retryable() {
                println!("{}> {}", user, e.user_message());
            }
        }
    }
}
