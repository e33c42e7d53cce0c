//! LLM capability seam, prompt construction and reply parsing.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::actions::ActionSchema;
use crate::types::{Params, TurnContext};
use crate::util::truncate_chars;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM unavailable")]
    Unavailable,

    #[error("LLM call timed out after {0}s")]
    Timeout(u64),

    #[error("LLM backend error: {0}")]
    Backend(String),
}

/// A completion backend. Implementations live with the host application.
#[async_trait]
pub trait LlmCapability: Send + Sync {
    /// Cheap check made before every call.
    fn is_available(&self) -> bool;

    async fn complete(&self, prompt: &str) -> Result<String, LlmError>;
}

/// A synchronous backend, e.g. a CLI spawned per call.
pub trait BlockingCompletion: Send + Sync + 'static {
    fn is_available(&self) -> bool;
    fn complete_blocking(&self, prompt: &str) -> Result<String, LlmError>;
}

/// Runs a `BlockingCompletion` on tokio's blocking pool so a slow model
/// never stalls the async workers.
pub struct BlockingLlm<B> {
    backend: Arc<B>,
}

impl<B: BlockingCompletion> BlockingLlm<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }
}

#[async_trait]
impl<B: BlockingCompletion> LlmCapability for BlockingLlm<B> {
    fn is_available(&self) -> bool {
        self.backend.is_available()
    }

    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        let backend = Arc::clone(&self.backend);
        let prompt = prompt.to_string();
        tokio::task::spawn_blocking(move || backend.complete_blocking(&prompt))
            .await
            .map_err(|e| LlmError::Backend(format!("blocking task failed: {}", e)))?
    }
}

// ---------------------------------------------------------------------------
// Prompt
// ---------------------------------------------------------------------------

/// Build the extraction prompt for one schema.
///
/// Only the context keys the schema declares are included, serialized and
/// cut to `char_budget` characters in total.
pub fn build_prompt(schema: &ActionSchema, text: &str, ctx: &TurnContext, char_budget: usize) -> String {
    let mut context_block = String::new();
    let mut remaining = char_budget;
    for key in &schema.context_needed {
        if remaining == 0 {
            break;
        }
        let entities = ctx.entities(key);
        if entities.is_empty() {
            continue;
        }
        let Ok(json) = serde_json::to_string(entities) else {
            continue;
        };
        let line = format!("{}: {}\n", key, json);
        let slice = truncate_chars(&line, remaining);
        remaining -= slice.chars().count();
        context_block.push_str(slice);
    }
    if context_block.is_empty() {
        context_block.push_str("(none)\n");
    }

    format!(
        r#"You extract parameters for the action "{intent}" ({description}).

Required parameters: {required}
Optional parameters: {optional}

Context:
{context}
User message:
{text}

Reply with a single JSON object and nothing else:
{{"params": {{"<name>": <value>}}, "missing": ["<required name not present>"], "confidence": <0.0-1.0>, "reasoning": "<one sentence>"}}
"#,
        intent = schema.intent,
        description = schema.description,
        required = list_or_none(&schema.required_params),
        optional = list_or_none(&schema.optional_params),
        context = context_block,
        text = text.trim(),
    )
}

fn list_or_none(names: &[String]) -> String {
    if names.is_empty() {
        "none".to_string()
    } else {
        names.join(", ")
    }
}

// ---------------------------------------------------------------------------
// Reply parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LlmReply {
    #[serde(default)]
    pub params: Params,
    #[serde(default)]
    pub missing: Vec<String>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
}

/// Parse a model reply, tolerating code fences and surrounding prose.
pub fn parse_reply(text: &str) -> Option<LlmReply> {
    let json = extract_json_object(text)?;
    match serde_json::from_str::<LlmReply>(&json) {
        Ok(mut reply) => {
            reply.confidence = reply.confidence.clamp(0.0, 1.0);
            reply.params.retain(|_, v| !v.is_empty());
            Some(reply)
        }
        Err(e) => {
            log::warn!("Failed to parse LLM extraction reply: {}", e);
            None
        }
    }
}

/// First balanced top-level `{...}` in `text`, string-aware.
pub fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if escape {
            escape = false;
            continue;
        }
        if b == b'\\' && in_string {
            escape = true;
            continue;
        }
        if b == b'"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        match b {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..=i].to_string());
                }
            }
            _ => {}
        }
    }
    None
}
