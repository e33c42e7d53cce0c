//! Parameter extraction.
//!
//! Deterministic patterns run first. The LLM is consulted when nothing
//! matched (for `LlmExtract`/`LlmVerify` schemas), or after a match as a
//! second opinion for `LlmVerify`. Extraction never fails: any problem
//! yields an empty result with confidence 0.

mod llm;
mod patterns;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::actions::{ActionRegistry, ActionSchema, FallbackStrategy};
use crate::types::{missing_params, Params, TurnContext};

pub use llm::{
    build_prompt, extract_json_object, parse_reply, BlockingCompletion, BlockingLlm,
    LlmCapability, LlmError, LlmReply,
};
pub use patterns::{infer_priority, match_patterns, PatternMatch, PATTERN_CONFIDENCE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionSource {
    Pattern,
    Llm,
    /// Pattern values with LLM gap-filling.
    Merged,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractionResult {
    pub params: Params,
    pub missing: Vec<String>,
    pub confidence: f64,
    pub reasoning: String,
    pub source: ExtractionSource,
}

impl ExtractionResult {
    fn empty(schema: Option<&ActionSchema>, reasoning: impl Into<String>) -> Self {
        Self {
            params: Params::new(),
            missing: schema.map(|s| s.required_params.clone()).unwrap_or_default(),
            confidence: 0.0,
            reasoning: reasoning.into(),
            source: ExtractionSource::None,
        }
    }
}

pub struct ParameterExtractor {
    registry: Arc<ActionRegistry>,
    llm: Option<Arc<dyn LlmCapability>>,
    timeout: Duration,
    context_char_budget: usize,
}

impl ParameterExtractor {
    pub fn new(registry: Arc<ActionRegistry>) -> Self {
        Self {
            registry,
            llm: None,
            timeout: Duration::from_secs(30),
            context_char_budget: 2000,
        }
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmCapability>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_context_budget(mut self, chars: usize) -> Self {
        self.context_char_budget = chars;
        self
    }

    pub async fn extract(&self, intent: &str, text: &str, ctx: &TurnContext) -> ExtractionResult {
        let Some(schema) = self.registry.get(intent) else {
            return ExtractionResult::empty(None, format!("no schema for {}", intent));
        };

        let pattern = match_patterns(schema, text, ctx);

        let result = match (pattern, schema.fallback) {
            (Some(m), FallbackStrategy::LlmVerify) => match self.call_llm(schema, text, ctx).await {
                Ok(reply) => merge_verified(schema, m, reply),
                Err(e) => {
                    log::debug!("LLM verification skipped for {}: {}", schema.intent, e);
                    from_pattern(schema, m)
                }
            },
            (Some(m), _) => from_pattern(schema, m),
            (None, FallbackStrategy::AskUser) => {
                ExtractionResult::empty(Some(schema), "no pattern matched")
            }
            (None, _) => match self.call_llm(schema, text, ctx).await {
                Ok(reply) => from_llm(schema, reply),
                Err(e) => {
                    log::warn!("LLM extraction failed for {}: {}", schema.intent, e);
                    ExtractionResult::empty(Some(schema), e.to_string())
                }
            },
        };

        log::debug!(
            "Extracted {} params for {} via {:?} ({:.2})",
            result.params.len(),
            intent,
            result.source,
            result.confidence
        );
        result
    }

    async fn call_llm(
        &self,
        schema: &ActionSchema,
        text: &str,
        ctx: &TurnContext,
    ) -> Result<LlmReply, LlmError> {
        let llm = self.llm.as_ref().ok_or(LlmError::Unavailable)?;
        if !llm.is_available() {
            return Err(LlmError::Unavailable);
        }
        let prompt = build_prompt(schema, text, ctx, self.context_char_budget);
        let raw = tokio::time::timeout(self.timeout, llm.complete(&prompt))
            .await
            .map_err(|_| LlmError::Timeout(self.timeout.as_secs()))??;
        parse_reply(&raw).ok_or_else(|| LlmError::Backend("unparseable reply".into()))
    }
}

fn from_pattern(schema: &ActionSchema, m: PatternMatch) -> ExtractionResult {
    ExtractionResult {
        missing: missing_params(&schema.required_params, &m.params),
        params: m.params,
        confidence: m.confidence,
        reasoning: m.notes.join("; "),
        source: ExtractionSource::Pattern,
    }
}

fn from_llm(schema: &ActionSchema, reply: LlmReply) -> ExtractionResult {
    let mut params = only_known(schema, reply.params);
    patterns::parse_numeric_ids(schema, &mut params);
    ExtractionResult {
        missing: missing_params(&schema.required_params, &params),
        params,
        confidence: reply.confidence,
        reasoning: reply.reasoning,
        source: ExtractionSource::Llm,
    }
}

/// Pattern values win; the LLM only fills gaps. Confidence is the lower of
/// the two.
fn merge_verified(schema: &ActionSchema, m: PatternMatch, reply: LlmReply) -> ExtractionResult {
    let mut params = only_known(schema, reply.params);
    patterns::parse_numeric_ids(schema, &mut params);
    params.extend(m.params);
    ExtractionResult {
        missing: missing_params(&schema.required_params, &params),
        params,
        confidence: m.confidence.min(reply.confidence),
        reasoning: format!("{}; {}", m.notes.join("; "), reply.reasoning),
        source: ExtractionSource::Merged,
    }
}

/// Drop anything the model invented that the schema doesn't declare.
fn only_known(schema: &ActionSchema, mut params: Params) -> Params {
    params.retain(|name, _| schema.all_params().any(|p| p == name));
    params
}
