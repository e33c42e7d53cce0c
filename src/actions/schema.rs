use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::types::RiskLevel;

/// What the extractor does when deterministic patterns are not enough.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStrategy {
    /// No LLM: missing params are asked for directly.
    AskUser,
    /// Call the LLM only when no pattern matched.
    LlmExtract,
    /// Call the LLM even after a pattern match, as a second opinion.
    LlmVerify,
}

/// Serialized form of an action schema (see `config/actions.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionSchemaDoc {
    pub intent: String,
    pub description: String,
    #[serde(default)]
    pub required_params: Vec<String>,
    #[serde(default)]
    pub optional_params: Vec<String>,
    #[serde(default)]
    pub context_needed: Vec<String>,
    /// Parameter name → context key holding the entities it refers to.
    #[serde(default)]
    pub entity_params: BTreeMap<String, String>,
    pub risk: RiskLevel,
    pub fallback: FallbackStrategy,
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_template: Option<String>,
    pub confirmation_template: String,
    /// Context key whose entities this action shows the user as a
    /// numbered list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub displays: Option<String>,
}

/// Immutable action schema, built once at startup.
#[derive(Debug, Clone)]
pub struct ActionSchema {
    pub intent: String,
    pub description: String,
    pub required_params: Vec<String>,
    pub optional_params: Vec<String>,
    pub context_needed: Vec<String>,
    pub entity_params: BTreeMap<String, String>,
    pub risk: RiskLevel,
    pub fallback: FallbackStrategy,
    /// Ordered; first match wins. Named capture groups become params.
    pub patterns: Vec<Regex>,
    pub summary_template: Option<String>,
    pub confirmation_template: String,
    pub displays: Option<String>,
}

impl ActionSchema {
    /// Compile a schema document. Invalid patterns are logged and skipped;
    /// the schema stays usable through the LLM fallback. HIGH-risk schemas
    /// always get LLM verification.
    pub fn from_doc(doc: ActionSchemaDoc) -> Self {
        let patterns = doc
            .patterns
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    log::warn!("Skipping invalid pattern for {}: {}", doc.intent, e);
                    None
                }
            })
            .collect();

        let fallback = if doc.risk == RiskLevel::High && doc.fallback != FallbackStrategy::LlmVerify {
            log::warn!("{} is HIGH risk; using llm_verify instead of {:?}", doc.intent, doc.fallback);
            FallbackStrategy::LlmVerify
        } else {
            doc.fallback
        };

        Self {
            intent: doc.intent,
            description: doc.description,
            required_params: doc.required_params,
            optional_params: doc.optional_params,
            context_needed: doc.context_needed,
            entity_params: doc.entity_params,
            risk: doc.risk,
            fallback,
            patterns,
            summary_template: doc.summary_template,
            confirmation_template: doc.confirmation_template,
            displays: doc.displays,
        }
    }

    pub fn is_high_risk(&self) -> bool {
        self.risk == RiskLevel::High
    }

    /// Every parameter name the schema knows about.
    pub fn all_params(&self) -> impl Iterator<Item = &String> {
        self.required_params.iter().chain(self.optional_params.iter())
    }

    /// Context key for an entity-typed parameter.
    pub fn entity_context_key(&self, param: &str) -> Option<&str> {
        self.entity_params.get(param).map(String::as_str)
    }
}
