use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Engine configuration, loaded from `~/.dailyos/assistant.json`.
///
/// Every field has a default so a partial (or missing) file still yields a
/// usable config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Below this extraction confidence the validator asks for confirmation.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    #[serde(default = "default_awaiting_ttl_secs")]
    pub awaiting_ttl_secs: i64,
    #[serde(default = "default_reference_ttl_secs")]
    pub reference_ttl_secs: i64,
    #[serde(default = "default_recency_window_secs")]
    pub recency_window_secs: i64,
    #[serde(default = "default_recency_bonus")]
    pub recency_bonus: f64,
    #[serde(default = "default_auto_select_score")]
    pub auto_select_score: f64,
    #[serde(default = "default_shortlist_score")]
    pub shortlist_score: f64,
    #[serde(default = "default_workflow_max_age_hours")]
    pub workflow_max_age_hours: i64,
    #[serde(default = "default_llm_timeout_secs")]
    pub llm_timeout_secs: u64,
    /// Upper bound on the serialized context embedded in extraction prompts.
    #[serde(default = "default_context_char_budget")]
    pub context_char_budget: usize,
    /// Decision-tree document. `None` uses the built-in tree.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tree_path: Option<PathBuf>,
    /// Custom action schema file. `None` uses the built-in schemas.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actions_path: Option<PathBuf>,
    /// SQLite database. `None` resolves to `~/.dailyos/assistant.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<PathBuf>,
}

fn default_confidence_threshold() -> f64 {
    0.70
}

fn default_awaiting_ttl_secs() -> i64 {
    10 * 60
}

fn default_reference_ttl_secs() -> i64 {
    30 * 60
}

fn default_recency_window_secs() -> i64 {
    60 * 60
}

fn default_recency_bonus() -> f64 {
    10.0
}

fn default_auto_select_score() -> f64 {
    90.0
}

fn default_shortlist_score() -> f64 {
    70.0
}

fn default_workflow_max_age_hours() -> i64 {
    24
}

fn default_llm_timeout_secs() -> u64 {
    30
}

fn default_context_char_budget() -> usize {
    2000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            awaiting_ttl_secs: default_awaiting_ttl_secs(),
            reference_ttl_secs: default_reference_ttl_secs(),
            recency_window_secs: default_recency_window_secs(),
            recency_bonus: default_recency_bonus(),
            auto_select_score: default_auto_select_score(),
            shortlist_score: default_shortlist_score(),
            workflow_max_age_hours: default_workflow_max_age_hours(),
            llm_timeout_secs: default_llm_timeout_secs(),
            context_char_budget: default_context_char_budget(),
            tree_path: None,
            actions_path: None,
            db_path: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Risk + awaiting kinds
// ---------------------------------------------------------------------------

/// Static per-action classification governing mandatory confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// Why a clarification question is outstanding for a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AwaitingKind {
    MissingParams,
    LowConfidence,
    HighRisk,
    Ambiguous,
}

impl AwaitingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingParams => "missing_params",
            Self::LowConfidence => "low_confidence",
            Self::HighRisk => "high_risk",
            Self::Ambiguous => "ambiguous",
        }
    }

    /// Kinds answered with a plain yes/no.
    pub fn is_confirmation(&self) -> bool {
        matches!(self, Self::LowConfidence | Self::HighRisk)
    }
}

impl fmt::Display for AwaitingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Entities + context
// ---------------------------------------------------------------------------

/// A record returned by an entity context provider (task, email, document…).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRecord {
    /// Identifying key (task id, message id, file id).
    pub key: String,
    /// Human-facing label used for display and fuzzy matching.
    pub display: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub touched_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

impl EntityRecord {
    pub fn new(key: impl Into<String>, display: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            display: display.into(),
            touched_at: None,
            attributes: serde_json::Map::new(),
        }
    }

    pub fn touched(mut self, at: DateTime<Utc>) -> Self {
        self.touched_at = Some(at);
        self
    }
}

/// Per-turn context handed to the classifier, extractor and validator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnContext {
    pub user_id: String,
    /// Entity lists keyed by context key, e.g. `active_tasks`.
    #[serde(default)]
    pub entities: BTreeMap<String, Vec<EntityRecord>>,
    /// Boolean flags read by `context_flag` tree conditions.
    #[serde(default)]
    pub flags: BTreeMap<String, bool>,
    /// Set once the user has explicitly confirmed the pending action.
    #[serde(default)]
    pub user_confirmed: bool,
}

impl TurnContext {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Default::default()
        }
    }

    pub fn with_entities(mut self, key: &str, records: Vec<EntityRecord>) -> Self {
        self.entities.insert(key.to_string(), records);
        self
    }

    pub fn with_flag(mut self, name: &str, value: bool) -> Self {
        self.flags.insert(name.to_string(), value);
        self
    }

    pub fn entities(&self, key: &str) -> &[EntityRecord] {
        self.entities.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn flag(&self, name: &str) -> bool {
        self.flags.get(name).copied().unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// A typed parameter value.
///
/// Variant order matters for untagged deserialization of LLM output: an
/// array of objects becomes `Candidates`, an array of strings becomes `List`,
/// and anything unrecognised is kept verbatim in `Other`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Integer(i64),
    Float(f64),
    Flag(bool),
    Text(String),
    Candidates(Vec<EntityRecord>),
    List(Vec<String>),
    Entity(EntityRecord),
    Other(serde_json::Value),
}

impl ParamValue {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    /// An unresolved ambiguity: more than one candidate entity.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, Self::Candidates(c) if c.len() > 1)
    }

    /// Treats empty strings, empty lists and JSON null as absent.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(s) => s.trim().is_empty(),
            Self::Candidates(c) => c.is_empty(),
            Self::List(l) => l.is_empty(),
            Self::Other(v) => v.is_null(),
            _ => false,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Human-readable rendering used in questions and confirmations.
    pub fn display(&self) -> String {
        match self {
            Self::Integer(n) => n.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Flag(b) => if *b { "yes" } else { "no" }.to_string(),
            Self::Text(s) => s.clone(),
            Self::Candidates(c) => c
                .iter()
                .map(|e| e.display.as_str())
                .collect::<Vec<_>>()
                .join(" / "),
            Self::List(l) => l.join(", "),
            Self::Entity(e) => e.display.clone(),
            Self::Other(v) => v.to_string(),
        }
    }
}

pub type Params = BTreeMap<String, ParamValue>;

/// Required params absent (or empty) in `params`, preserving `required` order.
pub fn missing_params(required: &[String], params: &Params) -> Vec<String> {
    required
        .iter()
        .filter(|name| params.get(*name).map_or(true, ParamValue::is_empty))
        .cloned()
        .collect()
}
