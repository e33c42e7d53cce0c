//! Decision-tree model for intent classification.
//!
//! The JSON document is parsed loosely (`RawNode`) and then built once into
//! the tagged `DecisionNode` union. Anything malformed below the root is
//! replaced by the default leaf, so a walk always ends on a leaf with an
//! action.

use std::collections::HashMap;

use regex::Regex;
use serde::Deserialize;

use crate::error::TreeError;
use crate::types::{ParamValue, Params, TurnContext};
use crate::util::{contains_phrase, normalize_text};

/// Category emitted by the default leaf.
pub const UNKNOWN: &str = "UNKNOWN";
/// Category emitted when a leaf's required params are absent.
pub const NEEDS_CLARIFICATION: &str = "NEEDS_CLARIFICATION";

const DEFAULT_LEAF_CONFIDENCE: f64 = 0.3;
const DEFAULT_MAX_DEPTH: usize = 32;
const DEFAULT_CLARIFICATION_PENALTY: f64 = 0.5;

// ---------------------------------------------------------------------------
// Document shape
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeDocument {
    #[serde(default)]
    pub version: u32,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    #[serde(default = "default_clarification_penalty")]
    pub clarification_penalty: f64,
    #[serde(default)]
    pub required_params: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub root: Option<RawNode>,
}

fn default_max_depth() -> usize {
    DEFAULT_MAX_DEPTH
}

fn default_clarification_penalty() -> f64 {
    DEFAULT_CLARIFICATION_PENALTY
}

/// A node as written in the document. Branch and leaf fields are all
/// optional here; `build_node` decides what the node actually is.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawNode {
    #[serde(default)]
    pub condition: Option<serde_json::Value>,
    #[serde(default)]
    pub yes: Option<Box<RawNode>>,
    #[serde(default)]
    pub no: Option<Box<RawNode>>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub extract: Vec<RawRule>,
    #[serde(default)]
    pub follow_up: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawRule {
    pub param: String,
    pub pattern: String,
    #[serde(default = "default_group")]
    pub group: usize,
}

fn default_group() -> usize {
    1
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawCondition {
    Always,
    Keywords { keywords: Vec<String> },
    Regex { pattern: String },
    StartsWith { prefixes: Vec<String> },
    ContextFlag { flag: String },
}

// ---------------------------------------------------------------------------
// Built tree
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Condition {
    Always,
    /// Any keyword present as a whole word or phrase in normalized text.
    Keywords(Vec<String>),
    /// Matched against the raw text.
    Regex(Regex),
    /// Normalized text begins with one of the prefixes (word-bounded).
    StartsWith(Vec<String>),
    ContextFlag(String),
}

impl Condition {
    pub fn matches(&self, raw: &str, normalized: &str, ctx: &TurnContext) -> bool {
        match self {
            Condition::Always => true,
            Condition::Keywords(keywords) => keywords.iter().any(|k| contains_phrase(normalized, k)),
            Condition::Regex(re) => re.is_match(raw),
            Condition::StartsWith(prefixes) => prefixes.iter().any(|p| {
                normalized == p
                    || normalized
                        .strip_prefix(p.as_str())
                        .map_or(false, |rest| rest.starts_with(' '))
            }),
            Condition::ContextFlag(flag) => ctx.flag(flag),
        }
    }

    fn from_raw(raw: RawCondition) -> Result<Self, String> {
        Ok(match raw {
            RawCondition::Always => Condition::Always,
            RawCondition::Keywords { keywords } => {
                let keywords: Vec<String> = keywords
                    .iter()
                    .map(|k| normalize_text(k))
                    .filter(|k| !k.is_empty())
                    .collect();
                if keywords.is_empty() {
                    return Err("keyword condition with no keywords".into());
                }
                Condition::Keywords(keywords)
            }
            RawCondition::Regex { pattern } => {
                Condition::Regex(Regex::new(&pattern).map_err(|e| format!("bad regex: {}", e))?)
            }
            RawCondition::StartsWith { prefixes } => {
                let prefixes: Vec<String> = prefixes
                    .iter()
                    .map(|p| normalize_text(p))
                    .filter(|p| !p.is_empty())
                    .collect();
                if prefixes.is_empty() {
                    return Err("starts_with condition with no prefixes".into());
                }
                Condition::StartsWith(prefixes)
            }
            RawCondition::ContextFlag { flag } => {
                if flag.trim().is_empty() {
                    return Err("context_flag condition with no flag".into());
                }
                Condition::ContextFlag(flag)
            }
        })
    }
}

/// A regex capture that fills one parameter at a leaf.
#[derive(Debug, Clone)]
pub struct ExtractionRule {
    pub param: String,
    pub regex: Regex,
    pub group: usize,
}

#[derive(Debug, Clone)]
pub struct Leaf {
    pub action: String,
    pub confidence: f64,
    pub rules: Vec<ExtractionRule>,
    pub follow_up: Option<String>,
}

impl Leaf {
    pub fn default_leaf() -> Self {
        Self {
            action: UNKNOWN.to_string(),
            confidence: DEFAULT_LEAF_CONFIDENCE,
            rules: Vec::new(),
            follow_up: None,
        }
    }

    /// Run this leaf's rules. First rule to capture a param wins.
    pub fn extract(&self, text: &str) -> Params {
        let mut params = Params::new();
        for rule in &self.rules {
            if params.contains_key(&rule.param) {
                continue;
            }
            let captured = rule
                .regex
                .captures(text)
                .and_then(|caps| caps.get(rule.group))
                .map(|m| m.as_str().trim().to_string())
                .filter(|s| !s.is_empty());
            if let Some(value) = captured {
                params.insert(rule.param.clone(), ParamValue::Text(value));
            }
        }
        params
    }
}

#[derive(Debug, Clone)]
pub enum DecisionNode {
    Branch {
        condition: Condition,
        yes: Box<DecisionNode>,
        no: Box<DecisionNode>,
    },
    Leaf(Leaf),
}

/// A fully built tree plus the tables that travel with it.
#[derive(Debug, Clone)]
pub struct DecisionTree {
    pub root: DecisionNode,
    pub max_depth: usize,
    pub clarification_penalty: f64,
    pub required_params: HashMap<String, Vec<String>>,
    default_leaf: Leaf,
}

impl DecisionTree {
    pub fn from_json(json: &str) -> Result<Self, TreeError> {
        let doc: TreeDocument = serde_json::from_str(json)?;
        Self::from_document(doc)
    }

    pub fn from_document(doc: TreeDocument) -> Result<Self, TreeError> {
        let raw_root = doc.root.ok_or(TreeError::MissingRoot)?;
        let max_depth = doc.max_depth.max(1);
        let root = build_node(raw_root, 0, max_depth);
        Ok(Self {
            root,
            max_depth,
            clarification_penalty: doc.clarification_penalty.clamp(0.0, 1.0),
            required_params: doc.required_params,
            default_leaf: Leaf::default_leaf(),
        })
    }

    /// A tree with nothing but the default leaf.
    pub fn fallback() -> Self {
        Self {
            root: DecisionNode::Leaf(Leaf::default_leaf()),
            max_depth: DEFAULT_MAX_DEPTH,
            clarification_penalty: DEFAULT_CLARIFICATION_PENALTY,
            required_params: HashMap::new(),
            default_leaf: Leaf::default_leaf(),
        }
    }

    /// Walk from the root to a leaf, bounded by `max_depth`.
    pub fn walk(&self, raw: &str, normalized: &str, ctx: &TurnContext) -> &Leaf {
        let mut node = &self.root;
        let mut depth = 0;
        loop {
            match node {
                DecisionNode::Leaf(leaf) => return leaf,
                DecisionNode::Branch { condition, yes, no } => {
                    if depth >= self.max_depth {
                        log::warn!("Decision tree walk exceeded max depth {}", self.max_depth);
                        return &self.default_leaf;
                    }
                    depth += 1;
                    node = if condition.matches(raw, normalized, ctx) {
                        yes
                    } else {
                        no
                    };
                }
            }
        }
    }

    pub fn required_for(&self, action: &str) -> &[String] {
        self.required_params
            .get(action)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Every action reachable from the root.
    pub fn actions(&self) -> Vec<&str> {
        let mut out = Vec::new();
        let mut stack = vec![&self.root];
        while let Some(node) = stack.pop() {
            match node {
                DecisionNode::Leaf(leaf) => {
                    if !out.contains(&leaf.action.as_str()) {
                        out.push(leaf.action.as_str());
                    }
                }
                DecisionNode::Branch { yes, no, .. } => {
                    stack.push(yes);
                    stack.push(no);
                }
            }
        }
        out
    }
}

fn build_node(raw: RawNode, depth: usize, max_depth: usize) -> DecisionNode {
    if depth > max_depth {
        log::warn!("Decision tree deeper than {}; truncating to default leaf", max_depth);
        return DecisionNode::Leaf(Leaf::default_leaf());
    }

    if let Some(action) = raw.action.as_deref().map(str::trim) {
        if action.is_empty() {
            log::warn!("Decision tree leaf with empty action; using default leaf");
            return DecisionNode::Leaf(Leaf::default_leaf());
        }
        return DecisionNode::Leaf(build_leaf(action, &raw));
    }

    let condition = match raw.condition.map(serde_json::from_value::<RawCondition>) {
        Some(Ok(c)) => Condition::from_raw(c),
        Some(Err(e)) => Err(format!("unrecognised condition: {}", e)),
        None => Err("interior node without condition".to_string()),
    };

    match (condition, raw.yes, raw.no) {
        (Ok(condition), Some(yes), Some(no)) => DecisionNode::Branch {
            condition,
            yes: Box::new(build_node(*yes, depth + 1, max_depth)),
            no: Box::new(build_node(*no, depth + 1, max_depth)),
        },
        (Err(reason), _, _) => {
            log::warn!("Malformed decision node at depth {}: {}", depth, reason);
            DecisionNode::Leaf(Leaf::default_leaf())
        }
        _ => {
            log::warn!("Decision node at depth {} is missing a child", depth);
            DecisionNode::Leaf(Leaf::default_leaf())
        }
    }
}

fn build_leaf(action: &str, raw: &RawNode) -> Leaf {
    let rules = raw
        .extract
        .iter()
        .filter_map(|r| match Regex::new(&r.pattern) {
            Ok(regex) => Some(ExtractionRule {
                param: r.param.clone(),
                regex,
                group: r.group,
            }),
            Err(e) => {
                log::warn!("Skipping extraction rule for {}.{}: {}", action, r.param, e);
                None
            }
        })
        .collect();

    Leaf {
        action: action.to_string(),
        confidence: raw
            .confidence
            .unwrap_or(DEFAULT_LEAF_CONFIDENCE)
            .clamp(0.0, 1.0),
        rules,
        follow_up: raw.follow_up.clone().filter(|f| !f.trim().is_empty()),
    }
}
