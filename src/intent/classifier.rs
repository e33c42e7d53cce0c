//! Decision-tree intent classifier with hot reload and an optional
//! secondary categorizer.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::embedded::default_tree;
use super::tree::{DecisionTree, NEEDS_CLARIFICATION};
use crate::error::TreeError;
use crate::types::{missing_params, Params, TurnContext};
use crate::util::{content_hash, humanize, normalize_text};

/// Added to the tree's confidence when the secondary categorizer agrees.
const AGREEMENT_BOOST: f64 = 0.05;
/// Minimum secondary confidence to replace a NEEDS_CLARIFICATION result.
const SECONDARY_MIN: f64 = 0.6;

/// Result of classifying one message.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub category: String,
    pub confidence: f64,
    pub params: Params,
    pub follow_up: Option<String>,
    /// The action a NEEDS_CLARIFICATION result is waiting on.
    pub pending_action: Option<String>,
}

impl Classification {
    pub fn needs_clarification(&self) -> bool {
        self.category == NEEDS_CLARIFICATION
    }

    /// The action this message is about, if any.
    pub fn effective_action(&self) -> &str {
        self.pending_action.as_deref().unwrap_or(&self.category)
    }
}

/// A category guess from some other model.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryGuess {
    pub category: String,
    pub confidence: f64,
}

/// Optional second opinion consulted after the tree walk.
pub trait SecondaryClassifier: Send + Sync {
    fn categorize(&self, text: &str) -> Option<CategoryGuess>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// No source configured or the content hash is unchanged.
    Unchanged,
    Reloaded,
    /// The previous tree was kept.
    Failed(String),
}

pub struct IntentClassifier {
    tree: RwLock<Arc<DecisionTree>>,
    source: Option<PathBuf>,
    loaded_hash: Mutex<Option<String>>,
    secondary: Option<Arc<dyn SecondaryClassifier>>,
}

impl IntentClassifier {
    /// Build from the embedded default tree.
    pub fn builtin() -> Self {
        Self {
            tree: RwLock::new(Arc::new(default_tree())),
            source: None,
            loaded_hash: Mutex::new(None),
            secondary: None,
        }
    }

    /// Build from a tree file. An unreadable or invalid file falls back to
    /// the embedded tree; later `reload_if_changed` calls keep retrying it.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let (tree, hash) = match read_tree(&path) {
            Ok((tree, hash)) => {
                log::info!("Loaded decision tree from {}", path.display());
                (tree, Some(hash))
            }
            Err(e) => {
                log::warn!("{}; using built-in decision tree", e);
                (default_tree(), None)
            }
        };
        Self {
            tree: RwLock::new(Arc::new(tree)),
            source: Some(path),
            loaded_hash: Mutex::new(hash),
            secondary: None,
        }
    }

    pub fn with_secondary(mut self, secondary: Arc<dyn SecondaryClassifier>) -> Self {
        self.secondary = Some(secondary);
        self
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Current tree snapshot. Reloads swap the `Arc`, so in-flight walks
    /// keep the tree they started with.
    pub fn tree(&self) -> Arc<DecisionTree> {
        self.tree.read().clone()
    }

    /// Re-read the source and swap the tree if its content hash changed.
    pub fn reload_if_changed(&self) -> ReloadOutcome {
        let Some(path) = self.source.as_deref() else {
            return ReloadOutcome::Unchanged;
        };

        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) => {
                log::warn!(
                    "Decision tree {} unreadable, keeping current tree: {}",
                    path.display(),
                    e
                );
                return ReloadOutcome::Failed(e.to_string());
            }
        };

        let hash = content_hash(&bytes);
        let mut loaded = self.loaded_hash.lock();
        if loaded.as_deref() == Some(hash.as_str()) {
            return ReloadOutcome::Unchanged;
        }

        let parsed = std::str::from_utf8(&bytes)
            .map_err(|e| e.to_string())
            .and_then(|s| DecisionTree::from_json(s).map_err(|e| e.to_string()));

        match parsed {
            Ok(tree) => {
                *self.tree.write() = Arc::new(tree);
                *loaded = Some(hash);
                log::info!("Reloaded decision tree from {}", path.display());
                ReloadOutcome::Reloaded
            }
            Err(e) => {
                log::warn!(
                    "Decision tree {} invalid, keeping current tree: {}",
                    path.display(),
                    e
                );
                ReloadOutcome::Failed(e)
            }
        }
    }

    pub fn classify(&self, text: &str, ctx: &TurnContext) -> Classification {
        let tree = self.tree();
        let normalized = normalize_text(text);
        let leaf = tree.walk(text, &normalized, ctx);
        let params = leaf.extract(text);

        let missing = missing_params(tree.required_for(&leaf.action), &params);
        let mut result = match missing.first() {
            Some(first) => Classification {
                category: NEEDS_CLARIFICATION.to_string(),
                confidence: leaf.confidence * tree.clarification_penalty,
                params,
                follow_up: Some(
                    leaf.follow_up
                        .clone()
                        .unwrap_or_else(|| format!("What {} should I use?", humanize(first))),
                ),
                pending_action: Some(leaf.action.clone()),
            },
            None => Classification {
                category: leaf.action.clone(),
                confidence: leaf.confidence,
                params,
                follow_up: None,
                pending_action: None,
            },
        };

        if let Some(secondary) = &self.secondary {
            if let Some(guess) = secondary.categorize(text) {
                apply_secondary(&mut result, guess);
            }
        }

        log::debug!(
            "Classified '{}' as {} ({:.2})",
            crate::util::truncate_chars(text, 60),
            result.category,
            result.confidence
        );
        result
    }
}

fn apply_secondary(result: &mut Classification, guess: CategoryGuess) {
    if guess.category == result.category || Some(&guess.category) == result.pending_action.as_ref()
    {
        result.confidence = (result.confidence + AGREEMENT_BOOST).min(1.0);
        return;
    }
    if result.needs_clarification() && guess.confidence >= SECONDARY_MIN {
        log::debug!(
            "Secondary classifier resolved clarification to {}",
            guess.category
        );
        result.category = guess.category;
        result.confidence = guess.confidence.clamp(0.0, 1.0);
        result.pending_action = None;
        result.follow_up = None;
    }
}

fn read_tree(path: &Path) -> Result<(DecisionTree, String), TreeError> {
    let bytes = std::fs::read(path).map_err(|source| TreeError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let tree = DecisionTree::from_json(&String::from_utf8_lossy(&bytes))?;
    Ok((tree, content_hash(&bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::tree::UNKNOWN;
    use crate::types::{EntityRecord, ParamValue};

    struct FixedGuess(&'static str, f64);

    impl SecondaryClassifier for FixedGuess {
        fn categorize(&self, _text: &str) -> Option<CategoryGuess> {
            Some(CategoryGuess {
                category: self.0.to_string(),
                confidence: self.1,
            })
        }
    }

    fn ctx() -> TurnContext {
        TurnContext::for_user("u1")
    }

    #[test]
    fn test_keyword_leaf_is_context_independent() {
        let classifier = IntentClassifier::builtin();
        let plain = classifier.classify("show my daily digest", &ctx());
        let busy = classifier.classify(
            "show my daily digest",
            &ctx()
                .with_flag("workflow_active", true)
                .with_entities("active_tasks", vec![EntityRecord::new("1", "x")]),
        );
        assert_eq!(plain.category, "DIGEST_SHOW");
        assert!((plain.confidence - 0.9).abs() < 1e-9);
        assert_eq!(plain, busy);
    }

    #[test]
    fn test_mark_done_extracts_reference() {
        let result = IntentClassifier::builtin().classify("mark #2 done", &ctx());
        assert_eq!(result.category, "TODO_COMPLETE");
        assert_eq!(result.params.get("task_ref"), Some(&ParamValue::text("#2")));
    }

    #[test]
    fn test_add_task_extracts_title() {
        let result = IntentClassifier::builtin().classify("add a task to buy milk", &ctx());
        assert_eq!(result.category, "TODO_ADD");
        assert_eq!(result.params.get("title"), Some(&ParamValue::text("buy milk")));
    }

    #[test]
    fn test_missing_required_downgrades_to_clarification() {
        let result = IntentClassifier::builtin().classify("write an email", &ctx());
        assert_eq!(result.category, NEEDS_CLARIFICATION);
        assert_eq!(result.pending_action.as_deref(), Some("EMAIL_SEND"));
        assert!((result.confidence - 0.85 * 0.5).abs() < 1e-9);
        assert_eq!(
            result.follow_up.as_deref(),
            Some("Who should I send the email to?")
        );
        assert_eq!(result.effective_action(), "EMAIL_SEND");
    }

    #[test]
    fn test_generic_follow_up_names_first_missing_field() {
        let json = r#"{"requiredParams": {"X": ["due_date"]}, "root": {"action": "X", "confidence": 0.8}}"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tree.json");
        std::fs::write(&path, json).unwrap();
        let result = IntentClassifier::from_path(&path).classify("anything", &ctx());
        assert_eq!(result.follow_up.as_deref(), Some("What due date should I use?"));
    }

    #[test]
    fn test_workflow_prefix_needs_active_flag() {
        let classifier = IntentClassifier::builtin();
        let idle = classifier.classify("approve", &ctx());
        assert_eq!(idle.category, UNKNOWN);
        let active = classifier.classify("approve", &ctx().with_flag("workflow_active", true));
        assert_eq!(active.category, "WORKFLOW_ADVANCE");
        assert_eq!(
            active.params.get("workflow_action"),
            Some(&ParamValue::text("approve"))
        );
    }

    #[test]
    fn test_secondary_agreement_boosts() {
        let classifier =
            IntentClassifier::builtin().with_secondary(Arc::new(FixedGuess("DIGEST_SHOW", 0.5)));
        let result = classifier.classify("digest please", &ctx());
        assert!((result.confidence - 0.95).abs() < 1e-9);
    }

    #[test]
    fn test_secondary_resolves_clarification() {
        let classifier =
            IntentClassifier::builtin().with_secondary(Arc::new(FixedGuess("EMAIL_SEARCH", 0.7)));
        let result = classifier.classify("write an email", &ctx());
        assert_eq!(result.category, "EMAIL_SEARCH");
        assert!(result.pending_action.is_none());
    }

    #[test]
    fn test_tree_wins_on_disagreement() {
        let classifier =
            IntentClassifier::builtin().with_secondary(Arc::new(FixedGuess("HELP", 0.99)));
        let result = classifier.classify("show my digest", &ctx());
        assert_eq!(result.category, "DIGEST_SHOW");
        assert!((result.confidence - 0.9).abs() < 1e-9);

        // Weak secondary does not override clarification
        let weak = IntentClassifier::builtin().with_secondary(Arc::new(FixedGuess("HELP", 0.4)));
        assert_eq!(weak.classify("write an email", &ctx()).category, NEEDS_CLARIFICATION);
    }

    #[test]
    fn test_reload_if_changed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tree.json");
        std::fs::write(&path, r#"{"root": {"action": "HELP", "confidence": 0.9}}"#).unwrap();

        let classifier = IntentClassifier::from_path(&path);
        assert_eq!(classifier.classify("x", &ctx()).category, "HELP");
        assert_eq!(classifier.reload_if_changed(), ReloadOutcome::Unchanged);

        std::fs::write(&path, r#"{"root": {"action": "DIGEST_SHOW", "confidence": 0.9}}"#).unwrap();
        assert_eq!(classifier.reload_if_changed(), ReloadOutcome::Reloaded);
        assert_eq!(classifier.classify("x", &ctx()).category, "DIGEST_SHOW");

        // Broken document keeps the previous tree
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(classifier.reload_if_changed(), ReloadOutcome::Failed(_)));
        assert_eq!(classifier.classify("x", &ctx()).category, "DIGEST_SHOW");

        std::fs::remove_file(&path).unwrap();
        assert!(matches!(classifier.reload_if_changed(), ReloadOutcome::Failed(_)));
        assert_eq!(classifier.classify("x", &ctx()).category, "DIGEST_SHOW");
    }

    #[test]
    fn test_missing_source_uses_builtin() {
        let dir = tempfile::tempdir().unwrap();
        let classifier = IntentClassifier::from_path(dir.path().join("absent.json"));
        assert_eq!(classifier.classify("help", &ctx()).category, "HELP");
    }
}
