//! Built-in decision tree, compiled into the binary.

use super::tree::DecisionTree;

pub const DEFAULT_TREE_JSON: &str = include_str!("../../config/decision_tree.json");

/// Parse the built-in tree. Falls back to a single default leaf if the
/// embedded document is somehow unusable.
pub fn default_tree() -> DecisionTree {
    match DecisionTree::from_json(DEFAULT_TREE_JSON) {
        Ok(tree) => tree,
        Err(e) => {
            log::warn!("Built-in decision tree failed to load: {}", e);
            DecisionTree::fallback()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::ActionRegistry;

    #[test]
    fn test_default_tree_parses() {
        assert!(DecisionTree::from_json(DEFAULT_TREE_JSON).is_ok());
    }

    #[test]
    fn test_every_tree_action_has_a_schema() {
        let tree = default_tree();
        let registry = ActionRegistry::builtin();
        for action in tree.actions() {
            if action == crate::intent::tree::UNKNOWN {
                continue;
            }
            assert!(registry.contains(action), "no schema for tree action {}", action);
        }
    }
}
