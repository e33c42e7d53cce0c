//! Intent classification: a configurable decision tree, hot-reloadable
//! from disk, with an optional secondary categorizer.

mod classifier;
mod embedded;
pub mod tree;
mod watcher;

pub use classifier::{
    CategoryGuess, Classification, IntentClassifier, ReloadOutcome, SecondaryClassifier,
};
pub use embedded::{default_tree, DEFAULT_TREE_JSON};
pub use tree::{DecisionNode, DecisionTree, NEEDS_CLARIFICATION, UNKNOWN};
pub use watcher::start_tree_watcher;
