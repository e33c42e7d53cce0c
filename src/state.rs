//! Configuration loading and the composition root.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::actions::ActionRegistry;
use crate::db::{EngineDb, SqliteStore};
use crate::engine::ConversationEngine;
use crate::error::{ConfigError, EngineError};
use crate::intent::{start_tree_watcher, IntentClassifier};
use crate::providers::ActionExecutor;
use crate::session::SessionStore;
use crate::types::EngineConfig;
use crate::workflow::WorkflowEngine;

/// Canonical config path (`~/.dailyos/assistant.json`).
pub fn config_path() -> Result<PathBuf, ConfigError> {
    let home = dirs::home_dir().ok_or(ConfigError::HomeDirNotFound)?;
    Ok(home.join(".dailyos").join("assistant.json"))
}

/// Load the config, falling back to defaults when the file is missing or
/// unusable.
pub fn load_config() -> EngineConfig {
    let path = match config_path() {
        Ok(p) => p,
        Err(e) => {
            log::warn!("{}; using default assistant config", e);
            return EngineConfig::default();
        }
    };
    if !path.exists() {
        log::debug!("No config at {}; using defaults", path.display());
        return EngineConfig::default();
    }
    match load_config_from(&path) {
        Ok(config) => config,
        Err(e) => {
            log::warn!("{}; using default assistant config", e);
            EngineConfig::default()
        }
    }
}

/// Load and validate a config file.
pub fn load_config_from(path: &Path) -> Result<EngineConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config: EngineConfig = serde_json::from_str(&content)?;
    validate_config(&config).map_err(ConfigError::Invalid)?;
    Ok(config)
}

pub fn validate_config(config: &EngineConfig) -> Result<(), String> {
    if !(0.0..=1.0).contains(&config.confidence_threshold) {
        return Err(format!(
            "confidenceThreshold must be between 0 and 1, got {}",
            config.confidence_threshold
        ));
    }
    if config.awaiting_ttl_secs <= 0 || config.reference_ttl_secs <= 0 {
        return Err("TTLs must be positive".to_string());
    }
    if config.recency_window_secs < 0 || config.recency_bonus < 0.0 {
        return Err("Recency window and bonus cannot be negative".to_string());
    }
    if !(0.0..=100.0).contains(&config.shortlist_score)
        || !(0.0..=100.0).contains(&config.auto_select_score)
    {
        return Err("Resolution scores must be between 0 and 100".to_string());
    }
    if config.shortlist_score > config.auto_select_score {
        return Err(format!(
            "shortlistScore ({}) cannot exceed autoSelectScore ({})",
            config.shortlist_score, config.auto_select_score
        ));
    }
    if config.workflow_max_age_hours <= 0 {
        return Err("workflowMaxAgeHours must be positive".to_string());
    }
    if config.llm_timeout_secs == 0 {
        return Err("llmTimeoutSecs must be positive".to_string());
    }
    Ok(())
}

/// Shared services behind a conversation engine.
pub struct EngineState {
    pub config: EngineConfig,
    pub registry: Arc<ActionRegistry>,
    pub classifier: Arc<IntentClassifier>,
    pub sessions: Arc<SessionStore>,
    pub workflows: Arc<WorkflowEngine>,
}

impl EngineState {
    /// Open the database, load the tree and sweep stale workflows.
    pub fn open(config: EngineConfig) -> Result<Self, EngineError> {
        let db = EngineDb::open_configured(config.db_path.as_deref())?;
        let store = Arc::new(SqliteStore::new(db));

        let classifier = match &config.tree_path {
            Some(path) => IntentClassifier::from_path(path.clone()),
            None => IntentClassifier::builtin(),
        };

        let sessions = SessionStore::new(store.clone())
            .with_ttls(config.awaiting_ttl_secs, config.reference_ttl_secs);
        let workflows = WorkflowEngine::new(store, config.workflow_max_age_hours)?;

        let registry = match &config.actions_path {
            Some(path) => ActionRegistry::load(path).unwrap_or_else(|e| {
                log::warn!("{}; using built-in action schemas", e);
                ActionRegistry::builtin()
            }),
            None => ActionRegistry::builtin(),
        };

        Ok(Self {
            registry: Arc::new(registry),
            classifier: Arc::new(classifier),
            sessions: Arc::new(sessions),
            workflows: Arc::new(workflows),
            config,
        })
    }

    /// `open` with the config from `~/.dailyos/assistant.json`.
    pub fn open_default() -> Result<Self, EngineError> {
        Self::open(load_config())
    }

    /// Start hot-reloading the tree file, if one is configured.
    pub fn watch_tree(&self) -> Option<JoinHandle<()>> {
        start_tree_watcher(Arc::clone(&self.classifier))
    }

    pub fn engine(&self, executor: Arc<dyn ActionExecutor>) -> ConversationEngine {
        ConversationEngine::new(
            self.config.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.classifier),
            Arc::clone(&self.sessions),
            Arc::clone(&self.workflows),
            executor,
        )
    }
}
