use serde::{Deserialize, Serialize};

/// Errors specific to database operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Schema migration failed: {0}")]
    Migration(String),

    /// A stored JSON blob or timestamp could not be decoded.
    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

/// A row from the `user_sessions` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbSessionRow {
    pub user_id: String,
    pub state_json: String,
    pub updated_at: String,
}

/// A row from the `workflows` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbWorkflow {
    pub id: String,
    pub user_id: String,
    pub workflow_type: String,
    pub state: String,
    pub context_json: String,
    pub history_json: String,
    pub created_at: String,
    pub updated_at: String,
}
