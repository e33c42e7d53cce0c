//! Per-user conversational memory.
//!
//! Each user has one JSON blob holding the outstanding awaiting state, the
//! last auto-selected entity per context key, and the last list shown per
//! context key. Every entry carries an absolute expiry; expired entries are
//! dropped when read.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::db::SqliteStore;
use crate::error::EngineError;
use crate::types::{AwaitingKind, EngineConfig, EntityRecord, Params, TurnContext};
use crate::util::{format_timestamp, Clock, SystemClock};

// ---------------------------------------------------------------------------
// Stored shapes
// ---------------------------------------------------------------------------

/// An outstanding clarification question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwaitingState {
    pub user_id: String,
    pub kind: AwaitingKind,
    /// Intent the pending action belongs to.
    pub intent: String,
    #[serde(default)]
    pub params: Params,
    #[serde(default)]
    pub missing: Vec<String>,
    #[serde(default)]
    pub context: TurnContext,
    /// Candidates shown for an ambiguity, in display order.
    #[serde(default)]
    pub options: Vec<EntityRecord>,
    /// The parameter an ambiguity is about.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
    /// The question the user was asked, repeated if the reply doesn't fit.
    #[serde(default)]
    pub question: String,
    /// Extraction confidence when the question was asked.
    #[serde(default)]
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl AwaitingState {
    /// A fresh state; timestamps are stamped by `SessionStore::set_awaiting`.
    pub fn new(user_id: &str, kind: AwaitingKind, intent: &str) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.to_string(),
            kind,
            intent: intent.to_string(),
            params: Params::new(),
            missing: Vec::new(),
            context: TurnContext::for_user(user_id),
            options: Vec::new(),
            param: None,
            question: String::new(),
            confidence: 0.0,
            created_at: now,
            expires_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredReference {
    entity: EntityRecord,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DisplayedList {
    items: Vec<EntityRecord>,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    awaiting: Option<AwaitingState>,
    #[serde(default)]
    references: BTreeMap<String, StoredReference>,
    #[serde(default)]
    displayed: BTreeMap<String, DisplayedList>,
}

impl SessionState {
    /// Drop expired entries. Returns true if anything was removed.
    fn prune(&mut self, now: DateTime<Utc>) -> bool {
        let before = (
            self.awaiting.is_some(),
            self.references.len(),
            self.displayed.len(),
        );
        if self.awaiting.as_ref().is_some_and(|a| a.expires_at <= now) {
            self.awaiting = None;
        }
        self.references.retain(|_, r| r.expires_at > now);
        self.displayed.retain(|_, d| d.expires_at > now);
        before
            != (
                self.awaiting.is_some(),
                self.references.len(),
                self.displayed.len(),
            )
    }

    fn is_empty(&self) -> bool {
        self.awaiting.is_none() && self.references.is_empty() && self.displayed.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

/// Raw blob storage for session state, one row per user.
pub trait SessionBackend: Send + Sync {
    fn load(&self, user_id: &str) -> Result<Option<String>, EngineError>;
    fn save(&self, user_id: &str, state_json: &str, updated_at: &str) -> Result<(), EngineError>;
    fn delete(&self, user_id: &str) -> Result<(), EngineError>;
}

impl SessionBackend for SqliteStore {
    fn load(&self, user_id: &str) -> Result<Option<String>, EngineError> {
        let row = self.with_db(|db| db.get_session_row(user_id))?;
        Ok(row.map(|r| r.state_json))
    }

    fn save(&self, user_id: &str, state_json: &str, updated_at: &str) -> Result<(), EngineError> {
        self.with_db(|db| db.upsert_session_row(user_id, state_json, updated_at))?;
        Ok(())
    }

    fn delete(&self, user_id: &str) -> Result<(), EngineError> {
        self.with_db(|db| db.delete_session_row(user_id))?;
        Ok(())
    }
}

/// In-process backend for tests and ephemeral hosts.
#[derive(Debug, Default)]
pub struct MemorySessions {
    rows: DashMap<String, String>,
}

impl MemorySessions {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionBackend for MemorySessions {
    fn load(&self, user_id: &str) -> Result<Option<String>, EngineError> {
        Ok(self.rows.get(user_id).map(|r| r.value().clone()))
    }

    fn save(&self, user_id: &str, state_json: &str, _updated_at: &str) -> Result<(), EngineError> {
        self.rows.insert(user_id.to_string(), state_json.to_string());
        Ok(())
    }

    fn delete(&self, user_id: &str) -> Result<(), EngineError> {
        self.rows.remove(user_id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct SessionStore {
    backend: Arc<dyn SessionBackend>,
    clock: Arc<dyn Clock>,
    awaiting_ttl: Duration,
    reference_ttl: Duration,
    /// Serializes read-modify-write cycles within this process.
    write_lock: Mutex<()>,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn SessionBackend>) -> Self {
        let config = EngineConfig::default();
        Self {
            backend,
            clock: Arc::new(SystemClock),
            awaiting_ttl: Duration::seconds(config.awaiting_ttl_secs),
            reference_ttl: Duration::seconds(config.reference_ttl_secs),
            write_lock: Mutex::new(()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_ttls(mut self, awaiting_secs: i64, reference_secs: i64) -> Self {
        self.awaiting_ttl = Duration::seconds(awaiting_secs);
        self.reference_ttl = Duration::seconds(reference_secs);
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // -- awaiting ---------------------------------------------------------

    /// Replace the user's awaiting state, stamping created/expiry times.
    pub fn set_awaiting(&self, mut state: AwaitingState) -> Result<(), EngineError> {
        let now = self.clock.now();
        state.created_at = now;
        state.expires_at = now + self.awaiting_ttl;
        let user_id = state.user_id.clone();
        log::debug!("Awaiting {} for {} ({})", state.kind, user_id, state.intent);
        self.update(&user_id, move |s| s.awaiting = Some(state))
    }

    pub fn get_awaiting(&self, user_id: &str) -> Result<Option<AwaitingState>, EngineError> {
        Ok(self.read(user_id)?.awaiting)
    }

    pub fn clear_awaiting(&self, user_id: &str) -> Result<(), EngineError> {
        self.update(user_id, |s| s.awaiting = None)
    }

    // -- references -------------------------------------------------------

    /// Remember the entity last auto-selected for `key`.
    pub fn store_reference(&self, user_id: &str, key: &str, entity: &EntityRecord) -> Result<(), EngineError> {
        let stored = StoredReference {
            entity: entity.clone(),
            expires_at: self.clock.now() + self.reference_ttl,
        };
        self.update(user_id, |s| {
            s.references.insert(key.to_string(), stored);
        })
    }

    pub fn get_reference(&self, user_id: &str, key: &str) -> Result<Option<EntityRecord>, EngineError> {
        Ok(self.read(user_id)?.references.remove(key).map(|r| r.entity))
    }

    /// Remember the list most recently shown to the user for `key`, in
    /// display order.
    pub fn store_displayed_list(
        &self,
        user_id: &str,
        key: &str,
        items: &[EntityRecord],
    ) -> Result<(), EngineError> {
        let list = DisplayedList {
            items: items.to_vec(),
            expires_at: self.clock.now() + self.reference_ttl,
        };
        self.update(user_id, |s| {
            s.displayed.insert(key.to_string(), list);
        })
    }

    pub fn get_displayed_list(&self, user_id: &str, key: &str) -> Result<Option<Vec<EntityRecord>>, EngineError> {
        Ok(self.read(user_id)?.displayed.remove(key).map(|d| d.items))
    }

    // -- internals --------------------------------------------------------

    fn load_state(&self, user_id: &str) -> Result<SessionState, EngineError> {
        let Some(json) = self.backend.load(user_id)? else {
            return Ok(SessionState::default());
        };
        match serde_json::from_str(&json) {
            Ok(state) => Ok(state),
            Err(e) => {
                log::warn!("Discarding unreadable session state for {}: {}", user_id, e);
                Ok(SessionState::default())
            }
        }
    }

    fn save_state(&self, user_id: &str, state: &SessionState) -> Result<(), EngineError> {
        if state.is_empty() {
            return self.backend.delete(user_id);
        }
        let json = serde_json::to_string(state)?;
        self.backend
            .save(user_id, &json, &format_timestamp(self.clock.now()))
    }

    /// Load, prune, and write back if pruning removed anything.
    fn read(&self, user_id: &str) -> Result<SessionState, EngineError> {
        let _guard = self.write_lock.lock();
        let mut state = self.load_state(user_id)?;
        if state.prune(self.clock.now()) {
            self.save_state(user_id, &state)?;
        }
        Ok(state)
    }

    fn update(&self, user_id: &str, f: impl FnOnce(&mut SessionState)) -> Result<(), EngineError> {
        let _guard = self.write_lock.lock();
        let mut state = self.load_state(user_id)?;
        state.prune(self.clock.now());
        f(&mut state);
        self.save_state(user_id, &state)
    }
}
