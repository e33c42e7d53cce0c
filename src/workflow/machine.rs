use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde_json::{Map, Value};

use super::transitions::{initial_state, next_state, normalize_action};
use super::{ActiveWorkflow, StepEntry, WorkflowType};
use crate::db::{DbError, DbWorkflow, SqliteStore};
use crate::error::EngineError;
use crate::util::{format_timestamp, parse_timestamp, Clock, SystemClock};

/// Persistent store for workflows.
pub trait WorkflowBackend: Send + Sync {
    fn save(&self, workflow: &ActiveWorkflow) -> Result<(), EngineError>;
    fn load(&self, id: &str) -> Result<Option<ActiveWorkflow>, EngineError>;
    fn load_active(&self, user_id: &str) -> Result<Option<ActiveWorkflow>, EngineError>;
    /// Non-terminal workflows last updated before `cutoff`.
    fn load_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<ActiveWorkflow>, EngineError>;
    /// Every workflow the user has run, newest first.
    fn load_for_user(&self, user_id: &str) -> Result<Vec<ActiveWorkflow>, EngineError>;
}

// ---------------------------------------------------------------------------
// SQLite backend
// ---------------------------------------------------------------------------

fn to_row(wf: &ActiveWorkflow) -> Result<DbWorkflow, EngineError> {
    Ok(DbWorkflow {
        id: wf.id.clone(),
        user_id: wf.user_id.clone(),
        workflow_type: wf.workflow_type.to_string(),
        state: wf.state.to_string(),
        context_json: serde_json::to_string(&wf.context)?,
        history_json: serde_json::to_string(&wf.history)?,
        created_at: format_timestamp(wf.created_at),
        updated_at: format_timestamp(wf.updated_at),
    })
}

fn from_row(row: DbWorkflow) -> Result<ActiveWorkflow, EngineError> {
    let corrupt = |what: &str| DbError::Corrupt(format!("workflow {}: bad {}", row.id, what));
    Ok(ActiveWorkflow {
        workflow_type: row.workflow_type.parse().map_err(|_| corrupt("type"))?,
        state: row.state.parse().map_err(|_| corrupt("state"))?,
        context: serde_json::from_str(&row.context_json)?,
        history: serde_json::from_str(&row.history_json)?,
        created_at: parse_timestamp(&row.created_at).ok_or_else(|| corrupt("created_at"))?,
        updated_at: parse_timestamp(&row.updated_at).ok_or_else(|| corrupt("updated_at"))?,
        id: row.id,
        user_id: row.user_id,
    })
}

impl WorkflowBackend for SqliteStore {
    fn save(&self, workflow: &ActiveWorkflow) -> Result<(), EngineError> {
        let row = to_row(workflow)?;
        self.with_db(|db| db.upsert_workflow(&row))?;
        Ok(())
    }

    fn load(&self, id: &str) -> Result<Option<ActiveWorkflow>, EngineError> {
        self.with_db(|db| db.get_workflow(id))?
            .map(from_row)
            .transpose()
    }

    fn load_active(&self, user_id: &str) -> Result<Option<ActiveWorkflow>, EngineError> {
        self.with_db(|db| db.get_active_workflow(user_id))?
            .map(from_row)
            .transpose()
    }

    fn load_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<ActiveWorkflow>, EngineError> {
        let cutoff = format_timestamp(cutoff);
        self.with_db(|db| db.get_stale_workflows(&cutoff))?
            .into_iter()
            .map(from_row)
            .collect()
    }

    fn load_for_user(&self, user_id: &str) -> Result<Vec<ActiveWorkflow>, EngineError> {
        self.with_db(|db| db.get_user_workflows(user_id))?
            .into_iter()
            .map(from_row)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryWorkflows {
    rows: DashMap<String, ActiveWorkflow>,
}

impl MemoryWorkflows {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorkflowBackend for MemoryWorkflows {
    fn save(&self, workflow: &ActiveWorkflow) -> Result<(), EngineError> {
        self.rows.insert(workflow.id.clone(), workflow.clone());
        Ok(())
    }

    fn load(&self, id: &str) -> Result<Option<ActiveWorkflow>, EngineError> {
        Ok(self.rows.get(id).map(|r| r.value().clone()))
    }

    fn load_active(&self, user_id: &str) -> Result<Option<ActiveWorkflow>, EngineError> {
        Ok(self
            .rows
            .iter()
            .filter(|r| r.user_id == user_id && !r.state.is_terminal())
            .max_by_key(|r| r.updated_at)
            .map(|r| r.value().clone()))
    }

    fn load_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<ActiveWorkflow>, EngineError> {
        Ok(self
            .rows
            .iter()
            .filter(|r| !r.state.is_terminal() && r.updated_at < cutoff)
            .map(|r| r.value().clone())
            .collect())
    }

    fn load_for_user(&self, user_id: &str) -> Result<Vec<ActiveWorkflow>, EngineError> {
        let mut rows: Vec<ActiveWorkflow> = self
            .rows
            .iter()
            .filter(|r| r.user_id == user_id)
            .map(|r| r.value().clone())
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct WorkflowEngine {
    backend: Arc<dyn WorkflowBackend>,
    clock: Arc<dyn Clock>,
    max_age: Duration,
}

impl WorkflowEngine {
    /// Build the engine and fail any workflow idle longer than
    /// `max_age_hours`.
    pub fn new(backend: Arc<dyn WorkflowBackend>, max_age_hours: i64) -> Result<Self, EngineError> {
        Self::with_clock(backend, Arc::new(SystemClock), max_age_hours)
    }

    pub fn with_clock(
        backend: Arc<dyn WorkflowBackend>,
        clock: Arc<dyn Clock>,
        max_age_hours: i64,
    ) -> Result<Self, EngineError> {
        let engine = Self {
            backend,
            clock,
            max_age: Duration::hours(max_age_hours),
        };
        let swept = engine.sweep_stale()?;
        if swept > 0 {
            log::info!("Failed {} stale workflow(s) at startup", swept);
        }
        Ok(engine)
    }

    /// Start a workflow, cancelling any workflow the user already has open.
    pub fn start(
        &self,
        user_id: &str,
        workflow_type: WorkflowType,
        context: Map<String, Value>,
    ) -> Result<ActiveWorkflow, EngineError> {
        if let Some(previous) = self.backend.load_active(user_id)? {
            log::info!(
                "Cancelling {} workflow {} for {}: superseded",
                previous.workflow_type,
                previous.id,
                user_id
            );
            self.apply(previous, "cancel", Some(reason("superseded by a new workflow")))?;
        }

        let now = self.clock.now();
        let workflow = ActiveWorkflow {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            workflow_type,
            state: initial_state(workflow_type),
            context,
            history: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        self.backend.save(&workflow)?;
        log::info!("Started {} workflow {} for {}", workflow_type, workflow.id, user_id);
        Ok(workflow)
    }

    /// Apply `action` to the user's active workflow.
    ///
    /// Returns `None` when the user has no active workflow. An action the
    /// current state doesn't accept is logged and the workflow is returned
    /// unchanged.
    pub fn advance(
        &self,
        user_id: &str,
        action: &str,
        data: Option<Value>,
    ) -> Result<Option<ActiveWorkflow>, EngineError> {
        match self.backend.load_active(user_id)? {
            Some(workflow) => self.apply(workflow, action, data).map(Some),
            None => Ok(None),
        }
    }

    pub fn cancel(&self, user_id: &str, why: &str) -> Result<Option<ActiveWorkflow>, EngineError> {
        self.advance(user_id, "cancel", Some(reason(why)))
    }

    pub fn get_active(&self, user_id: &str) -> Result<Option<ActiveWorkflow>, EngineError> {
        self.backend.load_active(user_id)
    }

    pub fn get(&self, id: &str) -> Result<Option<ActiveWorkflow>, EngineError> {
        self.backend.load(id)
    }

    /// Finished and live workflows for a user, newest first.
    pub fn history(&self, user_id: &str) -> Result<Vec<ActiveWorkflow>, EngineError> {
        self.backend.load_for_user(user_id)
    }

    /// Move every workflow idle past the max age to `failed`.
    pub fn sweep_stale(&self) -> Result<usize, EngineError> {
        let cutoff = self.clock.now() - self.max_age;
        let stale = self.backend.load_stale(cutoff)?;
        let count = stale.len();
        for workflow in stale {
            log::warn!(
                "Workflow {} ({}) idle since {}; marking failed",
                workflow.id,
                workflow.workflow_type,
                workflow.updated_at
            );
            self.apply(workflow, "fail", Some(reason("stale")))?;
        }
        Ok(count)
    }

    fn apply(
        &self,
        mut workflow: ActiveWorkflow,
        action: &str,
        data: Option<Value>,
    ) -> Result<ActiveWorkflow, EngineError> {
        let action = normalize_action(action);
        let Some(to) = next_state(workflow.workflow_type, workflow.state, &action) else {
            log::warn!(
                "Invalid transition for {} workflow {}: '{}' from {}",
                workflow.workflow_type,
                workflow.id,
                action,
                workflow.state
            );
            return Ok(workflow);
        };

        let now = self.clock.now();
        if let Some(Value::Object(fields)) = &data {
            for (k, v) in fields {
                workflow.context.insert(k.clone(), v.clone());
            }
        }
        workflow.history.push(StepEntry {
            from: workflow.state,
            action: action.clone(),
            to,
            at: now,
            data,
        });
        log::debug!(
            "Workflow {}: {} -{}-> {}",
            workflow.id,
            workflow.state,
            action,
            to
        );
        workflow.state = to;
        workflow.updated_at = now;
        self.backend.save(&workflow)?;
        Ok(workflow)
    }
}

fn reason(why: &str) -> Value {
    serde_json::json!({ "reason": why })
}
