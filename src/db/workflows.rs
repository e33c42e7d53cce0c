use rusqlite::{params, OptionalExtension, Row};

use super::*;

/// States that take a workflow out of the live set.
pub const TERMINAL_STATES: [&str; 3] = ["completed", "cancelled", "failed"];

/// `state NOT IN ('completed', ...)`, built from `TERMINAL_STATES`.
fn live_state_filter() -> String {
    let quoted: Vec<String> = TERMINAL_STATES.iter().map(|s| format!("'{}'", s)).collect();
    format!("state NOT IN ({})", quoted.join(", "))
}

impl EngineDb {
    // =========================================================================
    // Workflows
    // =========================================================================

    fn map_workflow_row(row: &Row) -> rusqlite::Result<DbWorkflow> {
        Ok(DbWorkflow {
            id: row.get(0)?,
            user_id: row.get(1)?,
            workflow_type: row.get(2)?,
            state: row.get(3)?,
            context_json: row.get(4)?,
            history_json: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    /// Insert or update a workflow row keyed by id.
    pub fn upsert_workflow(&self, wf: &DbWorkflow) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO workflows
                (id, user_id, workflow_type, state, context_json, history_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                state = excluded.state,
                context_json = excluded.context_json,
                history_json = excluded.history_json,
                updated_at = excluded.updated_at",
            params![
                wf.id,
                wf.user_id,
                wf.workflow_type,
                wf.state,
                wf.context_json,
                wf.history_json,
                wf.created_at,
                wf.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_workflow(&self, id: &str) -> Result<Option<DbWorkflow>, DbError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, user_id, workflow_type, state, context_json, history_json,
                        created_at, updated_at
                 FROM workflows WHERE id = ?1",
                params![id],
                Self::map_workflow_row,
            )
            .optional()?;
        Ok(row)
    }

    /// The user's non-terminal workflow, newest first if the invariant was
    /// ever violated by a racing writer.
    pub fn get_active_workflow(&self, user_id: &str) -> Result<Option<DbWorkflow>, DbError> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT id, user_id, workflow_type, state, context_json, history_json,
                            created_at, updated_at
                     FROM workflows
                     WHERE user_id = ?1
                       AND {}
                     ORDER BY updated_at DESC
                     LIMIT 1",
                    live_state_filter()
                ),
                params![user_id],
                Self::map_workflow_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Non-terminal workflows whose `updated_at` is older than `cutoff` (RFC 3339).
    pub fn get_stale_workflows(&self, cutoff: &str) -> Result<Vec<DbWorkflow>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT id, user_id, workflow_type, state, context_json, history_json,
                    created_at, updated_at
             FROM workflows
             WHERE {}
               AND updated_at < ?1",
            live_state_filter()
        ))?;
        let rows = stmt.query_map(params![cutoff], Self::map_workflow_row)?;
        let mut workflows = Vec::new();
        for row in rows {
            workflows.push(row?);
        }
        Ok(workflows)
    }

    /// Every workflow a user has run, newest first (audit trail).
    pub fn get_user_workflows(&self, user_id: &str) -> Result<Vec<DbWorkflow>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, workflow_type, state, context_json, history_json,
                    created_at, updated_at
             FROM workflows
             WHERE user_id = ?1
             ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map(params![user_id], Self::map_workflow_row)?;
        let mut workflows = Vec::new();
        for row in rows {
            workflows.push(row?);
        }
        Ok(workflows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::test_db;

    fn sample(id: &str, user: &str, state: &str, updated_at: &str) -> DbWorkflow {
        DbWorkflow {
            id: id.to_string(),
            user_id: user.to_string(),
            workflow_type: "email_compose".to_string(),
            state: state.to_string(),
            context_json: "{}".to_string(),
            history_json: "[]".to_string(),
            created_at: "2026-01-01T00:00:00+00:00".to_string(),
            updated_at: updated_at.to_string(),
        }
    }

    #[test]
    fn test_terminal_rows_leave_live_set() {
        let db = test_db();
        db.upsert_workflow(&sample("wf-1", "u1", "drafting", "2026-01-01T00:00:00+00:00"))
            .unwrap();
        assert!(db.get_active_workflow("u1").unwrap().is_some());

        db.upsert_workflow(&sample("wf-1", "u1", "completed", "2026-01-01T00:05:00+00:00"))
            .unwrap();
        assert!(db.get_active_workflow("u1").unwrap().is_none());
        // Record persists for audit
        let kept = db.get_workflow("wf-1").unwrap().unwrap();
        assert_eq!(kept.state, "completed");
        assert_eq!(db.get_user_workflows("u1").unwrap().len(), 1);
    }

    #[test]
    fn test_stale_query_skips_terminal_and_fresh() {
        let db = test_db();
        db.upsert_workflow(&sample("old", "u1", "drafting", "2026-01-01T00:00:00+00:00"))
            .unwrap();
        db.upsert_workflow(&sample("done", "u2", "failed", "2026-01-01T00:00:00+00:00"))
            .unwrap();
        db.upsert_workflow(&sample("fresh", "u3", "reviewing", "2026-01-03T00:00:00+00:00"))
            .unwrap();
        let stale = db.get_stale_workflows("2026-01-02T00:00:00+00:00").unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, "old");
    }

    #[test]
    fn test_every_terminal_state_leaves_live_set() {
        assert_eq!(
            live_state_filter(),
            "state NOT IN ('completed', 'cancelled', 'failed')"
        );
        let db = test_db();
        for (i, state) in TERMINAL_STATES.iter().enumerate() {
            let user = format!("u{}", i);
            db.upsert_workflow(&sample(&format!("wf-{}", i), &user, state, "2026-01-01T00:00:00+00:00"))
                .unwrap();
            assert!(db.get_active_workflow(&user).unwrap().is_none(), "{}", state);
        }
        assert!(db.get_stale_workflows("2026-02-01T00:00:00+00:00").unwrap().is_empty());
    }
}
