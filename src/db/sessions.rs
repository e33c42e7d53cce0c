use rusqlite::{params, OptionalExtension};

use super::*;

impl EngineDb {
    // =========================================================================
    // User sessions
    // =========================================================================

    /// Fetch the session blob for a user, if any.
    pub fn get_session_row(&self, user_id: &str) -> Result<Option<DbSessionRow>, DbError> {
        let row = self
            .conn
            .query_row(
                "SELECT user_id, state_json, updated_at FROM user_sessions WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok(DbSessionRow {
                        user_id: row.get(0)?,
                        state_json: row.get(1)?,
                        updated_at: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Insert or overwrite the session blob for a user. Last write wins.
    pub fn upsert_session_row(
        &self,
        user_id: &str,
        state_json: &str,
        updated_at: &str,
    ) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO user_sessions (user_id, state_json, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id) DO UPDATE SET
                state_json = excluded.state_json,
                updated_at = excluded.updated_at",
            params![user_id, state_json, updated_at],
        )?;
        Ok(())
    }

    /// Remove a user's session row entirely.
    pub fn delete_session_row(&self, user_id: &str) -> Result<bool, DbError> {
        let changed = self
            .conn
            .execute("DELETE FROM user_sessions WHERE user_id = ?1", params![user_id])?;
        Ok(changed > 0)
    }
}
