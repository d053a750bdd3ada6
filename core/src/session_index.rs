//! Workspace-keyed session metadata in a small SQLite table, used by the
//! `/sessions` listing and resume. Writes are best-effort: failures are
//! logged and never fatal, and the run loop never depends on this table.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use rusqlite::params;
use sable_protocol::SessionId;
use tracing::warn;

use crate::error::Result;
use crate::error::SableErr;

const BUSY_TIMEOUT_MS: u64 = 3_000;

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub session_id: String,
    pub workspace_cwd: String,
    pub last_event_at: String,
    pub event_count: u64,
    pub last_user_message: String,
}

pub struct SessionIndex {
    conn: Mutex<Connection>,
}

impl SessionIndex {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(index_err)?;
        conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS))
            .map_err(index_err)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(index_err)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                workspace_key     TEXT NOT NULL,
                session_id        TEXT NOT NULL,
                workspace_cwd     TEXT NOT NULL,
                app_name          TEXT NOT NULL,
                user_id           TEXT NOT NULL,
                created_at        TEXT NOT NULL DEFAULT (datetime('now')),
                last_event_at     TEXT NOT NULL DEFAULT (datetime('now')),
                event_count       INTEGER NOT NULL DEFAULT 0,
                last_user_message TEXT NOT NULL DEFAULT '',
                PRIMARY KEY (workspace_key, session_id)
            )",
        )
        .map_err(index_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Upsert the per-turn metadata. Best-effort by contract.
    pub fn record_turn(
        &self,
        workspace_key: &str,
        session: &SessionId,
        workspace_cwd: &str,
        last_user_message: &str,
        event_count: u64,
    ) {
        let Ok(conn) = self.conn.lock() else {
            return;
        };
        let outcome = conn.execute(
            "INSERT INTO sessions
                (workspace_key, session_id, workspace_cwd, app_name, user_id,
                 event_count, last_user_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (workspace_key, session_id) DO UPDATE SET
                last_event_at = datetime('now'),
                event_count = excluded.event_count,
                last_user_message = excluded.last_user_message",
            params![
                workspace_key,
                session.id,
                workspace_cwd,
                session.app_name,
                session.user_id,
                event_count,
                last_user_message,
            ],
        );
        if let Err(e) = outcome {
            warn!("session index write failed: {e}");
        }
    }

    /// Sessions for one workspace, most recently active first.
    pub fn list(&self, workspace_key: &str) -> Vec<SessionSummary> {
        let Ok(conn) = self.conn.lock() else {
            return Vec::new();
        };
        let mut stmt = match conn.prepare(
            "SELECT session_id, workspace_cwd, last_event_at, event_count, last_user_message
             FROM sessions WHERE workspace_key = ?1
             ORDER BY last_event_at DESC, session_id",
        ) {
            Ok(stmt) => stmt,
            Err(e) => {
                warn!("session index query failed: {e}");
                return Vec::new();
            }
        };
        let rows = stmt.query_map(params![workspace_key], |row| {
            Ok(SessionSummary {
                session_id: row.get(0)?,
                workspace_cwd: row.get(1)?,
                last_event_at: row.get(2)?,
                event_count: row.get(3)?,
                last_user_message: row.get(4)?,
            })
        });
        match rows {
            Ok(rows) => rows.filter_map(|r| r.ok()).collect(),
            Err(e) => {
                warn!("session index query failed: {e}");
                Vec::new()
            }
        }
    }
}

fn index_err(e: rusqlite::Error) -> SableErr {
    SableErr::StoreWrite(format!("session index: {e}"))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;

    use super::*;

    fn session(id: &str) -> SessionId {
        SessionId::new("sable", "local", id).unwrap()
    }

    #[test]
    fn record_and_list_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let index = SessionIndex::open(&tmp.path().join("index.db")).unwrap();

        index.record_turn("ws-a", &session("s1"), "/tmp/a", "hello there", 4);
        index.record_turn("ws-a", &session("s2"), "/tmp/a", "other session", 2);
        index.record_turn("ws-b", &session("s3"), "/tmp/b", "different workspace", 9);

        let listed = index.list("ws-a");
        assert_eq!(2, listed.len());
        assert!(listed.iter().any(|s| s.session_id == "s1"));
        assert!(!listed.iter().any(|s| s.session_id == "s3"));
    }

    #[test]
    fn upsert_updates_counters() {
        let tmp = tempfile::tempdir().unwrap();
        let index = SessionIndex::open(&tmp.path().join("index.db")).unwrap();

        index.record_turn("ws", &session("s1"), "/tmp", "first", 2);
        index.record_turn("ws", &session("s1"), "/tmp", "second", 6);

        let listed = index.list("ws");
        assert_eq!(1, listed.len());
        assert_eq!(6, listed[0].event_count);
        assert_eq!("second", listed[0].last_user_message);
    }
}
