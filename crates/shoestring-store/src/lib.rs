//! Run checkpoints. The whole pipeline state is one serializable value, so a
//! checkpoint is a single row: the run can be resumed from the last subtask
//! boundary after a crash or an interrupt.

use anyhow::Result;
use chrono::Utc;
use rusqlite::{Connection, params};
use shoestring_core::{RunState, runtime_dir};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const MIGRATIONS: &[(i64, &str)] = &[(
    1,
    "CREATE TABLE IF NOT EXISTS checkpoints (
        session_id TEXT PRIMARY KEY,
        updated_at TEXT NOT NULL,
        user_request TEXT NOT NULL,
        state_json TEXT NOT NULL
     );",
)];

pub fn new_session_id() -> Uuid {
    Uuid::now_v7()
}

pub struct Store {
    pub root: PathBuf,
    db_path: PathBuf,
}

impl Store {
    pub fn new(workspace: &Path) -> Result<Self> {
        let root = runtime_dir(workspace);
        fs::create_dir_all(&root)?;
        let db_path = root.join("store.sqlite");
        let store = Self { root, db_path };
        store.init_db()?;
        Ok(store)
    }

    fn db(&self) -> Result<Connection> {
        Ok(Connection::open(&self.db_path)?)
    }

    fn init_db(&self) -> Result<()> {
        let conn = self.db()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (version INTEGER PRIMARY KEY)",
            [],
        )?;
        let applied: i64 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |r| r.get(0),
        )?;
        for (version, sql) in MIGRATIONS {
            if *version > applied {
                conn.execute_batch(sql)?;
                conn.execute(
                    "INSERT INTO schema_migrations (version) VALUES (?1)",
                    params![version],
                )?;
            }
        }
        Ok(())
    }

    pub fn save_checkpoint(&self, session_id: Uuid, state: &RunState) -> Result<()> {
        let conn = self.db()?;
        conn.execute(
            "INSERT OR REPLACE INTO checkpoints (session_id, updated_at, user_request, state_json)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                session_id.to_string(),
                Utc::now().to_rfc3339(),
                state.user_request,
                serde_json::to_string(state)?,
            ],
        )?;
        Ok(())
    }

    pub fn load_checkpoint(&self, session_id: Uuid) -> Result<Option<RunState>> {
        let conn = self.db()?;
        let mut stmt =
            conn.prepare("SELECT state_json FROM checkpoints WHERE session_id = ?1")?;
        let mut rows = stmt.query([session_id.to_string()])?;
        if let Some(row) = rows.next()? {
            let json: String = row.get(0)?;
            return Ok(Some(serde_json::from_str(&json)?));
        }
        Ok(None)
    }

    /// The most recently touched checkpoint, for `--resume` without an id.
    pub fn latest_checkpoint(&self) -> Result<Option<(Uuid, RunState)>> {
        let conn = self.db()?;
        let mut stmt = conn.prepare(
            "SELECT session_id, state_json FROM checkpoints ORDER BY updated_at DESC LIMIT 1",
        )?;
        let mut rows = stmt.query([])?;
        if let Some(row) = rows.next()? {
            let id = Uuid::parse_str(row.get::<_, String>(0)?.as_str())?;
            let state = serde_json::from_str(&row.get::<_, String>(1)?)?;
            return Ok(Some((id, state)));
        }
        Ok(None)
    }

    /// `(session_id, updated_at, user_request)` rows, newest first.
    pub fn list_sessions(&self) -> Result<Vec<(Uuid, String, String)>> {
        let conn = self.db()?;
        let mut stmt = conn.prepare(
            "SELECT session_id, updated_at, user_request
             FROM checkpoints ORDER BY updated_at DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, updated_at, request) = row?;
            out.push((Uuid::parse_str(&id)?, updated_at, request));
        }
        Ok(out)
    }

    pub fn delete_checkpoint(&self, session_id: Uuid) -> Result<()> {
        let conn = self.db()?;
        conn.execute(
            "DELETE FROM checkpoints WHERE session_id = ?1",
            [session_id.to_string()],
        )?;
        Ok(())
    }
}
