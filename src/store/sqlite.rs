//! SQLite state store.
//!
//! Uses `rusqlite` in synchronous mode behind a mutex. WAL mode is enabled
//! so a second process can read run history while the engine writes.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::errors::StoreError;
use super::StateStore;
use crate::workflow::breaker::{BreakerTransition, CircuitState};
use crate::workflow::types::{RunEvent, RunStatus, RunSummary, StoredEvent};

// ─── Store ───────────────────────────────────────────────────────────────────

pub struct SqliteStateStore {
    conn: Mutex<Connection>,
}

impl SqliteStateStore {
    /// Open (or create) the store at the given path.
    ///
    /// Pass `":memory:"` for a throwaway database.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_tables()?;
        tracing::debug!(path, "state store opened");
        Ok(store)
    }

    fn create_tables(&self) -> Result<(), StoreError> {
        self.conn().execute_batch(
            "
            CREATE TABLE IF NOT EXISTS runs (
                run_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                fingerprint TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS run_transitions (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                at TEXT NOT NULL,
                event TEXT NOT NULL,
                FOREIGN KEY (run_id) REFERENCES runs(run_id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_transitions_run
                ON run_transitions(run_id, seq);

            CREATE TABLE IF NOT EXISTS breaker_transitions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                target TEXT NOT NULL,
                from_state TEXT NOT NULL,
                to_state TEXT NOT NULL,
                consecutive_failures INTEGER NOT NULL,
                at TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl StateStore for SqliteStateStore {
    fn append(&self, run_id: &str, event: &RunEvent) -> Result<StoredEvent, StoreError> {
        let at = Utc::now();
        let at_text = at.to_rfc3339();
        let body = serde_json::to_string(event)?;

        let mut conn = self.conn();
        let tx = conn.transaction()?;

        match event {
            RunEvent::RunCreated {
                definition,
                fingerprint,
            } => {
                tx.execute(
                    "INSERT INTO runs (run_id, name, fingerprint, status, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                    params![
                        run_id,
                        definition.name,
                        fingerprint,
                        RunStatus::Running.as_str(),
                        at_text
                    ],
                )?;
            }
            RunEvent::RunStatusChanged { status, .. } => {
                tx.execute(
                    "UPDATE runs SET status = ?2, updated_at = ?3 WHERE run_id = ?1",
                    params![run_id, status.as_str(), at_text],
                )?;
            }
            RunEvent::StepTransition { .. } => {
                tx.execute(
                    "UPDATE runs SET updated_at = ?2 WHERE run_id = ?1",
                    params![run_id, at_text],
                )?;
            }
        }

        tx.execute(
            "INSERT INTO run_transitions (run_id, at, event) VALUES (?1, ?2, ?3)",
            params![run_id, at_text, body],
        )?;
        let seq = tx.last_insert_rowid();
        tx.commit()?;

        Ok(StoredEvent {
            seq: seq as u64,
            run_id: run_id.to_string(),
            at,
            event: event.clone(),
        })
    }

    fn load(&self, run_id: &str) -> Result<Vec<StoredEvent>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT seq, at, event FROM run_transitions
             WHERE run_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (seq, at, body) = row?;
            events.push(StoredEvent {
                seq: seq as u64,
                run_id: run_id.to_string(),
                at: parse_time(&at)?,
                event: serde_json::from_str(&body)?,
            });
        }
        Ok(events)
    }

    fn list_runs(&self) -> Result<Vec<RunSummary>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT run_id, name, status, created_at, updated_at FROM runs
             ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut runs = Vec::new();
        for row in rows {
            let (run_id, name, status, created_at, updated_at) = row?;
            let status = RunStatus::parse(&status).ok_or_else(|| StoreError::Serialization {
                reason: format!("unknown run status '{status}' for run {run_id}"),
            })?;
            runs.push(RunSummary {
                run_id,
                name,
                status,
                created_at: parse_time(&created_at)?,
                updated_at: parse_time(&updated_at)?,
            });
        }
        Ok(runs)
    }

    fn purge(&self, run_id: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let existed = tx
            .query_row(
                "SELECT 1 FROM runs WHERE run_id = ?1",
                params![run_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        tx.execute(
            "DELETE FROM run_transitions WHERE run_id = ?1",
            params![run_id],
        )?;
        tx.execute("DELETE FROM runs WHERE run_id = ?1", params![run_id])?;
        tx.commit()?;
        Ok(existed)
    }

    fn append_breaker(&self, transition: &BreakerTransition) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO breaker_transitions
                (target, from_state, to_state, consecutive_failures, at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                transition.target,
                transition.from.as_str(),
                transition.to.as_str(),
                transition.consecutive_failures,
                transition.at.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    fn load_breakers(&self) -> Result<Vec<BreakerTransition>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT target, from_state, to_state, consecutive_failures, at
             FROM breaker_transitions ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, u32>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut transitions = Vec::new();
        for row in rows {
            let (target, from, to, consecutive_failures, at) = row?;
            transitions.push(BreakerTransition {
                target,
                from: parse_circuit(&from)?,
                to: parse_circuit(&to)?,
                consecutive_failures,
                at: parse_time(&at)?,
            });
        }
        Ok(transitions)
    }
}

fn parse_time(text: &str) -> Result<DateTime<Utc>, StoreError> {
    Ok(DateTime::parse_from_rfc3339(text)?.with_timezone(&Utc))
}

fn parse_circuit(text: &str) -> Result<CircuitState, StoreError> {
    CircuitState::parse(text).ok_or_else(|| StoreError::Serialization {
        reason: format!("unknown circuit state '{text}'"),
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
