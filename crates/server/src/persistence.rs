//! Persistence layer - batched SQLite writes and the handoff outcome ledger
//!
//! Uses `spawn_blocking` for async-safe SQLite access.
//! Lifecycle audit writes are batched; ledger reads and writes are direct
//! because the handoff needs them to be durable before it moves on.

use std::path::PathBuf;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use specstream_protocol::{ExitOutcome, OperationKind, OperationStatus};

use crate::document_store::DocumentTarget;

/// Commands that can be persisted
#[derive(Debug, Clone)]
pub enum PersistCommand {
    /// Record a newly created operation
    OperationCreate {
        id: String,
        kind: OperationKind,
        target: Option<DocumentTarget>,
        created_at: String,
    },

    /// Record a status transition
    OperationStatus {
        id: String,
        status: OperationStatus,
        at: String,
        outcome: Option<ExitOutcome>,
    },

    /// Mark an operation as evicted from the in-memory registry
    OperationEvicted { id: String, at: String },
}

fn connect(db_path: &PathBuf) -> Result<Connection, rusqlite::Error> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(conn)
}

/// Persistence writer that batches SQLite writes
pub struct PersistenceWriter {
    rx: mpsc::Receiver<PersistCommand>,
    db_path: PathBuf,
    batch: Vec<PersistCommand>,
    batch_size: usize,
    flush_interval: Duration,
}

impl PersistenceWriter {
    pub fn new(rx: mpsc::Receiver<PersistCommand>, db_path: PathBuf) -> Self {
        Self {
            rx,
            db_path,
            batch: Vec::with_capacity(100),
            batch_size: 50,
            flush_interval: Duration::from_millis(100),
        }
    }

    /// Run until every sender is dropped, then flush what is left.
    pub async fn run(mut self) {
        info!(
            component = "persistence",
            event = "persistence.writer.started",
            db_path = %self.db_path.display(),
            "PersistenceWriter started"
        );

        let mut interval = tokio::time::interval(self.flush_interval);

        loop {
            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => {
                        self.batch.push(cmd);
                        if self.batch.len() >= self.batch_size {
                            self.flush().await;
                        }
                    }
                    None => {
                        self.flush().await;
                        info!(
                            component = "persistence",
                            event = "persistence.writer.stopped",
                            "Persistence channel closed, writer exiting"
                        );
                        return;
                    }
                },

                _ = interval.tick() => {
                    if !self.batch.is_empty() {
                        self.flush().await;
                    }
                }
            }
        }
    }

    async fn flush(&mut self) {
        if self.batch.is_empty() {
            return;
        }

        let batch = std::mem::take(&mut self.batch);
        let db_path = self.db_path.clone();

        let result = tokio::task::spawn_blocking(move || flush_batch(&db_path, batch)).await;

        match result {
            Ok(Ok(count)) => {
                debug!(
                    component = "persistence",
                    event = "persistence.flushed",
                    count = count,
                    "Persisted commands"
                );
            }
            Ok(Err(e)) => {
                error!(
                    component = "persistence",
                    event = "persistence.flush_failed",
                    error = %e,
                    "Persistence flush failed"
                );
            }
            Err(e) => {
                error!(
                    component = "persistence",
                    event = "persistence.flush_panicked",
                    error = %e,
                    "spawn_blocking panicked"
                );
            }
        }
    }
}

/// Flush a batch of commands to SQLite (runs in blocking thread)
fn flush_batch(db_path: &PathBuf, batch: Vec<PersistCommand>) -> Result<usize, rusqlite::Error> {
    let conn = connect(db_path)?;
    let count = batch.len();
    let tx = conn.unchecked_transaction()?;

    for cmd in batch {
        if let Err(e) = execute_command(&tx, cmd) {
            warn!(
                component = "persistence",
                event = "persistence.command_failed",
                error = %e,
                "Failed to execute command"
            );
        }
    }

    tx.commit()?;
    Ok(count)
}

fn execute_command(conn: &Connection, cmd: PersistCommand) -> Result<(), rusqlite::Error> {
    match cmd {
        PersistCommand::OperationCreate {
            id,
            kind,
            target,
            created_at,
        } => {
            let (repository, branch, path) = match target {
                Some(t) => (Some(t.repository), Some(t.branch), Some(t.path)),
                None => (None, None, None),
            };
            conn.execute(
                "INSERT INTO operations (id, kind, repository, branch, path, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6)
                 ON CONFLICT(id) DO NOTHING",
                params![id, kind.as_str(), repository, branch, path, created_at],
            )?;
        }

        PersistCommand::OperationStatus {
            id,
            status,
            at,
            outcome,
        } => {
            let outcome_json = outcome
                .as_ref()
                .and_then(|o| serde_json::to_string(o).ok());
            match status {
                OperationStatus::Running => {
                    conn.execute(
                        "UPDATE operations SET status = ?2, started_at = ?3 WHERE id = ?1",
                        params![id, status.as_str(), at],
                    )?;
                }
                OperationStatus::Completed | OperationStatus::Failed => {
                    conn.execute(
                        "UPDATE operations SET status = ?2, terminal_at = ?3, exit_outcome = ?4 WHERE id = ?1",
                        params![id, status.as_str(), at, outcome_json],
                    )?;
                }
                OperationStatus::Pending => {
                    conn.execute(
                        "UPDATE operations SET status = ?2 WHERE id = ?1",
                        params![id, status.as_str()],
                    )?;
                }
            }
        }

        PersistCommand::OperationEvicted { id, at } => {
            conn.execute(
                "UPDATE operations SET evicted_at = ?2 WHERE id = ?1",
                params![id, at],
            )?;
        }
    }

    Ok(())
}

/// Create a sender for the persistence writer
pub fn create_persistence_channel() -> (mpsc::Sender<PersistCommand>, mpsc::Receiver<PersistCommand>)
{
    mpsc::channel(1000)
}

// ---------------------------------------------------------------------------
// Outcome ledger
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("ledger task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Final persistence state of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    /// Artifact durably written
    Committed,
    /// Operation failed; nothing to commit
    Failed,
    /// Operation completed but the commit could not be made
    PersistFailed,
}

impl LedgerStatus {
    fn as_str(self) -> &'static str {
        match self {
            LedgerStatus::Committed => "committed",
            LedgerStatus::Failed => "failed",
            LedgerStatus::PersistFailed => "persist_failed",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "committed" => Some(LedgerStatus::Committed),
            "failed" => Some(LedgerStatus::Failed),
            "persist_failed" => Some(LedgerStatus::PersistFailed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerRecord {
    pub operation_id: String,
    pub status: LedgerStatus,
    pub version: Option<String>,
    pub reason: Option<String>,
    pub path: Option<String>,
    pub attempts: u32,
    pub recorded_at: String,
}

/// Durable record of what the persistence handoff did for each operation.
/// Keyed by operation id; a `committed` row is never overwritten.
#[derive(Debug, Clone)]
pub struct OutcomeLedger {
    db_path: PathBuf,
}

impl OutcomeLedger {
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    pub async fn get(&self, operation_id: &str) -> Result<Option<LedgerRecord>, LedgerError> {
        let db_path = self.db_path.clone();
        let operation_id = operation_id.to_string();
        let record = tokio::task::spawn_blocking(move || -> Result<_, rusqlite::Error> {
            let conn = connect(&db_path)?;
            conn.query_row(
                "SELECT operation_id, status, version, reason, path, attempts, recorded_at
                 FROM operation_outcomes WHERE operation_id = ?1",
                params![operation_id],
                |row| {
                    let status: String = row.get(1)?;
                    Ok(LedgerRecord {
                        operation_id: row.get(0)?,
                        status: LedgerStatus::parse(&status).unwrap_or(LedgerStatus::Failed),
                        version: row.get(2)?,
                        reason: row.get(3)?,
                        path: row.get(4)?,
                        attempts: row.get(5)?,
                        recorded_at: row.get(6)?,
                    })
                },
            )
            .optional()
        })
        .await??;
        Ok(record)
    }

    /// Insert or update the row for `record.operation_id`.
    /// Returns `false` when a committed row already exists.
    pub async fn record(&self, record: LedgerRecord) -> Result<bool, LedgerError> {
        let db_path = self.db_path.clone();
        let changed = tokio::task::spawn_blocking(move || -> Result<_, rusqlite::Error> {
            let conn = connect(&db_path)?;
            conn.execute(
                "INSERT INTO operation_outcomes (operation_id, status, version, reason, path, attempts, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(operation_id) DO UPDATE SET
                   status = excluded.status,
                   version = excluded.version,
                   reason = excluded.reason,
                   path = excluded.path,
                   attempts = excluded.attempts,
                   recorded_at = excluded.recorded_at
                 WHERE operation_outcomes.status != 'committed'",
                params![
                    record.operation_id,
                    record.status.as_str(),
                    record.version,
                    record.reason,
                    record.path,
                    record.attempts,
                    record.recorded_at
                ],
            )
        })
        .await??;
        Ok(changed > 0)
    }
}
