//! Persistence handoff - commits a completed operation's artifact exactly once.
//!
//! The registry emits one `TerminalEvent` per operation. A worker picks each
//! event up and either commits the artifact (completed) or records the failure
//! (failed). Observers play no part here: an operation with nobody watching
//! commits the same way as one with a dozen clients attached.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use specstream_protocol::OperationStatus;

use crate::document_store::{DocumentStore, StoreError, Version};
use crate::persistence::{LedgerError, LedgerRecord, LedgerStatus, OutcomeLedger};
use crate::registry::{format_time, OperationRegistry, RegistryError, TerminalEvent};

#[derive(Debug, Clone)]
pub struct HandoffConfig {
    /// Re-reads of the target version after a conflict
    pub max_conflict_retries: u32,
    /// Retries after transient store failures
    pub max_transient_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            max_conflict_retries: 3,
            max_transient_retries: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("commit failed after {attempts} attempt(s): {reason}")]
    PersistFailed { attempts: u32, reason: String },
    #[error("operation has no document target")]
    NoTarget,
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum HandoffOutcome {
    Committed { version: Version, attempts: u32 },
    AlreadyCommitted { version: Version },
    FailureRecorded { reason: String },
}

pub struct PersistenceHandoff {
    store: Arc<dyn DocumentStore>,
    ledger: OutcomeLedger,
    registry: Arc<OperationRegistry>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    config: HandoffConfig,
}

impl PersistenceHandoff {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        ledger: OutcomeLedger,
        registry: Arc<OperationRegistry>,
        config: HandoffConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            registry,
            locks: DashMap::new(),
            config,
        }
    }

    /// Consume terminal events until the registry's sender is dropped or
    /// `shutdown` flips to true. On shutdown, events already queued are
    /// still handled and the worker waits for in-flight handoffs.
    pub fn spawn(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<TerminalEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut tasks = JoinSet::new();
            let mut shutdown_open = true;
            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Some(event) => {
                            let handoff = self.clone();
                            tasks.spawn(async move { handoff.handle(event).await });
                        }
                        None => break,
                    },
                    changed = shutdown.changed(), if shutdown_open => match changed {
                        Ok(()) if *shutdown.borrow() => {
                            while let Ok(event) = rx.try_recv() {
                                let handoff = self.clone();
                                tasks.spawn(async move { handoff.handle(event).await });
                            }
                            break;
                        }
                        Ok(()) => {}
                        Err(_) => shutdown_open = false,
                    },
                }
                while tasks.try_join_next().is_some() {}
            }

            let pending = tasks.len();
            while tasks.join_next().await.is_some() {}
            info!(
                component = "handoff",
                event = "handoff.worker.stopped",
                drained = pending,
                "Persistence handoff stopped"
            );
        })
    }

    pub async fn handle(&self, event: TerminalEvent) {
        let result = match event.status {
            OperationStatus::Completed => self.commit_once(&event).await,
            _ => self.record_failure(&event).await,
        };
        if let Err(e) = result {
            error!(
                component = "handoff",
                event = "handoff.failed",
                operation_id = %event.operation_id,
                error = %e,
                "Persistence handoff failed"
            );
        }
    }

    /// Commit the artifact of a completed operation.
    ///
    /// Safe to call any number of times, concurrently or not: the store sees
    /// at most one successful commit per operation.
    pub async fn commit_once(&self, event: &TerminalEvent) -> Result<HandoffOutcome, HandoffError> {
        let lock = self
            .locks
            .entry(event.operation_id.clone())
            .or_default()
            .clone();
        let result = {
            let _guard = lock.lock().await;
            self.commit_locked(event).await
        };

        // The ledger row is final now; later callers find it there
        drop(lock);
        self.locks
            .remove_if(&event.operation_id, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    async fn commit_locked(&self, event: &TerminalEvent) -> Result<HandoffOutcome, HandoffError> {
        if let Some(record) = self.ledger.get(&event.operation_id).await? {
            if record.status == LedgerStatus::Committed {
                let version = Version(record.version.unwrap_or_default());
                return Ok(HandoffOutcome::AlreadyCommitted { version });
            }
        }

        let Some(target) = event.target.as_ref() else {
            self.persist_failed(event, 0, "operation has no document target")
                .await?;
            return Err(HandoffError::NoTarget);
        };
        let artifact = match event.artifact.as_deref() {
            Some(content) if !content.trim().is_empty() => content,
            _ => {
                let reason = "agent produced no document content";
                self.persist_failed(event, 0, reason).await?;
                return Err(HandoffError::PersistFailed {
                    attempts: 0,
                    reason: reason.to_string(),
                });
            }
        };
        let message = format!(
            "Add {} ({})",
            event.kind.document_file(),
            event.operation_id
        );

        let mut attempts = 0u32;
        let mut conflicts = 0u32;
        let mut transients = 0u32;
        let mut backoff = self.config.initial_backoff;

        let failure = loop {
            attempts += 1;
            let attempt = match self.store.head(target).await {
                // A previous attempt landed but its response was lost
                Ok(Some(head)) if head.content.as_deref() == Some(artifact) => {
                    info!(
                        component = "handoff",
                        event = "handoff.already_present",
                        operation_id = %event.operation_id,
                        target = %target,
                        version = %head.version,
                        "Artifact already in the store, skipping write"
                    );
                    Ok(head.version)
                }
                Ok(current) => {
                    let expected = current.as_ref().map(|head| &head.version);
                    self.store
                        .commit(target, artifact, expected, &message)
                        .await
                }
                Err(e) => Err(e),
            };

            match attempt {
                Ok(version) => {
                    self.ledger
                        .record(LedgerRecord {
                            operation_id: event.operation_id.clone(),
                            status: LedgerStatus::Committed,
                            version: Some(version.0.clone()),
                            reason: None,
                            path: Some(target.path.clone()),
                            attempts,
                            recorded_at: format_time(Utc::now()),
                        })
                        .await?;
                    ignore_gone(
                        self.registry
                            .mark_committed(&event.operation_id, &version.0)
                            .await,
                    );
                    info!(
                        component = "handoff",
                        event = "handoff.committed",
                        operation_id = %event.operation_id,
                        target = %target,
                        version = %version,
                        attempts = attempts,
                        "Artifact committed"
                    );
                    return Ok(HandoffOutcome::Committed { version, attempts });
                }
                Err(StoreError::Conflict { path }) => {
                    conflicts += 1;
                    warn!(
                        component = "handoff",
                        event = "handoff.conflict",
                        operation_id = %event.operation_id,
                        path = %path,
                        conflicts = conflicts,
                        "Version conflict, re-reading target"
                    );
                    if conflicts > self.config.max_conflict_retries {
                        break format!("version conflict on {path} persisted after {conflicts} attempts");
                    }
                }
                Err(StoreError::Transient(reason)) => {
                    transients += 1;
                    warn!(
                        component = "handoff",
                        event = "handoff.transient",
                        operation_id = %event.operation_id,
                        error = %reason,
                        backoff_ms = backoff.as_millis() as u64,
                        "Transient store failure"
                    );
                    if transients > self.config.max_transient_retries {
                        break reason;
                    }
                    tokio::time::sleep(backoff).await;
                    backoff = next_backoff(backoff, self.config.max_backoff);
                }
                Err(StoreError::Rejected(reason)) => break reason,
            }
        };

        self.persist_failed(event, attempts, &failure).await?;
        Err(HandoffError::PersistFailed {
            attempts,
            reason: failure,
        })
    }

    async fn persist_failed(
        &self,
        event: &TerminalEvent,
        attempts: u32,
        reason: &str,
    ) -> Result<(), HandoffError> {
        error!(
            component = "handoff",
            event = "handoff.persist_failed",
            operation_id = %event.operation_id,
            attempts = attempts,
            reason = %reason,
            "Artifact could not be committed"
        );
        self.ledger
            .record(LedgerRecord {
                operation_id: event.operation_id.clone(),
                status: LedgerStatus::PersistFailed,
                version: None,
                reason: Some(reason.to_string()),
                path: event.target.as_ref().map(|t| t.path.clone()),
                attempts,
                recorded_at: format_time(Utc::now()),
            })
            .await?;
        ignore_gone(
            self.registry
                .record_persist_failure(&event.operation_id, reason)
                .await,
        );
        Ok(())
    }

    /// Failed operations never reach the store; only their reason is kept.
    pub async fn record_failure(&self, event: &TerminalEvent) -> Result<HandoffOutcome, HandoffError> {
        let reason = event.outcome.summary();
        self.ledger
            .record(LedgerRecord {
                operation_id: event.operation_id.clone(),
                status: LedgerStatus::Failed,
                version: None,
                reason: Some(reason.clone()),
                path: event.target.as_ref().map(|t| t.path.clone()),
                attempts: 0,
                recorded_at: format_time(Utc::now()),
            })
            .await?;
        info!(
            component = "handoff",
            event = "handoff.failure_recorded",
            operation_id = %event.operation_id,
            reason = %reason,
            "Failed operation recorded"
        );
        Ok(HandoffOutcome::FailureRecorded { reason })
    }

    /// Ledger row for an operation, if the handoff has seen it
    pub async fn outcome(&self, operation_id: &str) -> Result<Option<LedgerRecord>, HandoffError> {
        Ok(self.ledger.get(operation_id).await?)
    }
}

/// Double `current`, saturating at `max`
fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.checked_mul(2).unwrap_or(max).min(max)
}

/// The operation may already be evicted; the ledger is the durable record.
fn ignore_gone(result: Result<(), RegistryError>) {
    if let Err(e) = result {
        if !matches!(e, RegistryError::NotFound(_) | RegistryError::Evicted(_)) {
            warn!(
                component = "handoff",
                event = "handoff.registry_update_failed",
                error = %e,
                "Could not update registry with persistence result"
            );
        }
    }
}
