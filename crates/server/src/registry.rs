//! Operation registry: lifecycle and message log for every operation.
//!
//! `append` is the single serialization point per operation: it holds the
//! operation's write lock while it assigns the sequence, stores the message
//! and pushes it to the broadcaster. `subscribe` takes the read lock to
//! snapshot the log and attach an observer in one step, so a subscriber sees
//! every message exactly once: older ones through replay, newer ones live.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use specstream_protocol::{
    new_id, ExitOutcome, MessageMetadata, MessageType, OperationKind, OperationStatus,
    OperationSummary, Sender, StreamMessage,
};

use crate::broadcaster::{Broadcaster, ObserverQueue};
use crate::document_store::DocumentTarget;
use crate::persistence::PersistCommand;

/// Per-message content cap
pub const MAX_CONTENT_BYTES: usize = 10 * 1024;

#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Oldest messages are pruned once a log grows past this
    pub max_log_messages: usize,
    /// How long a terminal operation stays replayable
    pub retention: Duration,
    /// How long an evicted id keeps answering `RangeExpired`
    pub tombstone_ttl: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_log_messages: 1000,
            retention: Duration::from_secs(10 * 60),
            tombstone_ttl: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("operation {0} already exists")]
    DuplicateOperation(String),
    #[error("operation {0} not found")]
    NotFound(String),
    #[error("operation {0} was evicted after its retention window")]
    Evicted(String),
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition {
        from: OperationStatus,
        to: OperationStatus,
    },
    #[error("sequence {requested} is no longer retained (oldest retained: {oldest_retained:?})")]
    RangeExpired {
        requested: u64,
        oldest_retained: Option<u64>,
    },
    #[error("operation is {0}, no more messages accepted")]
    Closed(OperationStatus),
    #[error("operation is {0}, only terminal operations can be evicted")]
    NotTerminal(OperationStatus),
}

/// A classified line waiting for a sequence number
#[derive(Debug, Clone, PartialEq)]
pub struct TypedLine {
    pub message_type: MessageType,
    pub content: String,
    pub sender: Sender,
    pub extra: Map<String, Value>,
}

impl TypedLine {
    pub fn agent(message_type: MessageType, content: impl Into<String>) -> Self {
        Self {
            message_type,
            content: content.into(),
            sender: Sender::Agent,
            extra: Map::new(),
        }
    }

    pub fn system(message_type: MessageType, content: impl Into<String>) -> Self {
        Self {
            message_type,
            content: content.into(),
            sender: Sender::System,
            extra: Map::new(),
        }
    }

    pub fn with_extra(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }
}

/// Emitted once per operation when it reaches a terminal state
#[derive(Debug, Clone)]
pub struct TerminalEvent {
    pub operation_id: String,
    pub kind: OperationKind,
    pub status: OperationStatus,
    pub outcome: ExitOutcome,
    pub target: Option<DocumentTarget>,
    pub artifact: Option<String>,
}

/// Result of attaching an observer
#[derive(Debug)]
pub struct Subscription {
    pub replay: Vec<StreamMessage>,
    pub status: OperationStatus,
    pub latest_sequence: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryStats {
    pub operations: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub retained_messages: usize,
    pub tombstones: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub evicted: Vec<String>,
    pub tombstones_pruned: usize,
}

struct OperationState {
    status: OperationStatus,
    started_at: Option<DateTime<Utc>>,
    terminal_at: Option<DateTime<Utc>>,
    exit_outcome: Option<ExitOutcome>,
    log: VecDeque<StreamMessage>,
    next_sequence: u64,
    artifact: Option<String>,
    artifact_committed: bool,
    artifact_version: Option<String>,
    persist_failure: Option<String>,
}

impl OperationState {
    fn new() -> Self {
        Self {
            status: OperationStatus::Pending,
            started_at: None,
            terminal_at: None,
            exit_outcome: None,
            log: VecDeque::new(),
            next_sequence: 0,
            artifact: None,
            artifact_committed: false,
            artifact_version: None,
            persist_failure: None,
        }
    }

    fn oldest_retained(&self) -> u64 {
        self.log
            .front()
            .map_or(self.next_sequence, |message| message.sequence)
    }

    fn latest_sequence(&self) -> Option<u64> {
        self.next_sequence.checked_sub(1)
    }

    /// Messages after `from_exclusive`, or the whole log when `None`.
    fn messages_after(&self, from_exclusive: Option<u64>) -> Result<Vec<StreamMessage>, RegistryError> {
        let start = from_exclusive.map_or(0, |seq| seq.saturating_add(1));
        let oldest = self.oldest_retained();
        if start < oldest {
            return Err(RegistryError::RangeExpired {
                requested: start,
                oldest_retained: Some(oldest),
            });
        }
        Ok(self
            .log
            .iter()
            .filter(|message| message.sequence >= start)
            .cloned()
            .collect())
    }
}

struct OperationEntry {
    id: String,
    kind: OperationKind,
    target: Option<DocumentTarget>,
    created_at: DateTime<Utc>,
    state: RwLock<OperationState>,
}

impl OperationEntry {
    fn summary(&self, state: &OperationState) -> OperationSummary {
        OperationSummary {
            operation_id: self.id.clone(),
            kind: self.kind,
            status: state.status,
            created_at: format_time(self.created_at),
            started_at: state.started_at.map(format_time),
            terminal_at: state.terminal_at.map(format_time),
            exit_outcome: state.exit_outcome.clone(),
            message_count: state.log.len(),
            oldest_sequence: state.log.front().map(|m| m.sequence),
            latest_sequence: state.latest_sequence(),
            artifact_committed: state.artifact_committed,
            artifact_version: state.artifact_version.clone(),
            persist_failure: state.persist_failure.clone(),
        }
    }
}

pub fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn is_legal(from: OperationStatus, to: OperationStatus) -> bool {
    matches!(
        (from, to),
        (OperationStatus::Pending, OperationStatus::Running)
            | (OperationStatus::Running, OperationStatus::Completed)
            | (OperationStatus::Running, OperationStatus::Failed)
    )
}

/// Cut `content` to at most `max` bytes on a char boundary.
pub fn truncate_content(content: &mut String, max: usize) -> bool {
    if content.len() <= max {
        return false;
    }
    let mut cut = max;
    while !content.is_char_boundary(cut) {
        cut -= 1;
    }
    content.truncate(cut);
    true
}

pub struct OperationRegistry {
    operations: DashMap<String, Arc<OperationEntry>>,
    tombstones: DashMap<String, DateTime<Utc>>,
    broadcaster: Arc<Broadcaster>,
    terminal_tx: mpsc::UnboundedSender<TerminalEvent>,
    persist_tx: Option<mpsc::Sender<PersistCommand>>,
    config: RetentionConfig,
}

impl OperationRegistry {
    pub fn new(
        config: RetentionConfig,
        broadcaster: Arc<Broadcaster>,
        terminal_tx: mpsc::UnboundedSender<TerminalEvent>,
    ) -> Self {
        Self {
            operations: DashMap::new(),
            tombstones: DashMap::new(),
            broadcaster,
            terminal_tx,
            persist_tx: None,
            config,
        }
    }

    /// Record lifecycle changes in the audit table
    pub fn with_persistence(mut self, persist_tx: mpsc::Sender<PersistCommand>) -> Self {
        self.persist_tx = Some(persist_tx);
        self
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    pub fn config(&self) -> &RetentionConfig {
        &self.config
    }

    fn persist(&self, cmd: PersistCommand) {
        if let Some(tx) = &self.persist_tx {
            if let Err(e) = tx.try_send(cmd) {
                warn!(
                    component = "registry",
                    event = "registry.persist.dropped",
                    error = %e,
                    "Persistence channel unavailable, audit record dropped"
                );
            }
        }
    }

    fn lookup(&self, operation_id: &str) -> Result<Arc<OperationEntry>, RegistryError> {
        if let Some(entry) = self.operations.get(operation_id) {
            return Ok(entry.value().clone());
        }
        if self.tombstones.contains_key(operation_id) {
            Err(RegistryError::Evicted(operation_id.to_string()))
        } else {
            Err(RegistryError::NotFound(operation_id.to_string()))
        }
    }

    /// Register a new operation in `pending` state.
    pub fn create(
        &self,
        operation_id: &str,
        kind: OperationKind,
        target: Option<DocumentTarget>,
    ) -> Result<OperationSummary, RegistryError> {
        if self.tombstones.contains_key(operation_id) {
            return Err(RegistryError::DuplicateOperation(operation_id.to_string()));
        }

        let entry = Arc::new(OperationEntry {
            id: operation_id.to_string(),
            kind,
            target,
            created_at: Utc::now(),
            state: RwLock::new(OperationState::new()),
        });
        match self.operations.entry(operation_id.to_string()) {
            Entry::Occupied(_) => {
                return Err(RegistryError::DuplicateOperation(operation_id.to_string()))
            }
            Entry::Vacant(slot) => {
                slot.insert(entry.clone());
            }
        }

        info!(
            component = "registry",
            event = "operation.created",
            operation_id = %operation_id,
            kind = kind.as_str(),
            "Operation created"
        );
        self.persist(PersistCommand::OperationCreate {
            id: operation_id.to_string(),
            kind,
            target: entry.target.clone(),
            created_at: format_time(entry.created_at),
        });

        Ok(entry.summary(&OperationState::new()))
    }

    /// Move an operation along `pending → running → {completed, failed}`.
    ///
    /// Terminal transitions record `outcome` and notify the persistence
    /// handoff. Final messages must be appended before this call.
    pub async fn transition(
        &self,
        operation_id: &str,
        to: OperationStatus,
        outcome: Option<ExitOutcome>,
    ) -> Result<OperationSummary, RegistryError> {
        let entry = self.lookup(operation_id)?;
        let mut state = entry.state.write().await;
        self.transition_locked(&entry, &mut state, to, outcome)?;
        Ok(entry.summary(&state))
    }

    fn transition_locked(
        &self,
        entry: &OperationEntry,
        state: &mut OperationState,
        to: OperationStatus,
        outcome: Option<ExitOutcome>,
    ) -> Result<(), RegistryError> {
        let from = state.status;
        if !is_legal(from, to) {
            return Err(RegistryError::IllegalTransition { from, to });
        }

        let now = Utc::now();
        state.status = to;
        match to {
            OperationStatus::Running => state.started_at = Some(now),
            OperationStatus::Completed | OperationStatus::Failed => {
                let outcome = outcome.unwrap_or_else(|| match to {
                    OperationStatus::Completed => ExitOutcome::Success { exit_code: 0 },
                    _ => ExitOutcome::Aborted {
                        reason: "no outcome recorded".to_string(),
                    },
                });
                state.terminal_at = Some(now);
                state.exit_outcome = Some(outcome.clone());

                let event = TerminalEvent {
                    operation_id: entry.id.clone(),
                    kind: entry.kind,
                    status: to,
                    outcome,
                    target: entry.target.clone(),
                    artifact: if to == OperationStatus::Completed {
                        state.artifact.clone()
                    } else {
                        None
                    },
                };
                if self.terminal_tx.send(event).is_err() {
                    warn!(
                        component = "registry",
                        event = "operation.terminal.unobserved",
                        operation_id = %entry.id,
                        "Persistence handoff is not running, terminal event dropped"
                    );
                }
            }
            OperationStatus::Pending => {}
        }

        info!(
            component = "registry",
            event = "operation.transition",
            operation_id = %entry.id,
            from = from.as_str(),
            to = to.as_str(),
            "Operation status changed"
        );
        self.persist(PersistCommand::OperationStatus {
            id: entry.id.clone(),
            status: to,
            at: format_time(now),
            outcome: state.exit_outcome.clone(),
        });
        Ok(())
    }

    /// Append a message and fan it out. Assigns the next sequence.
    pub async fn append(
        &self,
        operation_id: &str,
        line: TypedLine,
    ) -> Result<StreamMessage, RegistryError> {
        let entry = self.lookup(operation_id)?;
        let mut state = entry.state.write().await;
        if state.status.is_terminal() {
            return Err(RegistryError::Closed(state.status));
        }
        Ok(self.append_locked(&entry, &mut state, line))
    }

    fn append_locked(
        &self,
        entry: &OperationEntry,
        state: &mut OperationState,
        line: TypedLine,
    ) -> StreamMessage {
        let TypedLine {
            message_type,
            mut content,
            sender,
            extra,
        } = line;

        let mut metadata = MessageMetadata::for_type(message_type);
        metadata.truncated = truncate_content(&mut content, MAX_CONTENT_BYTES);
        metadata.extra = extra;

        let message = StreamMessage {
            id: new_id(),
            operation_id: entry.id.clone(),
            sequence: state.next_sequence,
            message_type,
            content,
            sender,
            timestamp: format_time(Utc::now()),
            metadata,
        };
        state.next_sequence += 1;
        state.log.push_back(message.clone());
        while state.log.len() > self.config.max_log_messages.max(1) {
            state.log.pop_front();
        }

        self.broadcaster.publish(&message);
        message
    }

    /// Retained messages after `from_exclusive` (the whole log when `None`).
    pub async fn snapshot(
        &self,
        operation_id: &str,
        from_exclusive: Option<u64>,
    ) -> Result<Vec<StreamMessage>, RegistryError> {
        let entry = self.lookup(operation_id).map_err(|e| expired_range(e, from_exclusive))?;
        let state = entry.state.read().await;
        state.messages_after(from_exclusive)
    }

    /// Snapshot and attach `queue` atomically with respect to `append`.
    pub async fn subscribe(
        &self,
        operation_id: &str,
        from_exclusive: Option<u64>,
        connection_id: u64,
        queue: Arc<ObserverQueue>,
    ) -> Result<Subscription, RegistryError> {
        let entry = self.lookup(operation_id).map_err(|e| expired_range(e, from_exclusive))?;
        self.attach_entry(&entry, from_exclusive, connection_id, queue)
            .await
    }

    async fn attach_entry(
        &self,
        entry: &Arc<OperationEntry>,
        from_exclusive: Option<u64>,
        connection_id: u64,
        queue: Arc<ObserverQueue>,
    ) -> Result<Subscription, RegistryError> {
        let state = entry.state.read().await;
        // Eviction removes the entry under its write lock
        if !self.is_current(entry) {
            return Err(expired_range(
                RegistryError::Evicted(entry.id.clone()),
                from_exclusive,
            ));
        }
        let replay = state.messages_after(from_exclusive)?;
        self.broadcaster.attach(&entry.id, connection_id, queue);
        Ok(Subscription {
            replay,
            status: state.status,
            latest_sequence: state.latest_sequence(),
        })
    }

    fn is_current(&self, entry: &Arc<OperationEntry>) -> bool {
        self.operations
            .get(&entry.id)
            .is_some_and(|current| Arc::ptr_eq(current.value(), entry))
    }

    pub fn unsubscribe(&self, operation_id: &str, connection_id: u64) -> bool {
        self.broadcaster.detach(operation_id, connection_id)
    }

    /// Artifact to commit when the operation completes
    pub async fn set_artifact(&self, operation_id: &str, artifact: String) -> Result<(), RegistryError> {
        let entry = self.lookup(operation_id)?;
        let mut state = entry.state.write().await;
        if state.status.is_terminal() {
            return Err(RegistryError::Closed(state.status));
        }
        state.artifact = Some(artifact);
        Ok(())
    }

    pub async fn mark_committed(&self, operation_id: &str, version: &str) -> Result<(), RegistryError> {
        let entry = self.lookup(operation_id)?;
        let mut state = entry.state.write().await;
        state.artifact_committed = true;
        state.artifact_version = Some(version.to_string());
        state.persist_failure = None;
        Ok(())
    }

    pub async fn record_persist_failure(&self, operation_id: &str, reason: &str) -> Result<(), RegistryError> {
        let entry = self.lookup(operation_id)?;
        let mut state = entry.state.write().await;
        state.persist_failure = Some(reason.to_string());
        Ok(())
    }

    /// Forcibly fail a non-terminal operation: appends `error` then
    /// `complete` and transitions to `failed`.
    pub async fn abort(&self, operation_id: &str, reason: &str) -> Result<OperationSummary, RegistryError> {
        let entry = self.lookup(operation_id)?;
        let mut state = entry.state.write().await;
        if state.status.is_terminal() {
            return Err(RegistryError::IllegalTransition {
                from: state.status,
                to: OperationStatus::Failed,
            });
        }
        if state.status == OperationStatus::Pending {
            self.transition_locked(&entry, &mut state, OperationStatus::Running, None)?;
        }

        self.append_locked(
            &entry,
            &mut state,
            TypedLine::system(MessageType::Error, format!("Operation aborted: {reason}")),
        );
        self.append_locked(
            &entry,
            &mut state,
            TypedLine::system(
                MessageType::Complete,
                format!("{} generation failed.", capitalize(entry.kind.label())),
            )
            .with_extra("success", false),
        );
        self.transition_locked(
            &entry,
            &mut state,
            OperationStatus::Failed,
            Some(ExitOutcome::Aborted {
                reason: reason.to_string(),
            }),
        )?;
        Ok(entry.summary(&state))
    }

    /// Remove a terminal operation and leave a tombstone behind.
    pub async fn evict(&self, operation_id: &str) -> Result<(), RegistryError> {
        let entry = self.lookup(operation_id)?;
        // Held until observers are detached so no subscribe slips in between
        let state = entry.state.write().await;
        if !state.status.is_terminal() {
            return Err(RegistryError::NotTerminal(state.status));
        }
        if !self.is_current(&entry) {
            return Err(RegistryError::Evicted(operation_id.to_string()));
        }

        self.operations.remove(operation_id);
        self.tombstones.insert(operation_id.to_string(), Utc::now());
        let detached = self.broadcaster.detach_all(operation_id);
        drop(state);
        info!(
            component = "registry",
            event = "operation.evicted",
            operation_id = %operation_id,
            detached_observers = detached,
            "Operation evicted"
        );
        self.persist(PersistCommand::OperationEvicted {
            id: operation_id.to_string(),
            at: format_time(Utc::now()),
        });
        Ok(())
    }

    /// Evict terminal operations whose retention window has passed.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let retention = chrono::Duration::from_std(self.config.retention)
            .unwrap_or_else(|_| chrono::Duration::minutes(10));
        let tombstone_ttl = chrono::Duration::from_std(self.config.tombstone_ttl)
            .unwrap_or_else(|_| chrono::Duration::hours(1));

        let entries: Vec<Arc<OperationEntry>> = self
            .operations
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let mut report = SweepReport::default();
        for entry in entries {
            let expired = {
                let state = entry.state.read().await;
                state
                    .terminal_at
                    .is_some_and(|terminal_at| terminal_at + retention <= now)
            };
            if expired && self.evict(&entry.id).await.is_ok() {
                report.evicted.push(entry.id.clone());
            }
        }

        let before = self.tombstones.len();
        self.tombstones
            .retain(|_, evicted_at| *evicted_at + tombstone_ttl > now);
        report.tombstones_pruned = before.saturating_sub(self.tombstones.len());

        if !report.evicted.is_empty() || report.tombstones_pruned > 0 {
            info!(
                component = "registry",
                event = "registry.sweep",
                evicted = report.evicted.len(),
                tombstones_pruned = report.tombstones_pruned,
                "Retention sweep finished"
            );
        }
        report
    }

    /// Run `sweep` every `interval` until the registry is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let registry = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    debug!(
                        component = "registry",
                        event = "registry.sweeper.stopped",
                        "Registry dropped, sweeper exiting"
                    );
                    return;
                };
                registry.sweep(Utc::now()).await;
            }
        })
    }

    pub async fn summary(&self, operation_id: &str) -> Result<OperationSummary, RegistryError> {
        let entry = self.lookup(operation_id)?;
        let state = entry.state.read().await;
        Ok(entry.summary(&state))
    }

    pub async fn list(&self) -> Vec<OperationSummary> {
        let entries: Vec<Arc<OperationEntry>> = self
            .operations
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let mut summaries = Vec::with_capacity(entries.len());
        for entry in entries {
            let state = entry.state.read().await;
            summaries.push(entry.summary(&state));
        }
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        summaries
    }

    /// Ids of operations that have not reached a terminal state
    pub async fn active_ids(&self) -> Vec<String> {
        self.list()
            .await
            .into_iter()
            .filter(|summary| !summary.status.is_terminal())
            .map(|summary| summary.operation_id)
            .collect()
    }

    pub async fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            tombstones: self.tombstones.len(),
            ..RegistryStats::default()
        };
        for summary in self.list().await {
            stats.operations += 1;
            stats.retained_messages += summary.message_count;
            match summary.status {
                OperationStatus::Pending => stats.pending += 1,
                OperationStatus::Running => stats.running += 1,
                OperationStatus::Completed => stats.completed += 1,
                OperationStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }
}

/// Replay against an evicted operation is a range failure, not a lookup one.
fn expired_range(err: RegistryError, from_exclusive: Option<u64>) -> RegistryError {
    match err {
        RegistryError::Evicted(_) => RegistryError::RangeExpired {
            requested: from_exclusive.map_or(0, |seq| seq.saturating_add(1)),
            oldest_retained: None,
        },
        other => other,
    }
}

pub fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn registry_with(
        config: RetentionConfig,
    ) -> (Arc<OperationRegistry>, mpsc::UnboundedReceiver<TerminalEvent>) {
        let (terminal_tx, terminal_rx) = mpsc::unbounded_channel();
        let broadcaster = Arc::new(Broadcaster::new(100));
        (
            Arc::new(OperationRegistry::new(config, broadcaster, terminal_tx)),
            terminal_rx,
        )
    }

    fn registry() -> (Arc<OperationRegistry>, mpsc::UnboundedReceiver<TerminalEvent>) {
        registry_with(RetentionConfig::default())
    }

    async fn running(registry: &OperationRegistry, id: &str) {
        registry
            .create(id, OperationKind::GenerateSpec, None)
            .expect("create");
        registry
            .transition(id, OperationStatus::Running, None)
            .await
            .expect("running");
    }

    fn sequences(messages: &[StreamMessage]) -> Vec<u64> {
        messages.iter().map(|m| m.sequence).collect()
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let (registry, _rx) = registry();
        registry
            .create("op-1", OperationKind::GenerateSpec, None)
            .expect("create");
        let err = registry
            .create("op-1", OperationKind::GeneratePlan, None)
            .expect_err("duplicate");
        assert_eq!(err, RegistryError::DuplicateOperation("op-1".into()));
    }

    #[tokio::test]
    async fn only_the_legal_state_graph_is_accepted() {
        let (registry, _rx) = registry();
        registry
            .create("op-1", OperationKind::GenerateSpec, None)
            .expect("create");

        let err = registry
            .transition("op-1", OperationStatus::Completed, None)
            .await
            .expect_err("pending -> completed");
        assert_eq!(
            err,
            RegistryError::IllegalTransition {
                from: OperationStatus::Pending,
                to: OperationStatus::Completed
            }
        );

        registry
            .transition("op-1", OperationStatus::Running, None)
            .await
            .expect("running");
        registry
            .transition("op-1", OperationStatus::Failed, None)
            .await
            .expect("failed");
        assert!(registry
            .transition("op-1", OperationStatus::Running, None)
            .await
            .is_err());
        assert!(registry
            .transition("op-1", OperationStatus::Completed, None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn sequences_are_dense_under_concurrent_appends() {
        let (registry, _rx) = registry();
        running(&registry, "op-1").await;

        let mut tasks = Vec::new();
        for worker in 0..8 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..25 {
                    registry
                        .append(
                            "op-1",
                            TypedLine::agent(MessageType::Execution, format!("{worker}-{i}")),
                        )
                        .await
                        .expect("append");
                }
            }));
        }
        for task in tasks {
            task.await.expect("append task");
        }

        let log = registry.snapshot("op-1", None).await.expect("snapshot");
        assert_eq!(sequences(&log), (0..200).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn snapshot_returns_messages_after_cursor() {
        let (registry, _rx) = registry();
        running(&registry, "op-1").await;
        for i in 0..5 {
            registry
                .append("op-1", TypedLine::agent(MessageType::Execution, format!("line {i}")))
                .await
                .expect("append");
        }

        let replay = registry.snapshot("op-1", Some(2)).await.expect("snapshot");
        assert_eq!(sequences(&replay), vec![3, 4]);
        assert!(registry
            .snapshot("op-1", Some(4))
            .await
            .expect("caught up")
            .is_empty());
        assert!(registry
            .snapshot("op-1", Some(40))
            .await
            .expect("ahead")
            .is_empty());
    }

    #[tokio::test]
    async fn count_retention_expires_old_ranges() {
        let (registry, _rx) = registry_with(RetentionConfig {
            max_log_messages: 3,
            ..RetentionConfig::default()
        });
        running(&registry, "op-1").await;
        for i in 0..6 {
            registry
                .append("op-1", TypedLine::agent(MessageType::Execution, format!("line {i}")))
                .await
                .expect("append");
        }

        assert_eq!(
            sequences(&registry.snapshot("op-1", Some(2)).await.expect("in window")),
            vec![3, 4, 5]
        );
        let err = registry
            .snapshot("op-1", Some(0))
            .await
            .expect_err("pruned range");
        assert_eq!(
            err,
            RegistryError::RangeExpired {
                requested: 1,
                oldest_retained: Some(3)
            }
        );
        assert!(matches!(
            registry.snapshot("op-1", None).await,
            Err(RegistryError::RangeExpired { requested: 0, .. })
        ));
    }

    #[tokio::test]
    async fn oversized_content_is_truncated_on_char_boundary() {
        let (registry, _rx) = registry();
        running(&registry, "op-1").await;
        let content = "é".repeat(MAX_CONTENT_BYTES);
        let message = registry
            .append("op-1", TypedLine::agent(MessageType::Execution, content))
            .await
            .expect("append");
        assert!(message.content.len() <= MAX_CONTENT_BYTES);
        assert!(message.metadata.truncated);
        assert!(message.content.chars().all(|c| c == 'é'));
    }

    #[tokio::test]
    async fn terminal_operations_reject_appends_and_emit_one_event() {
        let (registry, mut rx) = registry();
        running(&registry, "op-1").await;
        registry
            .set_artifact("op-1", "# Spec".into())
            .await
            .expect("artifact");
        registry
            .append("op-1", TypedLine::system(MessageType::Complete, "done"))
            .await
            .expect("complete");
        registry
            .transition(
                "op-1",
                OperationStatus::Completed,
                Some(ExitOutcome::Success { exit_code: 0 }),
            )
            .await
            .expect("completed");

        let err = registry
            .append("op-1", TypedLine::agent(MessageType::Execution, "late"))
            .await
            .expect_err("closed");
        assert_eq!(err, RegistryError::Closed(OperationStatus::Completed));

        let event = rx.recv().await.expect("terminal event");
        assert_eq!(event.operation_id, "op-1");
        assert_eq!(event.status, OperationStatus::Completed);
        assert_eq!(event.artifact.as_deref(), Some("# Spec"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn subscribe_replays_then_delivers_live_without_overlap() {
        let (registry, _rx) = registry();
        running(&registry, "op-1").await;
        for i in 0..3 {
            registry
                .append("op-1", TypedLine::agent(MessageType::Thinking, format!("t{i}")))
                .await
                .expect("append");
        }

        let queue = registry.broadcaster().new_queue();
        let subscription = registry
            .subscribe("op-1", None, 1, queue.clone())
            .await
            .expect("subscribe");
        assert_eq!(sequences(&subscription.replay), vec![0, 1, 2]);
        assert_eq!(subscription.latest_sequence, Some(2));

        registry
            .append("op-1", TypedLine::agent(MessageType::Execution, "live"))
            .await
            .expect("append");
        let live = queue.try_recv().expect("live message");
        assert_eq!(live.sequence, 3);
        assert!(queue.try_recv().is_none());
    }

    #[tokio::test]
    async fn abort_appends_error_then_complete() {
        let (registry, mut rx) = registry();
        registry
            .create("op-1", OperationKind::GeneratePlan, None)
            .expect("create");
        let summary = registry.abort("op-1", "server shutdown").await.expect("abort");
        assert_eq!(summary.status, OperationStatus::Failed);

        let log = registry.snapshot("op-1", None).await.expect("snapshot");
        let types: Vec<MessageType> = log.iter().map(|m| m.message_type).collect();
        assert_eq!(types, vec![MessageType::Error, MessageType::Complete]);
        assert_eq!(log[1].metadata.extra["success"], false);

        let event = rx.recv().await.expect("terminal event");
        assert_eq!(event.status, OperationStatus::Failed);
        assert!(event.artifact.is_none());
    }

    #[tokio::test]
    async fn sweep_evicts_expired_terminal_operations_only() {
        let (registry, _rx) = registry_with(RetentionConfig {
            retention: Duration::from_secs(60),
            ..RetentionConfig::default()
        });
        running(&registry, "done").await;
        registry
            .transition("done", OperationStatus::Completed, None)
            .await
            .expect("completed");
        running(&registry, "busy").await;

        let report = registry.sweep(Utc::now()).await;
        assert!(report.evicted.is_empty());

        let later = Utc::now() + chrono::Duration::seconds(61);
        let report = registry.sweep(later).await;
        assert_eq!(report.evicted, vec!["done".to_string()]);
        assert!(registry.summary("busy").await.is_ok());

        assert!(matches!(
            registry.snapshot("done", Some(3)).await,
            Err(RegistryError::RangeExpired {
                requested: 4,
                oldest_retained: None
            })
        ));
        assert_eq!(
            registry.summary("done").await.expect_err("evicted"),
            RegistryError::Evicted("done".into())
        );
        assert!(matches!(
            registry.create("done", OperationKind::GenerateSpec, None),
            Err(RegistryError::DuplicateOperation(_))
        ));
    }

    #[tokio::test]
    async fn evict_refuses_running_operations() {
        let (registry, _rx) = registry();
        running(&registry, "op-1").await;
        assert_eq!(
            registry.evict("op-1").await,
            Err(RegistryError::NotTerminal(OperationStatus::Running))
        );
    }

    #[tokio::test]
    async fn subscribe_racing_eviction_leaves_no_observer() {
        let (registry, _rx) = registry();
        running(&registry, "op-1").await;
        registry
            .transition("op-1", OperationStatus::Completed, None)
            .await
            .expect("completed");

        // Entry looked up before eviction, attached after it
        let stale = registry.lookup("op-1").expect("entry");
        registry.evict("op-1").await.expect("evict");
        let result = registry
            .attach_entry(&stale, None, 7, registry.broadcaster().new_queue())
            .await;

        assert!(matches!(result, Err(RegistryError::RangeExpired { .. })));
        assert_eq!(registry.broadcaster().observer_count("op-1"), 0);
        assert_eq!(
            registry.evict("op-1").await,
            Err(RegistryError::Evicted("op-1".into()))
        );
    }

    #[tokio::test]
    async fn unknown_operations_are_not_found() {
        let (registry, _rx) = registry();
        assert_eq!(
            registry.snapshot("nope", None).await,
            Err(RegistryError::NotFound("nope".into()))
        );
    }
}
