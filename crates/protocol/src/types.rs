//! Core types shared across the protocol

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Semantic classification of a streamed message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    System,
    Thinking,
    Execution,
    Error,
    Complete,
}

impl MessageType {
    /// Error and complete messages must reach every observer.
    pub fn is_undroppable(self) -> bool {
        matches!(self, MessageType::Error | MessageType::Complete)
    }

    pub fn default_priority(self) -> Priority {
        match self {
            MessageType::Thinking => Priority::Low,
            MessageType::System | MessageType::Execution => Priority::Normal,
            MessageType::Complete => Priority::High,
            MessageType::Error => Priority::Critical,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::System => "system",
            MessageType::Thinking => "thinking",
            MessageType::Execution => "execution",
            MessageType::Error => "error",
            MessageType::Complete => "complete",
        }
    }
}

/// Who produced a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    Agent,
    System,
}

/// Delivery priority, used for UI treatment and acknowledgment bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Priority {
    pub fn requires_acknowledgment(self) -> bool {
        self >= Priority::High
    }
}

/// Operation lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl OperationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, OperationStatus::Completed | OperationStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Running => "running",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Document generation operations that can be started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    GenerateSpec,
    GeneratePlan,
    GenerateTasks,
}

impl OperationKind {
    /// File name of the generated document inside a feature directory
    pub fn document_file(self) -> &'static str {
        match self {
            OperationKind::GenerateSpec => "spec.md",
            OperationKind::GeneratePlan => "plan.md",
            OperationKind::GenerateTasks => "tasks.md",
        }
    }

    /// Short label used in status messages ("Starting spec generation...")
    pub fn label(self) -> &'static str {
        match self {
            OperationKind::GenerateSpec => "spec",
            OperationKind::GeneratePlan => "plan",
            OperationKind::GenerateTasks => "tasks",
        }
    }

    /// Document type named in the agent prompt
    pub fn document_type(self) -> &'static str {
        match self {
            OperationKind::GenerateSpec => "specification",
            OperationKind::GeneratePlan => "implementation plan",
            OperationKind::GenerateTasks => "task breakdown",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::GenerateSpec => "generate_spec",
            OperationKind::GeneratePlan => "generate_plan",
            OperationKind::GenerateTasks => "generate_tasks",
        }
    }
}

/// UI hints attached to every message frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub priority: Priority,
    #[serde(default)]
    pub requires_acknowledgment: bool,
    #[serde(default)]
    pub is_final: bool,
    #[serde(default)]
    pub collapsible: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub truncated: bool,
    /// Free-form hints (e.g. `success` on complete messages)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl MessageMetadata {
    /// Default hints for a message type
    pub fn for_type(message_type: MessageType) -> Self {
        let priority = message_type.default_priority();
        Self {
            priority,
            requires_acknowledgment: priority.requires_acknowledgment(),
            is_final: message_type == MessageType::Complete,
            collapsible: message_type == MessageType::Thinking,
            truncated: false,
            extra: Map::new(),
        }
    }
}

/// One unit of streamed operation output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamMessage {
    pub id: String,
    pub operation_id: String,
    pub sequence: u64,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub content: String,
    pub sender: Sender,
    /// RFC 3339 UTC. Ordering is by `sequence`, never by timestamp.
    pub timestamp: String,
    pub metadata: MessageMetadata,
}

impl StreamMessage {
    pub fn priority(&self) -> Priority {
        self.metadata.priority
    }
}

/// How an operation ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExitOutcome {
    Success { exit_code: i32 },
    NonZeroExit {
        exit_code: Option<i32>,
        diagnostic: String,
    },
    Timeout { after_secs: u64 },
    SpawnFailed { reason: String },
    Aborted { reason: String },
}

impl ExitOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExitOutcome::Success { .. })
    }

    /// One-line, client-safe description
    pub fn summary(&self) -> String {
        match self {
            ExitOutcome::Success { .. } => "completed successfully".to_string(),
            ExitOutcome::NonZeroExit {
                exit_code: Some(code),
                ..
            } => format!("agent exited with code {code}"),
            ExitOutcome::NonZeroExit {
                exit_code: None, ..
            } => "agent was terminated by a signal".to_string(),
            ExitOutcome::Timeout { after_secs } => {
                format!("timed out after {after_secs} seconds")
            }
            ExitOutcome::SpawnFailed { .. } => "agent could not be started".to_string(),
            ExitOutcome::Aborted { reason } => format!("aborted: {reason}"),
        }
    }
}

/// Point-in-time view of an operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationSummary {
    pub operation_id: String,
    pub kind: OperationKind,
    pub status: OperationStatus,
    pub created_at: String,
    pub started_at: Option<String>,
    pub terminal_at: Option<String>,
    pub exit_outcome: Option<ExitOutcome>,
    pub message_count: usize,
    pub oldest_sequence: Option<u64>,
    pub latest_sequence: Option<u64>,
    pub artifact_committed: bool,
    pub artifact_version: Option<String>,
    pub persist_failure: Option<String>,
}

/// Error codes sent to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Replay was requested past the retained window; the client must restart.
    RangeExpired,
    AuthRejected,
    NotFound,
    ParseError,
    NotSubscribed,
    InvalidRequest,
    Internal,
}
