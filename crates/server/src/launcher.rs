//! Starting operations: create, announce, spawn the agent, return at once.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use specstream_protocol::{new_id, MessageType, OperationKind, OperationStatus};

use crate::document_store::DocumentTarget;
use crate::registry::{OperationRegistry, RegistryError, TypedLine};
use crate::runner::{CommandSpec, ProcessRunner, Secret, DEFAULT_KILL_GRACE};

/// How agent processes are launched
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub agent_bin: String,
    pub default_model: Option<String>,
    pub timeout: Duration,
    pub kill_grace: Duration,
    pub working_dir: Option<PathBuf>,
    pub github_token: Option<Secret>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_bin: "copilot".to_string(),
            default_model: None,
            timeout: Duration::from_secs(300),
            kill_grace: DEFAULT_KILL_GRACE,
            working_dir: None,
            github_token: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StartRequest {
    pub kind: OperationKind,
    pub repository: String,
    pub branch: String,
    /// Directory the document is committed under, e.g. `specs/001-login`
    pub feature_dir: String,
    pub requirement: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Earlier documents (spec for a plan, spec and plan for tasks)
    #[serde(default)]
    pub context: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartedOperation {
    pub operation_id: String,
    pub stream_url: String,
    pub status: OperationStatus,
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

pub struct Launcher {
    registry: Arc<OperationRegistry>,
    runner: ProcessRunner,
    agent: AgentConfig,
}

impl Launcher {
    pub fn new(registry: Arc<OperationRegistry>, runner: ProcessRunner, agent: AgentConfig) -> Self {
        Self {
            registry,
            runner,
            agent,
        }
    }

    pub async fn start_operation(&self, request: StartRequest) -> Result<StartedOperation, LaunchError> {
        let target = validate(&request)?;
        let operation_id = new_id();
        let kind = request.kind;

        self.registry
            .create(&operation_id, kind, Some(target.clone()))?;
        self.registry
            .append(
                &operation_id,
                TypedLine::system(
                    MessageType::System,
                    format!("Starting {} generation...", kind.label()),
                )
                .with_extra("target", target.to_string()),
            )
            .await?;

        let spec = self.command_for(&request);
        info!(
            component = "launcher",
            event = "operation.started",
            operation_id = %operation_id,
            kind = kind.as_str(),
            target = %target,
            "Operation started"
        );

        let runner = self.runner.clone();
        let id = operation_id.clone();
        tokio::spawn(async move {
            if let Err(e) = runner.run(&id, spec).await {
                warn!(
                    component = "launcher",
                    event = "operation.run_failed",
                    operation_id = %id,
                    error = %e,
                    "Agent run ended with an error"
                );
            }
        });

        Ok(StartedOperation {
            stream_url: format!("/ws/connect?operation_id={operation_id}"),
            operation_id,
            status: OperationStatus::Pending,
        })
    }

    fn command_for(&self, request: &StartRequest) -> CommandSpec {
        let mut args = vec![
            "-p".to_string(),
            build_prompt(request),
            "--allow-all-tools".to_string(),
        ];
        let model = request
            .model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .or_else(|| self.agent.default_model.clone());
        if let Some(model) = model {
            args.push("--model".to_string());
            args.push(model);
        }

        let mut spec = CommandSpec::new(&self.agent.agent_bin, args, self.agent.timeout);
        spec.kill_grace = self.agent.kill_grace;
        spec.working_dir = self.agent.working_dir.clone();
        if let Some(token) = &self.agent.github_token {
            spec = spec
                .credential("GH_TOKEN", token.clone())
                .credential("GITHUB_TOKEN", token.clone());
        }
        spec
    }
}

fn validate(request: &StartRequest) -> Result<DocumentTarget, LaunchError> {
    if request.requirement.trim().is_empty() {
        return Err(LaunchError::InvalidRequest("requirement must not be empty".into()));
    }
    let repository = request.repository.trim();
    let valid_repo = repository
        .split_once('/')
        .is_some_and(|(owner, name)| !owner.is_empty() && !name.is_empty() && !name.contains('/'));
    if !valid_repo {
        return Err(LaunchError::InvalidRequest(
            "repository must be owner/name".into(),
        ));
    }
    if request.branch.trim().is_empty() {
        return Err(LaunchError::InvalidRequest("branch must not be empty".into()));
    }
    let feature_dir = request.feature_dir.trim().trim_matches('/');
    if feature_dir.is_empty() || feature_dir.split('/').any(|part| part == "..") {
        return Err(LaunchError::InvalidRequest(
            "feature_dir must be a relative directory".into(),
        ));
    }

    Ok(DocumentTarget {
        repository: repository.to_string(),
        branch: request.branch.trim().to_string(),
        path: format!("{feature_dir}/{}", request.kind.document_file()),
    })
}

fn build_prompt(request: &StartRequest) -> String {
    let document_type = request.kind.document_type();
    let mut parts = vec![
        format!("You are generating a {document_type} for non-technical stakeholders."),
        "Fill the document completely with clear, testable requirements.".to_string(),
        "Do NOT include implementation details, frameworks, or code.".to_string(),
        "Return only the completed markdown document.".to_string(),
        String::new(),
        format!("Repository: {}", request.repository.trim()),
        format!("Branch: {}", request.branch.trim()),
        String::new(),
        "User requirement:".to_string(),
        request.requirement.trim().to_string(),
    ];
    if let Some(context) = request.context.as_deref().filter(|c| !c.trim().is_empty()) {
        parts.push(String::new());
        parts.push("Context:".to_string());
        parts.push(context.trim().to_string());
    }
    parts.join("\n")
}
