//! Document store collaborator.
//!
//! Generated documents are committed to a remote repository with optimistic
//! concurrency: every commit names the version it expects to replace and the
//! store answers `Conflict` when someone else wrote first.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

/// Where a document lives in the remote store
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentTarget {
    /// `owner/name`
    pub repository: String,
    pub branch: String,
    pub path: String,
}

impl fmt::Display for DocumentTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.repository, self.branch, self.path)
    }
}

/// Opaque version token (a blob SHA for GitHub)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(pub String);

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the store currently holds for a target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Head {
    pub version: Version,
    /// `None` when the store does not return the body (GitHub omits it for
    /// files over 1 MB)
    pub content: Option<String>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("version conflict on {path}")]
    Conflict { path: String },
    #[error("transient store failure: {0}")]
    Transient(String),
    #[error("store rejected the write: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Current version and content of the document, `None` if it does not
    /// exist yet.
    async fn head(&self, target: &DocumentTarget) -> Result<Option<Head>, StoreError>;

    /// Write `content`, replacing `expected` (or creating the file when `None`).
    async fn commit(
        &self,
        target: &DocumentTarget,
        content: &str,
        expected: Option<&Version>,
        message: &str,
    ) -> Result<Version, StoreError>;
}

// ---------------------------------------------------------------------------
// GitHub contents API
// ---------------------------------------------------------------------------

const GITHUB_ACCEPT: &str = "application/vnd.github+json";
const USER_AGENT: &str = concat!("specstream/", env!("CARGO_PKG_VERSION"));

/// Commits documents through the GitHub repository contents API
pub struct GitHubStore {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

#[derive(Deserialize)]
struct ContentsEntry {
    sha: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    encoding: Option<String>,
}

impl ContentsEntry {
    /// The API returns base64 wrapped at 60 columns
    fn decoded(&self) -> Option<String> {
        if self.encoding.as_deref() != Some("base64") {
            return None;
        }
        let packed: String = self
            .content
            .as_deref()?
            .chars()
            .filter(|c| !c.is_ascii_whitespace())
            .collect();
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(packed)
            .ok()?;
        String::from_utf8(bytes).ok()
    }
}

#[derive(Deserialize)]
struct PutContentsResponse {
    content: ContentsEntry,
}

impl GitHubStore {
    pub fn new(base_url: &str, token: String, timeout: Duration) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| StoreError::Rejected(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn contents_url(&self, target: &DocumentTarget) -> String {
        format!(
            "{}/repos/{}/contents/{}",
            self.base_url,
            target.repository,
            target.path.trim_start_matches('/')
        )
    }
}

fn classify_status(status: StatusCode, target: &DocumentTarget, body: &str) -> StoreError {
    match status.as_u16() {
        409 | 422 => StoreError::Conflict {
            path: target.path.clone(),
        },
        429 => StoreError::Transient("rate limited".to_string()),
        code if code >= 500 => StoreError::Transient(format!("status {code}")),
        code => StoreError::Rejected(format!(
            "status {code}: {}",
            body.chars().take(200).collect::<String>()
        )),
    }
}

fn transport_error(err: reqwest::Error) -> StoreError {
    StoreError::Transient(err.to_string())
}

#[async_trait]
impl DocumentStore for GitHubStore {
    async fn head(&self, target: &DocumentTarget) -> Result<Option<Head>, StoreError> {
        let response = self
            .client
            .get(self.contents_url(target))
            .query(&[("ref", target.branch.as_str())])
            .bearer_auth(&self.token)
            .header(reqwest::header::ACCEPT, GITHUB_ACCEPT)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, target, &body));
        }

        let entry: ContentsEntry = response.json().await.map_err(transport_error)?;
        let content = entry.decoded();
        Ok(Some(Head {
            version: Version(entry.sha),
            content,
        }))
    }

    async fn commit(
        &self,
        target: &DocumentTarget,
        content: &str,
        expected: Option<&Version>,
        message: &str,
    ) -> Result<Version, StoreError> {
        let mut body = json!({
            "message": message,
            "content": base64::engine::general_purpose::STANDARD.encode(content),
            "branch": target.branch,
        });
        if let Some(version) = expected {
            body["sha"] = json!(version.0);
        }

        let response = self
            .client
            .put(self.contents_url(target))
            .bearer_auth(&self.token)
            .header(reqwest::header::ACCEPT, GITHUB_ACCEPT)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let err = classify_status(status, target, &body);
            warn!(
                component = "document_store",
                event = "store.github.commit_failed",
                target = %target,
                status = status.as_u16(),
                error = %err,
                "GitHub contents write failed"
            );
            return Err(err);
        }

        let written: PutContentsResponse = response.json().await.map_err(transport_error)?;
        debug!(
            component = "document_store",
            event = "store.github.committed",
            target = %target,
            sha = %written.content.sha,
            "Document committed"
        );
        Ok(Version(written.content.sha))
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub content: String,
    pub version: Version,
    pub message: String,
}

#[derive(Default)]
struct MemoryState {
    documents: HashMap<DocumentTarget, StoredDocument>,
    commits: usize,
    next_version: u64,
}

/// Process-local store with the same conflict semantics as the remote one.
/// Used for development runs and tests.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, target: &DocumentTarget) -> Option<StoredDocument> {
        self.lock().documents.get(target).cloned()
    }

    /// Total successful commits across all documents
    pub fn commit_count(&self) -> usize {
        self.lock().commits
    }

    /// Simulate a write made by someone else
    pub fn external_write(&self, target: &DocumentTarget, content: &str) -> Version {
        let mut state = self.lock();
        state.next_version += 1;
        let version = Version(format!("v{}", state.next_version));
        state.documents.insert(
            target.clone(),
            StoredDocument {
                content: content.to_string(),
                version: version.clone(),
                message: "external write".to_string(),
            },
        );
        version
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn head(&self, target: &DocumentTarget) -> Result<Option<Head>, StoreError> {
        Ok(self.lock().documents.get(target).map(|d| Head {
            version: d.version.clone(),
            content: Some(d.content.clone()),
        }))
    }

    async fn commit(
        &self,
        target: &DocumentTarget,
        content: &str,
        expected: Option<&Version>,
        message: &str,
    ) -> Result<Version, StoreError> {
        let mut state = self.lock();
        let current = state.documents.get(target).map(|d| &d.version);
        if current != expected {
            return Err(StoreError::Conflict {
                path: target.path.clone(),
            });
        }

        state.next_version += 1;
        state.commits += 1;
        let version = Version(format!("v{}", state.next_version));
        state.documents.insert(
            target.clone(),
            StoredDocument {
                content: content.to_string(),
                version: version.clone(),
                message: message.to_string(),
            },
        );
        Ok(version)
    }
}
