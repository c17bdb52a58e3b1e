//! Command-line and environment configuration

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::handoff::HandoffConfig;
use crate::launcher::AgentConfig;
use crate::registry::RetentionConfig;
use crate::runner::{Secret, DEFAULT_KILL_GRACE};
use crate::state::KeepaliveConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreBackend {
    /// In-process store, lost on restart
    Memory,
    /// GitHub repository contents API
    Github,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "specstream",
    about = "Stream agent document generation to WebSocket clients",
    version
)]
pub struct Config {
    #[arg(long, env = "SPECSTREAM_BIND", default_value = "127.0.0.1:4000")]
    pub bind: SocketAddr,

    /// Defaults to ~/.specstream
    #[arg(long, value_name = "PATH", env = "SPECSTREAM_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Bearer token required on /api routes
    #[arg(long, env = "SPECSTREAM_AUTH_TOKEN", hide_env_values = true)]
    pub auth_token: Option<String>,

    /// Accepted WebSocket sessions, `name:session` or `session`. Empty means open mode.
    #[arg(
        long = "session-token",
        env = "SPECSTREAM_SESSION_TOKENS",
        value_delimiter = ',',
        hide_env_values = true
    )]
    pub session_tokens: Vec<String>,

    #[arg(long, env = "SPECSTREAM_AGENT_BIN", default_value = "copilot")]
    pub agent_bin: String,

    #[arg(long, env = "SPECSTREAM_AGENT_MODEL")]
    pub agent_model: Option<String>,

    #[arg(long, env = "SPECSTREAM_AGENT_TIMEOUT_SECS", default_value_t = 300)]
    pub agent_timeout_secs: u64,

    /// Working directory for agent processes
    #[arg(long, value_name = "PATH", env = "SPECSTREAM_AGENT_WORKDIR")]
    pub agent_workdir: Option<PathBuf>,

    #[arg(long, env = "SPECSTREAM_QUEUE_CAPACITY", default_value_t = 100)]
    pub queue_capacity: usize,

    #[arg(long, env = "SPECSTREAM_MAX_LOG_MESSAGES", default_value_t = 1000)]
    pub max_log_messages: usize,

    #[arg(long, env = "SPECSTREAM_RETENTION_MINUTES", default_value_t = 10)]
    pub retention_minutes: u64,

    #[arg(long, env = "SPECSTREAM_SWEEP_INTERVAL_SECS", default_value_t = 60)]
    pub sweep_interval_secs: u64,

    #[arg(long, env = "SPECSTREAM_PING_INTERVAL_SECS", default_value_t = 30)]
    pub ping_interval_secs: u64,

    #[arg(long, env = "SPECSTREAM_IDLE_TIMEOUT_SECS", default_value_t = 90)]
    pub idle_timeout_secs: u64,

    #[arg(long, value_enum, env = "SPECSTREAM_STORE", default_value_t = StoreBackend::Memory)]
    pub store: StoreBackend,

    #[arg(long, env = "SPECSTREAM_GITHUB_API", default_value = "https://api.github.com")]
    pub github_api: String,

    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    pub github_token: Option<String>,

    #[arg(long, env = "SPECSTREAM_COMMIT_RETRIES", default_value_t = 3)]
    pub commit_retries: u32,

    #[arg(long, env = "SPECSTREAM_COMMIT_BACKOFF_MS", default_value_t = 1000)]
    pub commit_backoff_ms: u64,
}

impl Config {
    pub fn retention(&self) -> RetentionConfig {
        RetentionConfig {
            max_log_messages: self.max_log_messages.max(1),
            retention: Duration::from_secs(self.retention_minutes * 60),
            ..RetentionConfig::default()
        }
    }

    pub fn handoff(&self) -> HandoffConfig {
        HandoffConfig {
            max_conflict_retries: self.commit_retries,
            max_transient_retries: self.commit_retries,
            initial_backoff: Duration::from_millis(self.commit_backoff_ms),
            ..HandoffConfig::default()
        }
    }

    pub fn agent(&self) -> AgentConfig {
        AgentConfig {
            agent_bin: self.agent_bin.clone(),
            default_model: self.agent_model.clone().filter(|m| !m.trim().is_empty()),
            timeout: Duration::from_secs(self.agent_timeout_secs),
            kill_grace: DEFAULT_KILL_GRACE,
            working_dir: self.agent_workdir.clone(),
            github_token: self.github_token.clone().map(Secret::new),
        }
    }

    pub fn keepalive(&self) -> KeepaliveConfig {
        KeepaliveConfig {
            ping_interval: Duration::from_secs(self.ping_interval_secs.max(1)),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs.max(1)),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}
