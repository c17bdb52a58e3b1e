//! Application state shared by HTTP and WebSocket handlers

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;

use crate::auth::SessionValidator;
use crate::broadcaster::Broadcaster;
use crate::handoff::PersistenceHandoff;
use crate::launcher::Launcher;
use crate::registry::OperationRegistry;

#[derive(Debug, Clone)]
pub struct KeepaliveConfig {
    pub ping_interval: Duration,
    /// Close the connection when nothing arrives for this long
    pub idle_timeout: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Counters across all WebSocket connections
#[derive(Debug, Default)]
pub struct ConnectionStats {
    open: AtomicUsize,
    opened: AtomicU64,
    delivered: AtomicU64,
    auth_rejected: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatsSnapshot {
    pub open: usize,
    pub opened: u64,
    pub delivered: u64,
    pub auth_rejected: u64,
}

impl ConnectionStats {
    pub fn opened(&self) {
        self.open.fetch_add(1, Ordering::Relaxed);
        self.opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn closed(&self, delivered: u64) {
        self.open.fetch_sub(1, Ordering::Relaxed);
        self.delivered.fetch_add(delivered, Ordering::Relaxed);
    }

    pub fn rejected(&self) {
        self.auth_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConnectionStatsSnapshot {
        ConnectionStatsSnapshot {
            open: self.open.load(Ordering::Relaxed),
            opened: self.opened.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            auth_rejected: self.auth_rejected.load(Ordering::Relaxed),
        }
    }
}

pub struct AppState {
    pub registry: Arc<OperationRegistry>,
    pub launcher: Launcher,
    pub handoff: Arc<PersistenceHandoff>,
    pub validator: Arc<dyn SessionValidator>,
    pub keepalive: KeepaliveConfig,
    pub connections: ConnectionStats,
    /// Flipped to true once shutdown starts; open connections close on it
    pub shutdown: watch::Sender<bool>,
}

impl AppState {
    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        self.registry.broadcaster()
    }
}
