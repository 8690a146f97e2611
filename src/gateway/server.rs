//! Top-level process lifecycle: the glue that ties the session bridge,
//! agent launcher, scheduler, and auth state to a single start/stop
//! sequence, mirroring the predecessor's `GatewayState`/`GatewayBuilder`
//! shape even though none of its channel/TEE/privacy responsibilities
//! survive into this crate.

use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    Stopped,
    Starting,
    Running,
    ShuttingDown,
}

pub struct Gateway {
    state: Arc<RwLock<GatewayState>>,
    started_at: Arc<RwLock<Option<Instant>>>,
}

impl Gateway {
    pub fn new() -> Self {
        Self { state: Arc::new(RwLock::new(GatewayState::Stopped)), started_at: Arc::new(RwLock::new(None)) }
    }

    pub async fn state(&self) -> GatewayState {
        *self.state.read().await
    }

    /// Flip to `Running` and record the start instant `/health`'s uptime
    /// is computed from. Callers (`main.rs`) call this once background
    /// tasks (scheduler ticker, reconnect watchdog, namer) are spawned.
    pub async fn mark_started(&self) {
        *self.state.write().await = GatewayState::Running;
        *self.started_at.write().await = Some(Instant::now());
    }

    pub async fn mark_stopping(&self) {
        *self.state.write().await = GatewayState::ShuttingDown;
    }

    pub async fn mark_stopped(&self) {
        *self.state.write().await = GatewayState::Stopped;
    }

    pub async fn uptime_seconds(&self) -> u64 {
        match *self.started_at.read().await {
            Some(start) => start.elapsed().as_secs(),
            None => 0,
        }
    }
}

impl Default for Gateway {
    fn default() -> Self {
        Self::new()
    }
}

pub struct GatewayBuilder;

impl GatewayBuilder {
    pub fn new() -> Self {
        Self
    }

    pub fn build(self) -> Gateway {
        Gateway::new()
    }
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self::new()
    }
}
