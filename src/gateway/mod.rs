//! Process-level orchestrator and its public health/update surface.
//!
//! Everything session/agent/scheduler-specific lives in `agent`, `scheduler`,
//! and `auth`; this module is just the thin wrapper spec §6.2's `/health`
//! and `/updates/*` endpoints need plus the lifecycle bookkeeping `main.rs`
//! uses for graceful shutdown.

mod handler;
mod server;

pub use handler::{gateway_protected_router, gateway_router, GatewayHttpState};
pub use server::{Gateway, GatewayBuilder, GatewayState};
