//! Agent module — coding-agent process management and the browser bridge.
//!
//! ## Architecture
//!
//! ```text
//! Browser ←→ WS (whole JSON) ←→ Fossclaw gateway (axum) ←→ WS/NDJSON ←→ native agent CLI
//!            /ws/browser/:id        agent module            /ws/agent/:id    (--sdk-url)
//!                                   ├ launcher                                 OR
//!                                   ├ bridge               adapters/{sse,jsonrpc} ←→ alternate providers
//!                                   ├ session_store
//!                                   ├ adapters
//!                                   └ handler
//! ```

pub mod adapters;
pub mod bridge;
pub mod handler;
pub mod launcher;
pub mod session_store;
pub mod types;

pub use bridge::AgentBridge;
pub use handler::{agent_router, agent_ws_router, browser_ws_router, AgentState};
pub use launcher::AgentLauncher;
pub use session_store::AgentSessionStore;
