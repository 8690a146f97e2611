//! Alternate-provider adapters.
//!
//! Both adapters implement the same observable contract as a native agent
//! process: for a given session id they register a browser-message handler
//! with the bridge (`AgentBridge::register_external_handler`) and inject
//! synthetic agent frames (`AgentBridge::inject_to_browsers`) on events from
//! the external service. Neither owns a child process — the launcher just
//! records a `LauncherRecord` with a non-native `ProviderTag` for bookkeeping.

pub mod jsonrpc;
pub mod sse;

pub use jsonrpc::JsonRpcAdapter;
pub use sse::SseAdapter;
