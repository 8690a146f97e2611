//! Fossclaw — a multiplexing bridge between interactive coding-agent CLIs
//! and web browsers.
//!
//! ## Architecture
//!
//! ```text
//! Browser ←→ WS (whole JSON) ←→ Fossclaw gateway (axum) ←→ WS/NDJSON ←→ native agent CLI
//!            /ws/browser/:id                                /ws/agent/:id    (--sdk-url)
//!                                                                              OR
//!                                                    adapters/{sse,jsonrpc} ←→ alternate providers
//! ```
//!
//! A session is a coding-agent conversation. One native agent process (or
//! one alternate-provider adapter) talks NDJSON to the [`agent::bridge`]
//! over a private socket; any number of browser tabs attach over their own
//! WebSocket and see the same conversation replayed and kept live. The
//! [`scheduler`] polls external sources on an interval and spawns new
//! sessions in response; [`auth`] gates browser connections behind a
//! cookie; [`naming`] asks an optional local LLM for a short session title
//! after the first user turn.
//!
//! ## Modules
//!
//! - [`agent`]: launcher, bridge, session store, alternate-provider adapters, HTTP/WS surface
//! - [`scheduler`]: cron-style jobs that spawn sessions on a timer or trigger
//! - [`auth`]: cookie-based login gating the browser-facing surface
//! - [`naming`]: best-effort LLM session titling
//! - [`gateway`]: process lifecycle plus `/health` and `/updates/*`
//! - [`config`]: environment-variable configuration
//! - [`credentials`]: first-start credential provisioning
//! - [`api`]: unified router merging every module's endpoints

pub mod agent;
pub mod api;
pub mod auth;
pub mod config;
pub mod credentials;
pub mod error;
pub mod gateway;
pub mod naming;
pub mod scheduler;

pub use error::{Error, Result};
