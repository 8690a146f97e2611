//! Fossclaw configuration management
//!
//! Configuration is environment-variable first: `Config::from_env()` reads
//! the variables named in the external interface spec, falling back to
//! documented defaults. `clap` flags in `main.rs` override the environment
//! via `#[arg(env = "...")]` so `fossclaw serve --port 9000` and
//! `PORT=9000 fossclaw serve` behave identically.

use std::path::PathBuf;

/// Top-level Fossclaw configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port to listen on.
    pub port: u16,

    /// Default working directory seeded into new sessions.
    pub base_cwd: PathBuf,

    /// Base directory for persisted sessions.
    pub session_dir: PathBuf,

    /// Archived-session retention, in days. `0` disables TTL cleanup.
    pub session_ttl_days: u32,

    /// Auth credential pair, if overridden by environment.
    pub user: Option<String>,
    pub pass: Option<String>,

    /// Local port the SSE adapter spawns its upstream on.
    pub alt_provider_port: u16,

    /// Optional local LLM endpoint and model tag for session naming.
    pub naming_url: Option<String>,
    pub naming_model: Option<String>,

    /// Truncation budget (bytes) for oversized tool outputs in the SSE
    /// adapter. Spec names this an open question; exposed as config
    /// rather than hardcoded.
    pub sse_truncate_bytes: usize,

    /// Path to the native agent CLI binary. Resolved via `PATH`/common
    /// install locations when unset.
    pub agent_binary: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3456,
            base_cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            session_dir: default_session_dir(),
            session_ttl_days: 7,
            user: None,
            pass: None,
            alt_provider_port: 3456 + 100,
            naming_url: None,
            naming_model: None,
            sse_truncate_bytes: 8000,
            agent_binary: None,
        }
    }
}

impl Config {
    /// Build configuration from the environment, applying the defaults
    /// documented in the external interface spec.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(port) = std::env::var("PORT").ok().and_then(|v| v.parse().ok()) {
            config.port = port;
            config.alt_provider_port = port + 100;
        }
        if let Ok(cwd) = std::env::var("BASE_CWD") {
            config.base_cwd = PathBuf::from(cwd);
        }
        if let Ok(dir) = std::env::var("SESSION_DIR") {
            config.session_dir = PathBuf::from(dir);
        }
        if let Some(ttl) = std::env::var("SESSION_TTL_DAYS").ok().and_then(|v| v.parse().ok()) {
            config.session_ttl_days = ttl;
        }
        if let Some(port) = std::env::var("ALT_PROVIDER_PORT").ok().and_then(|v| v.parse().ok()) {
            config.alt_provider_port = port;
        }
        config.user = std::env::var("USER").ok();
        config.pass = std::env::var("PASS").ok();
        config.naming_url = std::env::var("NAMING_URL").ok();
        config.naming_model = std::env::var("NAMING_MODEL").ok();
        config.agent_binary = std::env::var("AGENT_BINARY").ok();

        config
    }
}

fn default_session_dir() -> PathBuf {
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".fossclaw")
        .join("sessions")
}
