//! Authentication state (spec §4.7).
//!
//! A single username/password pair configured via `Config.user`/`Config.pass`.
//! Successful login mints a 32-byte random hex cookie mapped to
//! `{ username, created_at }`; cookies expire 30 days after creation and
//! are lazily garbage-collected on validation. The cookie map is flushed to
//! disk with a 2-second debounce, the same generation-counter pattern
//! `agent::session_store` uses for its per-file debounce.

pub mod handler;
pub mod middleware;

use crate::agent::types::now_millis;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const COOKIE_BYTES: usize = 32;
const COOKIE_TTL_MILLIS: i64 = 30 * 24 * 60 * 60 * 1000;
const FLUSH_DEBOUNCE_MS: u64 = 2000;

pub const COOKIE_NAME: &str = "fossclaw_session";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CookieEntry {
    username: String,
    created_at: i64,
}

pub struct AuthState {
    username: Option<String>,
    password: Option<String>,
    cookies: Mutex<HashMap<String, CookieEntry>>,
    path: PathBuf,
    generation: Arc<AtomicU64>,
}

impl AuthState {
    pub fn new(username: Option<String>, password: Option<String>, state_file: PathBuf) -> Self {
        Self {
            username,
            password,
            cookies: Mutex::new(HashMap::new()),
            path: state_file,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn restore_from_disk(&self) {
        if let Some(loaded) = read_json::<HashMap<String, CookieEntry>>(&self.path).await {
            *self.cookies.lock().unwrap() = loaded;
        }
    }

    /// No credentials configured means auth is disabled: every request is
    /// treated as authorized (spec §4.7 notes this is the single-user,
    /// no-login deployment mode).
    pub fn enabled(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }

    pub fn login(&self, username: &str, password: &str) -> Option<String> {
        if !self.enabled() {
            return None;
        }
        if self.username.as_deref() != Some(username) || self.password.as_deref() != Some(password) {
            return None;
        }
        let cookie = random_hex_cookie();
        let entry = CookieEntry { username: username.to_string(), created_at: now_millis() };
        self.cookies.lock().unwrap().insert(cookie.clone(), entry);
        self.schedule_flush();
        Some(cookie)
    }

    pub fn logout(&self, cookie: &str) {
        self.cookies.lock().unwrap().remove(cookie);
        self.schedule_flush();
    }

    /// Validate a cookie, garbage-collecting it (and any other expired
    /// entries encountered along the way) once past the 30-day TTL.
    pub fn validate(&self, cookie: &str) -> Option<String> {
        if !self.enabled() {
            return Some("anonymous".to_string());
        }
        let now = now_millis();
        let mut cookies = self.cookies.lock().unwrap();
        let expired: Vec<String> =
            cookies.iter().filter(|(_, e)| now - e.created_at > COOKIE_TTL_MILLIS).map(|(k, _)| k.clone()).collect();
        for key in &expired {
            cookies.remove(key);
        }
        let username = cookies.get(cookie).map(|e| e.username.clone());
        drop(cookies);
        if !expired.is_empty() {
            self.schedule_flush();
        }
        username
    }

    fn schedule_flush(&self) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let counter = self.generation.clone();
        let path = self.path.clone();
        let snapshot = self.cookies.lock().unwrap().clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(FLUSH_DEBOUNCE_MS)).await;
            if counter.load(Ordering::SeqCst) != generation {
                return;
            }
            if let Err(e) = write_atomic(&path, &snapshot).await {
                tracing::warn!(error = %e, "debounced auth cookie flush failed");
            }
        });
    }

    /// Best-effort wait for an in-flight debounced flush to land.
    pub async fn flush(&self) {
        tokio::time::sleep(Duration::from_millis(FLUSH_DEBOUNCE_MS + 100)).await;
    }
}

fn random_hex_cookie() -> String {
    let mut bytes = [0u8; COOKIE_BYTES];
    OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

async fn write_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp_path = path.with_file_name(format!("{}.tmp", path.file_name().unwrap_or_default().to_string_lossy()));
    tokio::fs::write(&tmp_path, bytes).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

async fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Option<T> {
    let bytes = tokio::fs::read(path).await.ok()?;
    serde_json::from_slice(&bytes).ok()
}
