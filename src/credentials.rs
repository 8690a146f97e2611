//! First-start credential provisioning (spec §6.3/§6.4).
//!
//! `USER`/`PASS` env vars, when both set, always win. Otherwise the
//! on-disk `{base}/credentials.json` is used, creating it with a fresh
//! random password on first run so a fresh install has a working login
//! without the operator picking a password up front.

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const GENERATED_PASSWORD_LEN: usize = 24;
const DEFAULT_USERNAME: &str = "admin";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredCredentials {
    username: String,
    password: String,
}

/// Resolve the username/password pair the auth module should enforce.
/// Returns `None` for either field only when nothing at all is configured,
/// which callers treat as auth-disabled (single-user, no login).
pub async fn resolve(base_dir: &Path, env_user: Option<String>, env_pass: Option<String>) -> (Option<String>, Option<String>) {
    if let (Some(user), Some(pass)) = (&env_user, &env_pass) {
        return (Some(user.clone()), Some(pass.clone()));
    }

    let path = credentials_path(base_dir);
    if let Some(existing) = read_credentials(&path).await {
        return (Some(existing.username), Some(existing.password));
    }

    let password = generate_password();
    let creds = StoredCredentials { username: DEFAULT_USERNAME.to_string(), password };
    if let Err(e) = write_credentials(&path, &creds).await {
        tracing::error!(error = %e, path = %path.display(), "failed to write generated credentials file");
    } else {
        tracing::info!(path = %path.display(), username = %creds.username, "generated first-run credentials");
    }
    (Some(creds.username), Some(creds.password))
}

fn credentials_path(base_dir: &Path) -> PathBuf {
    base_dir.join("credentials.json")
}

fn generate_password() -> String {
    rand::thread_rng().sample_iter(&Alphanumeric).take(GENERATED_PASSWORD_LEN).map(char::from).collect()
}

async fn read_credentials(path: &Path) -> Option<StoredCredentials> {
    let bytes = tokio::fs::read(path).await.ok()?;
    serde_json::from_slice(&bytes).ok()
}

async fn write_credentials(path: &Path, creds: &StoredCredentials) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let bytes = serde_json::to_vec_pretty(creds)?;
    let tmp_path = path.with_file_name(format!("{}.tmp", path.file_name().unwrap_or_default().to_string_lossy()));
    tokio::fs::write(&tmp_path, bytes).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_env_vars_override_disk_file() {
        let dir = TempDir::new().unwrap();
        let (user, pass) = resolve(dir.path(), Some("alice".to_string()), Some("hunter2".to_string())).await;
        assert_eq!(user.as_deref(), Some("alice"));
        assert_eq!(pass.as_deref(), Some("hunter2"));
        assert!(!credentials_path(dir.path()).exists());
    }

    #[tokio::test]
    async fn test_generates_and_persists_credentials_on_first_run() {
        let dir = TempDir::new().unwrap();
        let (user, pass) = resolve(dir.path(), None, None).await;
        assert_eq!(user.as_deref(), Some(DEFAULT_USERNAME));
        let pass = pass.unwrap();
        assert_eq!(pass.len(), GENERATED_PASSWORD_LEN);
        assert!(credentials_path(dir.path()).exists());
    }

    #[tokio::test]
    async fn test_second_run_reuses_persisted_credentials() {
        let dir = TempDir::new().unwrap();
        let (_, first_pass) = resolve(dir.path(), None, None).await;
        let (_, second_pass) = resolve(dir.path(), None, None).await;
        assert_eq!(first_pass, second_pass);
    }
}
