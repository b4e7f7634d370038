//! Run-mode detection
//!
//! A run submits frames to a local comparison server (tdd), stages them for
//! the remote API (cloud), or drops them with a warning (disabled). The
//! decision is made once per run and never changes mid-run. Detection is
//! sentinel-first: a live server advertises itself through
//! `.vizzly/server.json`, and a sentinel whose writing process is gone
//! counts as absent.

use crate::config::GlobalConfig;
use crate::VizzlyError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const TOKEN_ENV: &str = "VIZZLY_TOKEN";

/// `{url, pid, port}`; present iff a server is running in this workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSentinel {
    pub url: String,
    pub pid: u32,
    pub port: u16,
}

pub fn sentinel_path(workspace: &Path) -> PathBuf {
    workspace.join(".vizzly").join("server.json")
}

/// Writes the sentinel atomically so a concurrent reader never sees a
/// partial file.
pub fn write_sentinel(workspace: &Path, sentinel: &ServerSentinel) -> Result<(), VizzlyError> {
    let path = sentinel_path(workspace);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(sentinel)?)?;
    std::fs::rename(&tmp, &path)?;
    Ok(())
}

pub fn remove_sentinel(workspace: &Path) -> Result<(), VizzlyError> {
    match std::fs::remove_file(sentinel_path(workspace)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Reads the sentinel, treating a stale one (writing process no longer
/// alive) as absent.
pub fn read_sentinel(workspace: &Path) -> Option<ServerSentinel> {
    let path = sentinel_path(workspace);
    let content = std::fs::read_to_string(&path).ok()?;
    let sentinel: ServerSentinel = serde_json::from_str(&content).ok()?;
    if !pid_alive(sentinel.pid) {
        warn!(
            "Stale server sentinel at {} (pid {} not running)",
            path.display(),
            sentinel.pid
        );
        return None;
    }
    Some(sentinel)
}

#[cfg(target_os = "linux")]
fn pid_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{}", pid)).exists()
}

#[cfg(not(target_os = "linux"))]
fn pid_alive(_pid: u32) -> bool {
    true
}

/// The path a run's frames take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMode {
    /// A local comparison server is running; POST every frame to it.
    Tdd { server_url: String },
    /// No server, but an API token is available; stage frames for upload.
    Cloud { token: String },
    /// Neither; the walk still completes but frames are dropped.
    Disabled,
}

/// Resolves the API token: explicit argument, then environment, then the
/// per-user global config.
pub fn resolve_token(explicit: Option<&str>, workspace: &Path) -> Option<String> {
    if let Some(token) = explicit {
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }
    if let Ok(token) = std::env::var(TOKEN_ENV) {
        if !token.is_empty() {
            return Some(token);
        }
    }
    GlobalConfig::load().project_token(workspace)
}

/// Chooses the run mode once for this process.
pub fn detect_mode(workspace: &Path, explicit_token: Option<&str>) -> RunMode {
    if let Some(sentinel) = read_sentinel(workspace) {
        debug!("Detected local comparison server at {}", sentinel.url);
        return RunMode::Tdd {
            server_url: sentinel.url,
        };
    }
    if let Some(token) = resolve_token(explicit_token, workspace) {
        return RunMode::Cloud { token };
    }
    warn!("No local server and no API token; screenshots will not be submitted");
    RunMode::Disabled
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sentinel(pid: u32) -> ServerSentinel {
        ServerSentinel {
            url: "http://localhost:47392".to_string(),
            pid,
            port: 47392,
        }
    }

    #[test]
    fn test_sentinel_roundtrip() {
        let dir = TempDir::new().unwrap();
        write_sentinel(dir.path(), &sentinel(std::process::id())).unwrap();
        let read = read_sentinel(dir.path()).unwrap();
        assert_eq!(read.port, 47392);
        assert_eq!(read.pid, std::process::id());
    }

    #[test]
    fn test_stale_sentinel_treated_as_absent() {
        let dir = TempDir::new().unwrap();
        // far above any real pid, so /proc/<pid> cannot exist
        write_sentinel(dir.path(), &sentinel(u32::MAX - 7)).unwrap();
        if cfg!(target_os = "linux") {
            assert!(read_sentinel(dir.path()).is_none());
        }
    }

    #[test]
    fn test_missing_sentinel_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(read_sentinel(dir.path()).is_none());
    }

    #[test]
    fn test_remove_sentinel_idempotent() {
        let dir = TempDir::new().unwrap();
        remove_sentinel(dir.path()).unwrap();
        write_sentinel(dir.path(), &sentinel(std::process::id())).unwrap();
        remove_sentinel(dir.path()).unwrap();
        assert!(!sentinel_path(dir.path()).exists());
    }

    #[test]
    fn test_detect_prefers_live_sentinel() {
        let dir = TempDir::new().unwrap();
        write_sentinel(dir.path(), &sentinel(std::process::id())).unwrap();
        let mode = detect_mode(dir.path(), Some("token-should-lose"));
        assert_eq!(
            mode,
            RunMode::Tdd {
                server_url: "http://localhost:47392".to_string()
            }
        );
    }

    #[test]
    fn test_detect_falls_back_to_token_then_disabled() {
        let dir = TempDir::new().unwrap();
        let mode = detect_mode(dir.path(), Some("tok-123"));
        assert_eq!(
            mode,
            RunMode::Cloud {
                token: "tok-123".to_string()
            }
        );
    }

    #[test]
    fn test_explicit_empty_token_ignored() {
        assert!(resolve_token(Some(""), Path::new("/nonexistent-workspace")).is_none()
            || std::env::var(TOKEN_ENV).is_ok());
    }
}
