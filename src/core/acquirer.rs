// src/core/acquirer.rs
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{CodepulseError, Result};

/// Produces a local copy of a remote repository's default branch
#[async_trait]
pub trait SourceAcquirer: Send + Sync {
    /// Populate `target`, which must not exist yet. Every failure is an
    /// [`CodepulseError::Acquisition`]; no retries happen here.
    async fn acquire(&self, url: &str, target: &Path) -> Result<()>;
}

/// Shallow `git clone` of public repositories
pub struct GitAcquirer {
    timeout: Duration,
}

impl GitAcquirer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn validate_url(url: &str) -> Result<()> {
        let rest = url
            .strip_prefix("https://")
            .or_else(|| url.strip_prefix("http://"))
            .ok_or_else(|| {
                CodepulseError::Acquisition(format!("unsupported repository URL: {}", url))
            })?;

        let mut parts = rest.splitn(2, '/');
        let host = parts.next().unwrap_or_default();
        let repo_path = parts.next().unwrap_or_default().trim_matches('/');
        if host.is_empty() || repo_path.is_empty() || url.chars().any(char::is_whitespace) {
            return Err(CodepulseError::Acquisition(format!(
                "invalid repository URL: {}",
                url
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl SourceAcquirer for GitAcquirer {
    async fn acquire(&self, url: &str, target: &Path) -> Result<()> {
        Self::validate_url(url)?;

        info!("Cloning {} (depth 1)", url);
        let child = Command::new("git")
            .args(["clone", "--depth", "1", "--single-branch", "--quiet", "--"])
            .arg(url)
            .arg(target)
            // Private repositories must fail fast instead of prompting
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CodepulseError::Acquisition(format!("could not run git: {}", e)))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                CodepulseError::Acquisition(format!(
                    "clone of {} timed out after {}s",
                    url,
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| CodepulseError::Acquisition(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CodepulseError::Acquisition(format!(
                "git clone {} failed: {}",
                url,
                stderr.trim()
            )));
        }

        debug!("Cloned {} into {}", url, target.display());
        Ok(())
    }
}

/// Run-owned snapshot directory, removed on every exit path.
///
/// Call [`Snapshot::cleanup`] on the normal path; `Drop` removes whatever is
/// left if the run unwinds before that.
#[derive(Debug)]
pub struct Snapshot {
    path: PathBuf,
    released: bool,
}

impl Snapshot {
    /// Reserve `<temp_root>/<repo_id>`, destroying any stale content there
    pub async fn prepare(temp_root: &Path, repo_id: &str) -> Result<Self> {
        let path = temp_root.join(repo_id);
        if tokio::fs::try_exists(&path).await? {
            debug!("Removing stale snapshot at {}", path.display());
            tokio::fs::remove_dir_all(&path).await?;
        }
        tokio::fs::create_dir_all(temp_root).await?;

        Ok(Self {
            path,
            released: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn cleanup(mut self) {
        self.released = true;
        match tokio::fs::try_exists(&self.path).await {
            Ok(true) => {
                if let Err(e) = tokio::fs::remove_dir_all(&self.path).await {
                    warn!("Failed to remove snapshot {}: {}", self.path.display(), e);
                }
            }
            Ok(false) => {}
            Err(e) => warn!("Could not inspect snapshot {}: {}", self.path.display(), e),
        }
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        if !self.released && self.path.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.path) {
                warn!("Failed to remove snapshot {}: {}", self.path.display(), e);
            }
        }
    }
}
