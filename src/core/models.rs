// src/core/models.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Lifecycle of a repository analysis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl RepoStatus {
    /// Whether the run controller may move a repository from `self` to `next`.
    ///
    /// `Processing` is re-enterable from any non-completed state: a fresh request
    /// re-runs the pipeline instead of resuming.
    pub fn can_transition_to(self, next: RepoStatus) -> bool {
        use RepoStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Failed, Processing)
                | (Processing, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
        )
    }
}

impl fmt::Display for RepoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RepoStatus::Pending => "pending",
            RepoStatus::Processing => "processing",
            RepoStatus::Completed => "completed",
            RepoStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    pub id: String,
    pub url: String,
    pub name: String,
    pub description: Option<String>,
    /// Architecture narrative, set when the run completes
    pub architecture: Option<String>,
    pub status: RepoStatus,
    pub stars: Option<u64>,
    pub forks: Option<u64>,
    pub primary_language: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Repository {
    pub fn new(url: &str) -> Self {
        Self {
            id: repository_id(url),
            url: url.to_string(),
            name: display_name(url),
            description: None,
            architecture: None,
            status: RepoStatus::Pending,
            stars: None,
            forks: None,
            primary_language: None,
            created_at: Utc::now(),
        }
    }
}

/// Partial update applied by `RecordStore::update_repository`
#[derive(Debug, Clone, Default)]
pub struct RepositoryUpdate {
    pub status: Option<RepoStatus>,
    pub architecture: Option<String>,
    pub primary_language: Option<String>,
    pub description: Option<String>,
}

impl RepositoryUpdate {
    pub fn status(status: RepoStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn apply(self, repo: &mut Repository) {
        if let Some(status) = self.status {
            repo.status = status;
        }
        if let Some(architecture) = self.architecture {
            repo.architecture = Some(architecture);
        }
        if let Some(language) = self.primary_language {
            repo.primary_language = Some(language);
        }
        if let Some(description) = self.description {
            repo.description = Some(description);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub repo_id: String,
    pub name: String,
    /// Path relative to the repository root, `/`-separated
    pub path: String,
    pub kind: FileKind,
    pub explanation: String,
    pub functions: Vec<String>,
    pub imports: Vec<String>,
    pub language: Option<String>,
    /// Leading bytes of the file, for display
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
    Import,
}

/// Directed edge from a file to whatever it imports.
///
/// `target` is the import string as declared; it need not name a file record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub repo_id: String,
    pub source: String,
    pub target: String,
    pub kind: EdgeKind,
}

/// Stable identity for a repository URL; also names its snapshot directory.
pub fn repository_id(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.trim().as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

/// Last path segment of the URL, without a trailing `.git`
pub fn display_name(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    let segment = trimmed.rsplit('/').next().unwrap_or("");
    let segment = segment.strip_suffix(".git").unwrap_or(segment);

    if segment.is_empty() || segment.contains(':') {
        "Unnamed Repo".to_string()
    } else {
        segment.to_string()
    }
}

/// Longest prefix of `text` that fits in `max_bytes` without splitting a character.
pub fn truncate_bytes(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
