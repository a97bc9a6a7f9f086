//! Record store boundary
//!
//! The pipeline needs four reliable writes (create-or-fetch by URL, update by
//! id, append file record, append dependency edge) and nothing transactional
//! across them. Reads serve the presentation layer.

mod json_file;
mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{CodepulseError, Result};
use super::models::{DependencyEdge, FileRecord, Repository, RepositoryUpdate};

pub use json_file::JsonStore;
pub use memory::MemoryStore;

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Existing record for `url`, or a new pending one. The flag is true when created.
    async fn create_or_fetch(&self, url: &str) -> Result<(Repository, bool)>;

    async fn update_repository(&self, id: &str, update: RepositoryUpdate) -> Result<Repository>;

    async fn append_file(&self, record: FileRecord) -> Result<()>;

    async fn append_dependency(&self, edge: DependencyEdge) -> Result<()>;

    /// Drop every file record and edge of a repository; returns how many were removed
    async fn purge_repository_records(&self, id: &str) -> Result<usize>;

    async fn get_repository(&self, id: &str) -> Result<Option<Repository>>;

    async fn find_by_url(&self, url: &str) -> Result<Option<Repository>>;

    async fn list_repositories(&self) -> Result<Vec<Repository>>;

    async fn list_files(&self, repo_id: &str) -> Result<Vec<FileRecord>>;

    async fn list_dependencies(&self, repo_id: &str) -> Result<Vec<DependencyEdge>>;

    /// Administrative wipe of every record
    async fn clear(&self) -> Result<()>;
}

/// One durable mutation, as written to the JSON-lines journal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub(crate) enum StoreEvent {
    /// Insert or replace a repository record
    Repository(Repository),
    File(FileRecord),
    Dependency(DependencyEdge),
    Purged { repo_id: String },
}

/// Plain data shared by the store implementations
#[derive(Debug, Clone, Default)]
pub(crate) struct StoreState {
    repositories: BTreeMap<String, Repository>,
    files: Vec<FileRecord>,
    dependencies: Vec<DependencyEdge>,
}

impl StoreState {
    fn create_or_fetch(&mut self, url: &str) -> (Repository, bool) {
        if let Some(existing) = self.find_by_url(url) {
            return (existing, false);
        }
        let repo = Repository::new(url);
        self.repositories.insert(repo.id.clone(), repo.clone());
        (repo, true)
    }

    fn update_repository(&mut self, id: &str, update: RepositoryUpdate) -> Result<Repository> {
        let repo = self.updated_repository(id, update)?;
        self.repositories.insert(repo.id.clone(), repo.clone());
        Ok(repo)
    }

    /// The record `update` would produce, leaving the state untouched
    fn updated_repository(&self, id: &str, update: RepositoryUpdate) -> Result<Repository> {
        let mut repo = self
            .repositories
            .get(id)
            .cloned()
            .ok_or_else(|| CodepulseError::NotFound(format!("repository {}", id)))?;
        update.apply(&mut repo);
        Ok(repo)
    }

    fn append_file(&mut self, record: FileRecord) -> Result<()> {
        self.require_repository(&record.repo_id)?;
        self.files.push(record);
        Ok(())
    }

    fn append_dependency(&mut self, edge: DependencyEdge) -> Result<()> {
        self.require_repository(&edge.repo_id)?;
        self.dependencies.push(edge);
        Ok(())
    }

    fn purge_repository_records(&mut self, id: &str) -> usize {
        let before = self.files.len() + self.dependencies.len();
        self.files.retain(|f| f.repo_id != id);
        self.dependencies.retain(|d| d.repo_id != id);
        before - (self.files.len() + self.dependencies.len())
    }

    fn record_count(&self, id: &str) -> usize {
        self.files.iter().filter(|f| f.repo_id == id).count()
            + self.dependencies.iter().filter(|d| d.repo_id == id).count()
    }

    fn apply(&mut self, event: StoreEvent) {
        match event {
            StoreEvent::Repository(repo) => {
                self.repositories.insert(repo.id.clone(), repo);
            }
            StoreEvent::File(record) => self.files.push(record),
            StoreEvent::Dependency(edge) => self.dependencies.push(edge),
            StoreEvent::Purged { repo_id } => {
                self.purge_repository_records(&repo_id);
            }
        }
    }

    /// Smallest event sequence that rebuilds this state
    fn events(&self) -> Vec<StoreEvent> {
        self.repositories
            .values()
            .cloned()
            .map(StoreEvent::Repository)
            .chain(self.files.iter().cloned().map(StoreEvent::File))
            .chain(self.dependencies.iter().cloned().map(StoreEvent::Dependency))
            .collect()
    }

    fn get_repository(&self, id: &str) -> Option<Repository> {
        self.repositories.get(id).cloned()
    }

    fn find_by_url(&self, url: &str) -> Option<Repository> {
        self.repositories.values().find(|r| r.url == url).cloned()
    }

    fn list_repositories(&self) -> Vec<Repository> {
        let mut repos: Vec<Repository> = self.repositories.values().cloned().collect();
        repos.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        repos
    }

    fn list_files(&self, repo_id: &str) -> Vec<FileRecord> {
        self.files.iter().filter(|f| f.repo_id == repo_id).cloned().collect()
    }

    fn list_dependencies(&self, repo_id: &str) -> Vec<DependencyEdge> {
        self.dependencies
            .iter()
            .filter(|d| d.repo_id == repo_id)
            .cloned()
            .collect()
    }

    fn require_repository(&self, id: &str) -> Result<()> {
        if self.repositories.contains_key(id) {
            Ok(())
        } else {
            Err(CodepulseError::NotFound(format!("repository {}", id)))
        }
    }
}
