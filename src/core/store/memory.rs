use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::core::models::{DependencyEdge, FileRecord, Repository, RepositoryUpdate};
use crate::error::Result;
use super::{RecordStore, StoreState};

/// Process-local record store
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn create_or_fetch(&self, url: &str) -> Result<(Repository, bool)> {
        // Lookup and insert happen under one write guard
        Ok(self.state.write().await.create_or_fetch(url))
    }

    async fn update_repository(&self, id: &str, update: RepositoryUpdate) -> Result<Repository> {
        self.state.write().await.update_repository(id, update)
    }

    async fn append_file(&self, record: FileRecord) -> Result<()> {
        self.state.write().await.append_file(record)
    }

    async fn append_dependency(&self, edge: DependencyEdge) -> Result<()> {
        self.state.write().await.append_dependency(edge)
    }

    async fn purge_repository_records(&self, id: &str) -> Result<usize> {
        Ok(self.state.write().await.purge_repository_records(id))
    }

    async fn get_repository(&self, id: &str) -> Result<Option<Repository>> {
        Ok(self.state.read().await.get_repository(id))
    }

    async fn find_by_url(&self, url: &str) -> Result<Option<Repository>> {
        Ok(self.state.read().await.find_by_url(url))
    }

    async fn list_repositories(&self) -> Result<Vec<Repository>> {
        Ok(self.state.read().await.list_repositories())
    }

    async fn list_files(&self, repo_id: &str) -> Result<Vec<FileRecord>> {
        Ok(self.state.read().await.list_files(repo_id))
    }

    async fn list_dependencies(&self, repo_id: &str) -> Result<Vec<DependencyEdge>> {
        Ok(self.state.read().await.list_dependencies(repo_id))
    }

    async fn clear(&self) -> Result<()> {
        *self.state.write().await = StoreState::default();
        Ok(())
    }
}
