use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::core::models::{DependencyEdge, FileRecord, Repository, RepositoryUpdate};
use crate::error::{CodepulseError, Result};
use super::{RecordStore, StoreEvent, StoreState};

/// Record store persisted as a JSON-lines journal.
///
/// Each mutation appends one event line and only then touches the in-memory
/// state, so a failed write leaves nothing visible. The journal is replayed and
/// compacted when the store is opened.
pub struct JsonStore {
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl JsonStore {
    /// Open the store at `path`, starting empty when the file does not exist
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut state = StoreState::default();

        if tokio::fs::try_exists(&path).await? {
            let content = tokio::fs::read_to_string(&path).await?;
            let lines: Vec<(usize, &str)> = content
                .lines()
                .enumerate()
                .filter(|(_, line)| !line.trim().is_empty())
                .collect();

            for (position, (index, line)) in lines.iter().enumerate() {
                match serde_json::from_str::<StoreEvent>(line) {
                    Ok(event) => state.apply(event),
                    // A crash mid-append can only tear the final line
                    Err(e) if position + 1 == lines.len() => {
                        warn!("Dropping torn journal entry at {}:{}: {}", path.display(), index + 1, e);
                    }
                    Err(e) => {
                        return Err(CodepulseError::Store(format!(
                            "corrupt journal entry at {}:{}: {}",
                            path.display(),
                            index + 1,
                            e
                        )));
                    }
                }
            }

            Self::rewrite(&path, &state).await?;
            debug!("Replayed {} journal entries from {}", lines.len(), path.display());
        }

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, event: &StoreEvent) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Replace the journal with the compacted form of `state` (temp file, then rename)
    async fn rewrite(path: &Path, state: &StoreState) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut content = String::new();
        for event in state.events() {
            content.push_str(&serde_json::to_string(&event)?);
            content.push('\n');
        }
        let tmp = path.with_extension("jsonl.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for JsonStore {
    async fn create_or_fetch(&self, url: &str) -> Result<(Repository, bool)> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.find_by_url(url) {
            return Ok((existing, false));
        }

        let repo = Repository::new(url);
        let event = StoreEvent::Repository(repo.clone());
        self.append(&event).await?;
        state.apply(event);
        Ok((repo, true))
    }

    async fn update_repository(&self, id: &str, update: RepositoryUpdate) -> Result<Repository> {
        let mut state = self.state.lock().await;
        let repo = state.updated_repository(id, update)?;
        let event = StoreEvent::Repository(repo.clone());
        self.append(&event).await?;
        state.apply(event);
        Ok(repo)
    }

    async fn append_file(&self, record: FileRecord) -> Result<()> {
        let mut state = self.state.lock().await;
        state.require_repository(&record.repo_id)?;
        let event = StoreEvent::File(record);
        self.append(&event).await?;
        state.apply(event);
        Ok(())
    }

    async fn append_dependency(&self, edge: DependencyEdge) -> Result<()> {
        let mut state = self.state.lock().await;
        state.require_repository(&edge.repo_id)?;
        let event = StoreEvent::Dependency(edge);
        self.append(&event).await?;
        state.apply(event);
        Ok(())
    }

    async fn purge_repository_records(&self, id: &str) -> Result<usize> {
        let mut state = self.state.lock().await;
        let removed = state.record_count(id);
        if removed > 0 {
            let event = StoreEvent::Purged {
                repo_id: id.to_string(),
            };
            self.append(&event).await?;
            state.apply(event);
        }
        Ok(removed)
    }

    async fn get_repository(&self, id: &str) -> Result<Option<Repository>> {
        Ok(self.state.lock().await.get_repository(id))
    }

    async fn find_by_url(&self, url: &str) -> Result<Option<Repository>> {
        Ok(self.state.lock().await.find_by_url(url))
    }

    async fn list_repositories(&self) -> Result<Vec<Repository>> {
        Ok(self.state.lock().await.list_repositories())
    }

    async fn list_files(&self, repo_id: &str) -> Result<Vec<FileRecord>> {
        Ok(self.state.lock().await.list_files(repo_id))
    }

    async fn list_dependencies(&self, repo_id: &str) -> Result<Vec<DependencyEdge>> {
        Ok(self.state.lock().await.list_dependencies(repo_id))
    }

    async fn clear(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let empty = StoreState::default();
        Self::rewrite(&self.path, &empty).await?;
        *state = empty;
        Ok(())
    }
}
