// src/core/engine.rs
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{Config, StoreBackend};
use crate::error::{AnalysisError, CodepulseError, Result};
use super::accumulator::{FileOutcome, ResultAccumulator};
use super::acquirer::{GitAcquirer, Snapshot, SourceAcquirer};
use super::batch_scheduler::BatchScheduler;
use super::classifier::FileClassifier;
use super::llm::{create_provider, Availability, CodeAnalyst, CompletionProvider, SUMMARY_UNAVAILABLE};
use super::models::{DependencyEdge, FileRecord, RepoStatus, Repository, RepositoryUpdate};
use super::store::{JsonStore, MemoryStore, RecordStore};
use super::walker::{ExclusionPolicy, FileDescriptor, TreeWalker};

/// What one completed run did
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub files_walked: usize,
    pub files_classified: usize,
    pub batches: usize,
    pub throttle_pauses: usize,
    pub files_analyzed: usize,
    pub files_failed: usize,
    pub failures_by_kind: BTreeMap<String, usize>,
    pub records_persisted: usize,
    pub edges_persisted: usize,
    pub persistence_failures: usize,
    pub summary_degraded: bool,
    pub primary_language: Option<String>,
    pub elapsed_ms: u128,
}

/// Result of an analysis request
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// Repository already completed; returned as stored
    Skipped(Repository),
    /// Another run for this repository is in flight in this process
    AlreadyRunning(Repository),
    Completed {
        repository: Repository,
        report: RunReport,
    },
    Failed {
        repository: Repository,
        reason: String,
    },
}

impl RunOutcome {
    pub fn repository(&self) -> &Repository {
        match self {
            RunOutcome::Skipped(repo) | RunOutcome::AlreadyRunning(repo) => repo,
            RunOutcome::Completed { repository, .. } | RunOutcome::Failed { repository, .. } => {
                repository
            }
        }
    }
}

/// Result of registering a URL
#[derive(Debug, Clone)]
pub enum Submission {
    Created(Repository),
    Existing(Repository),
    /// Already analyzed; no run should start
    AlreadyCompleted(Repository),
}

impl Submission {
    pub fn into_repository(self) -> Repository {
        match self {
            Submission::Created(repo)
            | Submission::Existing(repo)
            | Submission::AlreadyCompleted(repo) => repo,
        }
    }
}

/// Removes a repository from the in-flight set when the run ends, however it ends
struct InFlightGuard {
    registry: Arc<Mutex<HashSet<String>>>,
    repo_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.repo_id);
    }
}

/// Run controller: owns the repository status machine and sequences acquisition,
/// walking, classification, batched analysis and the architecture summary.
#[derive(Clone)]
pub struct Engine {
    config: Arc<Config>,
    store: Arc<dyn RecordStore>,
    acquirer: Arc<dyn SourceAcquirer>,
    analyst: Arc<CodeAnalyst>,
    walker: TreeWalker,
    classifier: FileClassifier,
    scheduler: BatchScheduler,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl Engine {
    /// Create an engine backed by git, the JSON record store and the configured provider
    pub async fn new(config_path: Option<&Path>) -> anyhow::Result<Self> {
        let config = Config::load_or_default(config_path)?;
        config.validate()?;

        debug!(
            "Loaded configuration: provider={}, batch_size={}",
            config.llm.provider, config.pipeline.batch_size
        );

        if config.llm.resolved_api_key().is_none() {
            warn!(
                "No API key found (set {}); file analyses will fail and summaries degrade",
                config.llm.api_key_env
            );
        }

        let store: Arc<dyn RecordStore> = match config.workspace.store {
            StoreBackend::Json => {
                let store = JsonStore::open(&config.workspace.store_path).await?;
                debug!("Record store: {}", store.path().display());
                Arc::new(store)
            }
            StoreBackend::Memory => {
                debug!("Record store: in-memory");
                Arc::new(MemoryStore::new())
            }
        };
        let acquirer = GitAcquirer::new(Duration::from_secs(config.pipeline.clone_timeout_secs));
        let provider = create_provider(
            &config.llm,
            Duration::from_secs(config.pipeline.call_timeout_secs),
        )?;

        Ok(Self::with_components(
            config,
            store,
            Arc::new(acquirer),
            Arc::from(provider),
        )?)
    }

    pub fn with_components(
        config: Config,
        store: Arc<dyn RecordStore>,
        acquirer: Arc<dyn SourceAcquirer>,
        provider: Arc<dyn CompletionProvider>,
    ) -> Result<Self> {
        config.validate()?;
        let analyst = CodeAnalyst::new(provider, &config.llm, &config.pipeline)?;
        info!("Analysis provider: {}", analyst.provider_name());

        Ok(Self {
            walker: TreeWalker::new(ExclusionPolicy::from(&config.scan)),
            classifier: FileClassifier::new(&config.scan),
            scheduler: BatchScheduler::from_config(&config.pipeline),
            analyst: Arc::new(analyst),
            config: Arc::new(config),
            store,
            acquirer,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    /// Create the pending record for `url`, or reuse the one already stored
    pub async fn submit(&self, url: &str) -> Result<Submission> {
        let url = url.trim();
        if url.is_empty() {
            return Err(CodepulseError::Config("URL is required".to_string()));
        }

        let (repo, created) = self.store.create_or_fetch(url).await?;
        if created {
            info!("Registered repository {} ({})", repo.name, repo.id);
            return Ok(Submission::Created(repo));
        }
        if repo.status == RepoStatus::Completed {
            return Ok(Submission::AlreadyCompleted(repo));
        }
        Ok(Submission::Existing(repo))
    }

    /// Submit `url` and drive the run to a terminal status in the calling task
    pub async fn analyze(&self, url: &str) -> Result<RunOutcome> {
        let repo = match self.submit(url).await? {
            Submission::AlreadyCompleted(repo) => {
                info!("Analysis already exists for {}; skipping", repo.url);
                return Ok(RunOutcome::Skipped(repo));
            }
            submission => submission.into_repository(),
        };

        let Some(_guard) = self.claim(&repo.id) else {
            info!("Analysis already running for {}", repo.url);
            return Ok(RunOutcome::AlreadyRunning(repo));
        };

        self.run(repo).await
    }

    /// Fire-and-forget variant of [`Engine::analyze`]
    pub fn spawn_analysis(&self, url: &str) -> JoinHandle<Result<RunOutcome>> {
        let engine = self.clone();
        let url = url.to_string();
        tokio::spawn(async move { engine.analyze(&url).await })
    }

    /// Look a repository up by id, falling back to its URL
    pub async fn resolve(&self, id_or_url: &str) -> Result<Repository> {
        if let Some(repo) = self.store.get_repository(id_or_url).await? {
            return Ok(repo);
        }
        self.store
            .find_by_url(id_or_url.trim())
            .await?
            .ok_or_else(|| CodepulseError::NotFound(format!("repository {}", id_or_url)))
    }

    pub async fn get_repository(&self, id: &str) -> Result<Option<Repository>> {
        self.store.get_repository(id).await
    }

    pub async fn find_by_url(&self, url: &str) -> Result<Option<Repository>> {
        self.store.find_by_url(url.trim()).await
    }

    pub async fn list_repositories(&self) -> Result<Vec<Repository>> {
        self.store.list_repositories().await
    }

    pub async fn list_files(&self, repo_id: &str) -> Result<Vec<FileRecord>> {
        self.store.list_files(repo_id).await
    }

    pub async fn list_dependencies(&self, repo_id: &str) -> Result<Vec<DependencyEdge>> {
        self.store.list_dependencies(repo_id).await
    }

    /// Repository chat; shares the provider but not the analysis call path
    pub async fn ask(&self, repo_id: &str, query: &str) -> Result<Availability<String>> {
        let repo = self
            .store
            .get_repository(repo_id)
            .await?
            .ok_or_else(|| CodepulseError::NotFound("Repository context not found".to_string()))?;
        Ok(self.analyst.ask(&repo.name, query).await)
    }

    pub async fn clear_records(&self) -> Result<()> {
        self.store.clear().await
    }

    fn claim(&self, repo_id: &str) -> Option<InFlightGuard> {
        let mut registry = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !registry.insert(repo_id.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            registry: Arc::clone(&self.in_flight),
            repo_id: repo_id.to_string(),
        })
    }

    async fn run(&self, repo: Repository) -> Result<RunOutcome> {
        let started = Instant::now();
        info!("🔍 Starting analysis of {} ({})", repo.url, repo.id);

        let repo = self.transition(&repo, RepoStatus::Processing, RepositoryUpdate::default()).await?;

        let (mut report, architecture) = match self.execute(&repo).await {
            Ok(done) => done,
            Err(e) => return self.fail(&repo, e).await,
        };
        report.elapsed_ms = started.elapsed().as_millis();

        let update = RepositoryUpdate {
            architecture: Some(architecture),
            primary_language: report.primary_language.clone(),
            ..Default::default()
        };
        let repository = match self.transition(&repo, RepoStatus::Completed, update).await {
            Ok(repository) => repository,
            Err(e) => return self.fail(&repo, e).await,
        };

        info!(
            "✅ {}: {} of {} files analyzed, {} dependency edges, {} batches in {}ms",
            repository.name,
            report.files_analyzed,
            report.files_classified,
            report.edges_persisted,
            report.batches,
            report.elapsed_ms
        );
        if report.files_failed > 0 {
            warn!("{} files failed analysis: {:?}", report.files_failed, report.failures_by_kind);
        }

        Ok(RunOutcome::Completed { repository, report })
    }

    /// Terminal write for a run that cannot complete. Only a store that also
    /// rejects this write leaves the repository in `processing`.
    async fn fail(&self, repo: &Repository, cause: CodepulseError) -> Result<RunOutcome> {
        error!("Analysis of {} failed: {}", repo.url, cause);
        match self.transition(repo, RepoStatus::Failed, RepositoryUpdate::default()).await {
            Ok(repository) => Ok(RunOutcome::Failed {
                repository,
                reason: cause.to_string(),
            }),
            Err(e) => {
                error!("Could not mark {} as failed: {}", repo.id, e);
                Err(e)
            }
        }
    }

    /// Purge, acquire, process and release the snapshot. Cleanup happens before
    /// returning on every path so the terminal status is only written afterwards.
    async fn execute(&self, repo: &Repository) -> Result<(RunReport, String)> {
        if self.config.pipeline.purge_before_rerun {
            let removed = self.store.purge_repository_records(&repo.id).await?;
            if removed > 0 {
                info!("Purged {} records from a previous run of {}", removed, repo.name);
            }
        }

        let snapshot = Snapshot::prepare(&self.config.workspace.temp_dir, &repo.id).await?;
        let result = self.process_snapshot(repo, snapshot.path()).await;
        snapshot.cleanup().await;
        result
    }

    async fn process_snapshot(&self, repo: &Repository, root: &Path) -> Result<(RunReport, String)> {
        self.acquirer.acquire(&repo.url, root).await?;

        let walker = self.walker.clone();
        let walk_root = root.to_path_buf();
        let files = tokio::task::spawn_blocking(move || walker.walk(&walk_root))
            .await
            .map_err(|e| CodepulseError::FileSystem(format!("walker task failed: {}", e)))??;

        let code_files: Vec<FileDescriptor> = files
            .iter()
            .filter(|f| self.classifier.is_code_file(&f.name))
            .cloned()
            .collect();
        info!(
            "📖 {} files walked, {} classified as source",
            files.len(),
            code_files.len()
        );

        let accumulator = ResultAccumulator::new(Arc::clone(&self.store), &repo.id, &self.config.pipeline);
        let schedule = self
            .scheduler
            .run(code_files, |file| self.analyze_file(&accumulator, file))
            .await;

        let paths: Vec<String> = files.iter().map(|f| f.rel_path.clone()).collect();
        let architecture = self.analyst.summarize_architecture(&repo.name, &paths).await;

        let tally = accumulator.tally();
        let report = RunReport {
            files_walked: files.len(),
            files_classified: schedule.items,
            batches: schedule.batches,
            throttle_pauses: schedule.throttle_pauses,
            files_analyzed: tally.files_analyzed,
            files_failed: tally.files_failed,
            primary_language: tally.primary_language(),
            failures_by_kind: tally.failures_by_kind,
            records_persisted: tally.records_persisted,
            edges_persisted: tally.edges_persisted,
            persistence_failures: tally.persistence_failures,
            summary_degraded: architecture == SUMMARY_UNAVAILABLE,
            elapsed_ms: 0,
        };

        Ok((report, architecture))
    }

    async fn analyze_file(&self, accumulator: &ResultAccumulator, file: FileDescriptor) {
        let language = self.classifier.language_for(&file.name);

        // Invalid UTF-8 becomes U+FFFD; only I/O errors fail the file
        let (content, result) = match tokio::fs::read(&file.abs_path).await {
            Ok(bytes) => {
                let content = String::from_utf8_lossy(&bytes).into_owned();
                let result = self.analyst.try_analyze_file(&content, &file.name).await;
                (content, result)
            }
            Err(e) => (String::new(), Err(AnalysisError::Read(e.to_string()))),
        };

        accumulator
            .accept(FileOutcome {
                file: &file,
                language,
                content: &content,
                result,
            })
            .await;
    }

    async fn transition(
        &self,
        repo: &Repository,
        next: RepoStatus,
        mut update: RepositoryUpdate,
    ) -> Result<Repository> {
        if !repo.status.can_transition_to(next) {
            return Err(CodepulseError::InvalidTransition {
                repo_id: repo.id.clone(),
                from: repo.status.to_string(),
                to: next.to_string(),
            });
        }
        debug!("{}: {} -> {}", repo.id, repo.status, next);
        update.status = Some(next);
        self.store.update_repository(&repo.id, update).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::llm::provider::{CompletionPurpose, CompletionRequest};
    use async_trait::async_trait;
    use assert_fs::prelude::*;
    use predicates::prelude::*;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// Answers file prompts from a lookup table keyed by file name
    #[derive(Default)]
    struct ScriptedProvider {
        replies: HashMap<String, std::result::Result<String, AnalysisError>>,
        slow_files: HashSet<String>,
        summary: Option<String>,
        /// Runs before each file reply, with the file name
        on_file: Option<Arc<dyn Fn(&str) + Send + Sync>>,
        file_calls: AtomicUsize,
        summary_calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn file_name(prompt: &str) -> String {
            prompt
                .lines()
                .next()
                .and_then(|line| line.strip_prefix("File: "))
                .unwrap_or_default()
                .to_string()
        }
    }

    #[async_trait]
    impl CompletionProvider for ScriptedProvider {
        async fn complete(&self, request: CompletionRequest) -> std::result::Result<String, AnalysisError> {
            match request.purpose {
                CompletionPurpose::FileAnalysis => {
                    self.file_calls.fetch_add(1, Ordering::SeqCst);
                    let name = Self::file_name(&request.user);
                    if let Some(hook) = &self.on_file {
                        hook(&name);
                    }
                    if self.slow_files.contains(&name) {
                        tokio::time::sleep(Duration::from_secs(3)).await;
                    }
                    self.replies.get(&name).cloned().unwrap_or_else(|| {
                        Ok(format!(
                            r#"{{"explanation":"Explains {}","functions":["run()"],"imports":[]}}"#,
                            name
                        ))
                    })
                }
                CompletionPurpose::ArchitectureSummary => {
                    self.summary_calls.fetch_add(1, Ordering::SeqCst);
                    self.summary
                        .clone()
                        .ok_or_else(|| AnalysisError::Network("connection reset".to_string()))
                }
                CompletionPurpose::Chat => Ok(format!("About: {}", request.user)),
            }
        }

        fn provider_name(&self) -> &str {
            "scripted"
        }
    }

    /// Writes a fixed file tree instead of cloning; optionally waits for a signal first
    #[derive(Default)]
    struct FixtureAcquirer {
        files: Vec<(String, String)>,
        raw_files: Vec<(String, Vec<u8>)>,
        gate: Option<Arc<Notify>>,
        /// Snapshot directory of the latest acquisition
        root: Arc<Mutex<Option<PathBuf>>>,
    }

    impl FixtureAcquirer {
        fn new(files: &[(&str, &str)]) -> Self {
            Self {
                files: files
                    .iter()
                    .map(|(p, c)| (p.to_string(), c.to_string()))
                    .collect(),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl SourceAcquirer for FixtureAcquirer {
        async fn acquire(&self, _url: &str, target: &Path) -> Result<()> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            *self.root.lock().unwrap() = Some(target.to_path_buf());
            let text = self.files.iter().map(|(p, c)| (p, c.as_bytes()));
            let raw = self.raw_files.iter().map(|(p, c)| (p, c.as_slice()));
            for (rel, content) in text.chain(raw) {
                let path = target.join(rel);
                tokio::fs::create_dir_all(path.parent().unwrap()).await?;
                tokio::fs::write(path, content).await?;
            }
            Ok(())
        }
    }

    /// Memory store that remembers every status it wrote, and can be told to fail
    #[derive(Default)]
    struct RecordingStore {
        inner: MemoryStore,
        statuses: Mutex<Vec<RepoStatus>>,
        fail_purge: bool,
        reject_status: Option<RepoStatus>,
    }

    impl RecordingStore {
        fn statuses(&self) -> Vec<RepoStatus> {
            self.statuses.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RecordStore for RecordingStore {
        async fn create_or_fetch(&self, url: &str) -> Result<(Repository, bool)> {
            let (repo, created) = self.inner.create_or_fetch(url).await?;
            if created {
                self.statuses.lock().unwrap().push(repo.status);
            }
            Ok((repo, created))
        }

        async fn update_repository(&self, id: &str, update: RepositoryUpdate) -> Result<Repository> {
            let status = update.status;
            if status.is_some() && status == self.reject_status {
                return Err(CodepulseError::Store("disk gone".to_string()));
            }
            let repo = self.inner.update_repository(id, update).await?;
            if let Some(status) = status {
                self.statuses.lock().unwrap().push(status);
            }
            Ok(repo)
        }

        async fn append_file(&self, record: FileRecord) -> Result<()> {
            self.inner.append_file(record).await
        }

        async fn append_dependency(&self, edge: DependencyEdge) -> Result<()> {
            self.inner.append_dependency(edge).await
        }

        async fn purge_repository_records(&self, id: &str) -> Result<usize> {
            if self.fail_purge {
                return Err(CodepulseError::Store("disk gone".to_string()));
            }
            self.inner.purge_repository_records(id).await
        }

        async fn get_repository(&self, id: &str) -> Result<Option<Repository>> {
            self.inner.get_repository(id).await
        }

        async fn find_by_url(&self, url: &str) -> Result<Option<Repository>> {
            self.inner.find_by_url(url).await
        }

        async fn list_repositories(&self) -> Result<Vec<Repository>> {
            self.inner.list_repositories().await
        }

        async fn list_files(&self, repo_id: &str) -> Result<Vec<FileRecord>> {
            self.inner.list_files(repo_id).await
        }

        async fn list_dependencies(&self, repo_id: &str) -> Result<Vec<DependencyEdge>> {
            self.inner.list_dependencies(repo_id).await
        }

        async fn clear(&self) -> Result<()> {
            self.inner.clear().await
        }
    }

    const URL: &str = "https://github.com/acme/widgets";

    fn test_config(temp_dir: &Path) -> Config {
        let mut config = Config::default();
        config.workspace.temp_dir = temp_dir.to_path_buf();
        config.pipeline.batch_delay_ms = 10;
        config.pipeline.call_timeout_secs = 5;
        config
    }

    fn twelve_file_repo() -> Vec<(String, String)> {
        let mut files: Vec<(String, String)> = (0..12)
            .map(|i| (format!("src/module{:02}.ts", i), format!("export const v{} = {};", i, i)))
            .collect();
        files.push(("README.md".to_string(), "# widgets".to_string()));
        files.push(("assets/logo.png".to_string(), "PNG".to_string()));
        files.push(("node_modules/lodash/index.js".to_string(), "module.exports = {}".to_string()));
        files.push((".git/HEAD".to_string(), "ref: refs/heads/main".to_string()));
        files
    }

    fn engine(
        config: Config,
        store: Arc<dyn RecordStore>,
        acquirer: Arc<dyn SourceAcquirer>,
        provider: Arc<dyn CompletionProvider>,
    ) -> Engine {
        Engine::with_components(config, store, acquirer, provider).unwrap()
    }

    #[tokio::test]
    async fn twelve_files_complete_in_three_batches() {
        let temp = assert_fs::TempDir::new().unwrap();
        let store = Arc::new(RecordingStore::default());
        let provider = Arc::new(ScriptedProvider {
            summary: Some("A TypeScript library split into small modules.".to_string()),
            ..Default::default()
        });
        let acquirer = FixtureAcquirer {
            files: twelve_file_repo(),
            ..Default::default()
        };
        let engine = engine(test_config(temp.path()), store.clone(), Arc::new(acquirer), provider.clone());

        let outcome = engine.analyze(URL).await.unwrap();
        let RunOutcome::Completed { repository, report } = outcome else {
            panic!("expected completion, got {:?}", outcome);
        };

        assert_eq!(report.files_classified, 12);
        assert_eq!(report.files_walked, 14);
        assert_eq!(report.batches, 3);
        assert_eq!(report.throttle_pauses, 2);
        assert_eq!(report.files_analyzed, 12);
        assert_eq!(report.records_persisted, 12);
        assert!(!report.summary_degraded);
        assert_eq!(report.primary_language.as_deref(), Some("typescript"));

        assert_eq!(repository.status, RepoStatus::Completed);
        assert_eq!(
            repository.architecture.as_deref(),
            Some("A TypeScript library split into small modules.")
        );
        assert_eq!(repository.primary_language.as_deref(), Some("typescript"));
        assert_eq!(provider.file_calls.load(Ordering::SeqCst), 12);
        assert_eq!(provider.summary_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            store.statuses(),
            vec![RepoStatus::Pending, RepoStatus::Processing, RepoStatus::Completed]
        );
        assert_eq!(store.list_files(&repository.id).await.unwrap().len(), 12);
        temp.child(&repository.id).assert(predicate::path::missing());
    }

    #[tokio::test]
    async fn acquisition_failure_marks_repository_failed() {
        let temp = assert_fs::TempDir::new().unwrap();
        let store = Arc::new(RecordingStore::default());
        let engine = engine(
            test_config(temp.path()),
            store.clone(),
            Arc::new(GitAcquirer::new(Duration::from_secs(5))),
            Arc::new(ScriptedProvider::default()),
        );

        let outcome = engine.analyze("not a valid url").await.unwrap();
        let RunOutcome::Failed { repository, reason } = outcome else {
            panic!("expected failure, got {:?}", outcome);
        };

        assert!(reason.contains("acquisition failed"), "reason: {}", reason);
        assert_eq!(repository.status, RepoStatus::Failed);
        assert_eq!(
            store.statuses(),
            vec![RepoStatus::Pending, RepoStatus::Processing, RepoStatus::Failed]
        );
        temp.child(&repository.id).assert(predicate::path::missing());
        assert!(store.list_files(&repository.id).await.unwrap().is_empty());
        assert!(store.list_dependencies(&repository.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failing_files_are_skipped_without_stopping_later_batches() {
        let temp = assert_fs::TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let files: Vec<(String, String)> = (0..7)
            .map(|i| (format!("pkg/f{}.py", i), "import os".to_string()))
            .collect();

        let mut replies = HashMap::new();
        replies.insert(
            "f0.py".to_string(),
            Err(AnalysisError::UpstreamRejected {
                status: 500,
                message: "internal error".to_string(),
            }),
        );
        replies.insert("f4.py".to_string(), Ok("this is not json".to_string()));
        let provider = Arc::new(ScriptedProvider {
            replies,
            summary: Some("Python package".to_string()),
            ..Default::default()
        });

        let mut config = test_config(temp.path());
        config.pipeline.batch_size = 3;
        let acquirer = FixtureAcquirer {
            files,
            ..Default::default()
        };
        let engine = engine(config, store.clone(), Arc::new(acquirer), provider);

        let outcome = engine.analyze(URL).await.unwrap();
        let RunOutcome::Completed { repository, report } = outcome else {
            panic!("expected completion, got {:?}", outcome);
        };

        assert_eq!(report.batches, 3);
        assert_eq!(report.files_analyzed, 5);
        assert_eq!(report.files_failed, 2);
        assert_eq!(report.failures_by_kind.get("upstream_rejected"), Some(&1));
        assert_eq!(report.failures_by_kind.get("parse"), Some(&1));

        let paths: Vec<String> = store
            .list_files(&repository.id)
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.path)
            .collect();
        assert_eq!(paths.len(), 5);
        assert!(!paths.contains(&"pkg/f0.py".to_string()));
        assert!(!paths.contains(&"pkg/f4.py".to_string()));
        assert!(paths.contains(&"pkg/f6.py".to_string()));
    }

    #[tokio::test]
    async fn declared_imports_become_edges_even_when_unresolved() {
        let temp = assert_fs::TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let mut replies = HashMap::new();
        replies.insert(
            "index.ts".to_string(),
            Ok(r#"{"explanation":"Entry","functions":[],"imports":["./a.ts","lodash"]}"#.to_string()),
        );
        let provider = Arc::new(ScriptedProvider {
            replies,
            summary: Some("Tiny app".to_string()),
            ..Default::default()
        });
        let acquirer = FixtureAcquirer::new(&[("src/index.ts", "import './a.ts'; import 'lodash';")]);
        let engine = engine(test_config(temp.path()), store.clone(), Arc::new(acquirer), provider);

        let outcome = engine.analyze(URL).await.unwrap();
        let repo_id = outcome.repository().id.clone();

        let edges = engine.list_dependencies(&repo_id).await.unwrap();
        assert_eq!(edges.len(), 2);
        assert!(edges.iter().all(|e| e.source == "src/index.ts"));
        let targets: HashSet<&str> = edges.iter().map(|e| e.target.as_str()).collect();
        assert_eq!(targets, HashSet::from(["./a.ts", "lodash"]));
    }

    #[tokio::test]
    async fn summary_failure_still_completes_with_placeholder() {
        let temp = assert_fs::TempDir::new().unwrap();
        let acquirer = FixtureAcquirer::new(&[("main.go", "package main")]);
        let engine = engine(
            test_config(temp.path()),
            Arc::new(MemoryStore::new()),
            Arc::new(acquirer),
            Arc::new(ScriptedProvider::default()),
        );

        let outcome = engine.analyze(URL).await.unwrap();
        let RunOutcome::Completed { repository, report } = outcome else {
            panic!("expected completion, got {:?}", outcome);
        };
        assert!(report.summary_degraded);
        assert_eq!(repository.architecture.as_deref(), Some(SUMMARY_UNAVAILABLE));
    }

    #[tokio::test]
    async fn stuck_upstream_call_counts_as_timeout() {
        let temp = assert_fs::TempDir::new().unwrap();
        let provider = Arc::new(ScriptedProvider {
            slow_files: HashSet::from(["slow.rs".to_string()]),
            summary: Some("Rust crate".to_string()),
            ..Default::default()
        });
        let mut config = test_config(temp.path());
        config.pipeline.call_timeout_secs = 1;
        let acquirer = FixtureAcquirer::new(&[("src/fast.rs", "fn a() {}"), ("src/slow.rs", "fn b() {}")]);
        let engine = engine(config, Arc::new(MemoryStore::new()), Arc::new(acquirer), provider);

        let RunOutcome::Completed { report, .. } = engine.analyze(URL).await.unwrap() else {
            panic!("expected completion");
        };
        assert_eq!(report.files_analyzed, 1);
        assert_eq!(report.failures_by_kind.get("timeout"), Some(&1));
    }

    #[tokio::test]
    async fn completed_repository_is_not_rerun() {
        let temp = assert_fs::TempDir::new().unwrap();
        let provider = Arc::new(ScriptedProvider {
            summary: Some("Done".to_string()),
            ..Default::default()
        });
        let acquirer = FixtureAcquirer::new(&[("lib.rs", "pub fn x() {}")]);
        let engine = engine(
            test_config(temp.path()),
            Arc::new(MemoryStore::new()),
            Arc::new(acquirer),
            provider.clone(),
        );

        assert!(matches!(engine.analyze(URL).await.unwrap(), RunOutcome::Completed { .. }));
        let second = engine.analyze(URL).await.unwrap();
        assert!(matches!(second, RunOutcome::Skipped(ref repo) if repo.status == RepoStatus::Completed));
        assert_eq!(provider.file_calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.list_repositories().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rerun_after_failure_purges_previous_records() {
        let temp = assert_fs::TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let (repo, _) = store.create_or_fetch(URL).await.unwrap();
        store
            .update_repository(&repo.id, RepositoryUpdate::status(RepoStatus::Failed))
            .await
            .unwrap();
        store
            .append_file(FileRecord {
                repo_id: repo.id.clone(),
                name: "stale.ts".to_string(),
                path: "stale.ts".to_string(),
                kind: crate::core::models::FileKind::File,
                explanation: "old".to_string(),
                functions: vec![],
                imports: vec![],
                language: None,
                content: String::new(),
            })
            .await
            .unwrap();

        let provider = Arc::new(ScriptedProvider {
            summary: Some("Fresh".to_string()),
            ..Default::default()
        });
        let acquirer = FixtureAcquirer::new(&[("fresh.ts", "export {}")]);
        let engine = engine(test_config(temp.path()), store.clone(), Arc::new(acquirer), provider);

        let outcome = engine.analyze(URL).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Completed { .. }));

        let paths: Vec<String> = store
            .list_files(&repo.id)
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.path)
            .collect();
        assert_eq!(paths, vec!["fresh.ts".to_string()]);
    }

    #[tokio::test]
    async fn second_request_during_a_run_does_not_start_another() {
        let temp = assert_fs::TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let gate = Arc::new(Notify::new());
        let acquirer = FixtureAcquirer {
            files: vec![("app.js".to_string(), "console.log(1)".to_string())],
            gate: Some(Arc::clone(&gate)),
            ..Default::default()
        };
        let provider = Arc::new(ScriptedProvider {
            summary: Some("Script".to_string()),
            ..Default::default()
        });
        let engine = engine(test_config(temp.path()), store.clone(), Arc::new(acquirer), provider);

        let first = engine.spawn_analysis(URL);

        // Wait until the background run has flipped the status
        let mut processing = false;
        for _ in 0..200 {
            if let Some(repo) = store.find_by_url(URL).await.unwrap() {
                if repo.status == RepoStatus::Processing {
                    processing = true;
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(processing);

        let second = engine.analyze(URL).await.unwrap();
        assert!(matches!(second, RunOutcome::AlreadyRunning(_)));

        gate.notify_one();
        let first = first.await.unwrap().unwrap();
        assert!(matches!(first, RunOutcome::Completed { .. }));
        assert_eq!(store.list_repositories().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn store_failure_mid_run_marks_repository_failed() {
        let temp = assert_fs::TempDir::new().unwrap();
        let store = Arc::new(RecordingStore {
            fail_purge: true,
            ..Default::default()
        });
        let provider = Arc::new(ScriptedProvider {
            summary: Some("Unused".to_string()),
            ..Default::default()
        });
        let engine = engine(
            test_config(temp.path()),
            store.clone(),
            Arc::new(FixtureAcquirer::new(&[("main.go", "package main")])),
            provider.clone(),
        );

        let outcome = engine.analyze(URL).await.unwrap();
        let RunOutcome::Failed { repository, reason } = outcome else {
            panic!("expected failure, got {:?}", outcome);
        };
        assert!(reason.contains("disk gone"), "reason: {}", reason);
        assert_eq!(repository.status, RepoStatus::Failed);
        assert_eq!(
            store.statuses(),
            vec![RepoStatus::Pending, RepoStatus::Processing, RepoStatus::Failed]
        );
        assert_eq!(provider.file_calls.load(Ordering::SeqCst), 0);
        temp.child(&repository.id).assert(predicate::path::missing());
    }

    #[tokio::test]
    async fn rejected_completion_write_falls_back_to_failed() {
        let temp = assert_fs::TempDir::new().unwrap();
        let store = Arc::new(RecordingStore {
            reject_status: Some(RepoStatus::Completed),
            ..Default::default()
        });
        let provider = Arc::new(ScriptedProvider {
            summary: Some("Go service".to_string()),
            ..Default::default()
        });
        let engine = engine(
            test_config(temp.path()),
            store.clone(),
            Arc::new(FixtureAcquirer::new(&[("main.go", "package main")])),
            provider,
        );

        let outcome = engine.analyze(URL).await.unwrap();
        assert!(
            matches!(outcome, RunOutcome::Failed { ref repository, .. } if repository.status == RepoStatus::Failed),
            "got {:?}",
            outcome
        );
        assert_eq!(
            store.statuses(),
            vec![RepoStatus::Pending, RepoStatus::Processing, RepoStatus::Failed]
        );
        let stored = store.find_by_url(URL).await.unwrap().unwrap();
        assert_eq!(stored.status, RepoStatus::Failed);
    }

    #[tokio::test]
    async fn unreadable_file_is_counted_and_later_batches_continue() {
        let temp = assert_fs::TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let acquirer = FixtureAcquirer::new(&[
            ("first.ts", "export const a = 1;"),
            ("gone.ts", "export const b = 2;"),
            ("last.ts", "export const c = 3;"),
        ]);

        // Analyzing the first file deletes the second before its batch reads it
        let root = Arc::clone(&acquirer.root);
        let provider = Arc::new(ScriptedProvider {
            summary: Some("Three modules".to_string()),
            on_file: Some(Arc::new(move |name: &str| {
                if name == "first.ts" {
                    if let Some(root) = root.lock().unwrap().as_ref() {
                        std::fs::remove_file(root.join("gone.ts")).unwrap();
                    }
                }
            })),
            ..Default::default()
        });

        let mut config = test_config(temp.path());
        config.pipeline.batch_size = 1;
        let engine = engine(config, store.clone(), Arc::new(acquirer), provider.clone());

        let outcome = engine.analyze(URL).await.unwrap();
        let RunOutcome::Completed { repository, report } = outcome else {
            panic!("expected completion, got {:?}", outcome);
        };

        assert_eq!(report.batches, 3);
        assert_eq!(report.files_analyzed, 2);
        assert_eq!(report.files_failed, 1);
        assert_eq!(report.failures_by_kind.get("read"), Some(&1));
        assert_eq!(provider.file_calls.load(Ordering::SeqCst), 2);

        let paths: Vec<String> = store
            .list_files(&repository.id)
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.path)
            .collect();
        assert_eq!(paths, vec!["first.ts".to_string(), "last.ts".to_string()]);
    }

    #[tokio::test]
    async fn non_utf8_source_is_decoded_lossily() {
        let temp = assert_fs::TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let acquirer = FixtureAcquirer {
            raw_files: vec![(
                "src/legacy.ts".to_string(),
                b"// caf\xe9 menu\nexport const x = 1;\n".to_vec(),
            )],
            ..Default::default()
        };
        let provider = Arc::new(ScriptedProvider {
            summary: Some("Legacy module".to_string()),
            ..Default::default()
        });
        let engine = engine(test_config(temp.path()), store.clone(), Arc::new(acquirer), provider);

        let RunOutcome::Completed { repository, report } = engine.analyze(URL).await.unwrap() else {
            panic!("expected completion");
        };
        assert_eq!(report.files_analyzed, 1);
        assert_eq!(report.files_failed, 0);

        let files = store.list_files(&repository.id).await.unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].content.contains('\u{FFFD}'));
        assert!(files[0].content.contains("export const x"));
    }

    #[tokio::test]
    async fn submit_reuses_the_record_for_a_known_url() {
        let temp = assert_fs::TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let engine = engine(
            test_config(temp.path()),
            store.clone(),
            Arc::new(FixtureAcquirer::new(&[])),
            Arc::new(ScriptedProvider::default()),
        );

        let first = engine.submit("  https://github.com/acme/widgets.git/ ").await.unwrap();
        let Submission::Created(created) = first else {
            panic!("expected a new record, got {:?}", first);
        };
        assert_eq!(created.name, "widgets");
        assert_eq!(created.status, RepoStatus::Pending);

        let second = engine.submit("https://github.com/acme/widgets.git/").await.unwrap();
        assert!(matches!(second, Submission::Existing(ref repo) if repo.id == created.id));

        store
            .update_repository(&created.id, RepositoryUpdate::status(RepoStatus::Completed))
            .await
            .unwrap();
        let third = engine.submit("https://github.com/acme/widgets.git/").await.unwrap();
        assert!(matches!(third, Submission::AlreadyCompleted(_)));
        assert_eq!(store.list_repositories().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rejects_empty_url() {
        let temp = assert_fs::TempDir::new().unwrap();
        let engine = engine(
            test_config(temp.path()),
            Arc::new(MemoryStore::new()),
            Arc::new(FixtureAcquirer::new(&[])),
            Arc::new(ScriptedProvider::default()),
        );
        assert!(matches!(engine.analyze("   ").await, Err(CodepulseError::Config(_))));
    }

    #[tokio::test]
    async fn ask_requires_a_known_repository() {
        let temp = assert_fs::TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let (repo, _) = store.create_or_fetch(URL).await.unwrap();
        let engine = engine(
            test_config(temp.path()),
            store,
            Arc::new(FixtureAcquirer::new(&[])),
            Arc::new(ScriptedProvider::default()),
        );

        let reply = engine.ask(&repo.id, "Where is routing?").await.unwrap();
        assert_eq!(reply, Availability::Available("About: Where is routing?".to_string()));

        assert!(matches!(
            engine.ask("unknown", "hi").await,
            Err(CodepulseError::NotFound(_))
        ));
        assert_eq!(engine.resolve(URL).await.unwrap().id, repo.id);
    }
}
