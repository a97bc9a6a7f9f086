// src/core/accumulator.rs
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::error::AnalysisError;
use super::llm::FileAnalysis;
use super::models::{truncate_bytes, DependencyEdge, EdgeKind, FileRecord};
use super::store::RecordStore;
use super::walker::FileDescriptor;

/// Counters gathered while a run's batches settle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccumulatorTally {
    pub files_analyzed: usize,
    pub files_failed: usize,
    pub failures_by_kind: BTreeMap<String, usize>,
    pub records_persisted: usize,
    pub edges_persisted: usize,
    pub persistence_failures: usize,
    /// Language tag -> successfully analyzed files
    pub languages: BTreeMap<String, usize>,
}

impl AccumulatorTally {
    /// Most frequent language among analyzed files; ties go to the alphabetically first tag
    pub fn primary_language(&self) -> Option<String> {
        self.languages
            .iter()
            .max_by(|(a_lang, a_count), (b_lang, b_count)| {
                a_count.cmp(b_count).then_with(|| b_lang.cmp(a_lang))
            })
            .map(|(lang, _)| lang.clone())
    }
}

/// One settled per-file analysis, ready to be persisted
pub struct FileOutcome<'a> {
    pub file: &'a FileDescriptor,
    pub language: Option<&'a str>,
    /// Empty when the file could not be read
    pub content: &'a str,
    pub result: Result<FileAnalysis, AnalysisError>,
}

/// Persists per-file results for one run.
///
/// Writes from sibling files may interleave freely; each file's record and
/// edges are independent of every other file's.
pub struct ResultAccumulator {
    store: Arc<dyn RecordStore>,
    repo_id: String,
    excerpt_bytes: usize,
    persist_degraded: bool,
    tally: Mutex<AccumulatorTally>,
}

impl ResultAccumulator {
    pub fn new(store: Arc<dyn RecordStore>, repo_id: &str, config: &PipelineConfig) -> Self {
        Self {
            store,
            repo_id: repo_id.to_string(),
            excerpt_bytes: config.excerpt_bytes,
            persist_degraded: config.persist_degraded,
            tally: Mutex::new(AccumulatorTally::default()),
        }
    }

    pub async fn accept(&self, outcome: FileOutcome<'_>) {
        let FileOutcome { file, language, content, result } = outcome;

        match result {
            Ok(analysis) => {
                self.update(|t| {
                    t.files_analyzed += 1;
                    if let Some(lang) = language {
                        *t.languages.entry(lang.to_string()).or_default() += 1;
                    }
                });
                if self.persist(file, language, content, analysis).await {
                    debug!("Successfully analyzed: {}", file.rel_path);
                }
            }
            Err(e) => {
                warn!("Failed to analyze {} [{}]: {}", file.rel_path, e.kind(), e);
                self.update(|t| {
                    t.files_failed += 1;
                    *t.failures_by_kind.entry(e.kind().to_string()).or_default() += 1;
                });

                if self.persist_degraded {
                    self.persist(file, language, content, FileAnalysis::degraded()).await;
                }
            }
        }
    }

    pub fn tally(&self) -> AccumulatorTally {
        self.tally
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Write the file record, then one edge per declared import. Returns whether the record landed.
    async fn persist(
        &self,
        file: &FileDescriptor,
        language: Option<&str>,
        content: &str,
        analysis: FileAnalysis,
    ) -> bool {
        let imports = analysis.imports.clone();
        let record = FileRecord {
            repo_id: self.repo_id.clone(),
            name: file.name.clone(),
            path: file.rel_path.clone(),
            kind: file.kind,
            explanation: analysis.explanation,
            functions: analysis.functions,
            imports: analysis.imports,
            language: language.map(str::to_string),
            content: truncate_bytes(content, self.excerpt_bytes).to_string(),
        };

        if let Err(e) = self.store.append_file(record).await {
            warn!("Failed to persist file record {}: {}", file.rel_path, e);
            self.update(|t| t.persistence_failures += 1);
            return false;
        }
        self.update(|t| t.records_persisted += 1);

        for target in imports {
            let edge = DependencyEdge {
                repo_id: self.repo_id.clone(),
                source: file.rel_path.clone(),
                target,
                kind: EdgeKind::Import,
            };
            match self.store.append_dependency(edge).await {
                Ok(()) => self.update(|t| t.edges_persisted += 1),
                Err(e) => {
                    warn!("Failed to persist dependency of {}: {}", file.rel_path, e);
                    self.update(|t| t.persistence_failures += 1);
                }
            }
        }
        true
    }

    fn update<F: FnOnce(&mut AccumulatorTally)>(&self, f: F) {
        let mut tally = self.tally.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut tally);
    }
}
