// src/core/walker.rs
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

use crate::config::ScanConfig;
use crate::error::{CodepulseError, Result};

use super::models::FileKind;

/// A leaf file found in a snapshot. Lives only for the duration of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct FileDescriptor {
    pub name: String,
    pub abs_path: PathBuf,
    /// Relative to the snapshot root, always `/`-separated
    pub rel_path: String,
    pub kind: FileKind,
}

/// Directory names whose whole subtree is skipped
#[derive(Debug, Clone)]
pub struct ExclusionPolicy {
    names: HashSet<String>,
}

impl ExclusionPolicy {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn excludes(&self, dir_name: &str) -> bool {
        self.names.contains(dir_name)
    }
}

impl From<&ScanConfig> for ExclusionPolicy {
    fn from(config: &ScanConfig) -> Self {
        Self::new(config.excluded_dirs.iter().cloned())
    }
}

/// Depth-first enumeration of snapshot files.
///
/// Entries are visited in file-name order inside each directory, so two walks of
/// the same tree yield the same sequence. Traversal is iterative; symlinks are
/// not followed.
#[derive(Debug, Clone)]
pub struct TreeWalker {
    policy: ExclusionPolicy,
}

impl TreeWalker {
    pub fn new(policy: ExclusionPolicy) -> Self {
        Self { policy }
    }

    pub fn walk<P: AsRef<Path>>(&self, root: P) -> Result<Vec<FileDescriptor>> {
        let root = root.as_ref();
        let mut files = Vec::new();

        let walker = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| !self.is_excluded(entry));

        for entry in walker {
            let entry = entry.map_err(|e| CodepulseError::FileSystem(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }

            let rel_path = entry
                .path()
                .strip_prefix(root)
                .map_err(|e| CodepulseError::FileSystem(e.to_string()))?
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            files.push(FileDescriptor {
                name: entry.file_name().to_string_lossy().to_string(),
                abs_path: entry.path().to_path_buf(),
                rel_path,
                kind: FileKind::File,
            });
        }

        Ok(files)
    }

    fn is_excluded(&self, entry: &DirEntry) -> bool {
        // The snapshot root itself is never filtered
        entry.depth() > 0
            && entry.file_type().is_dir()
            && self.policy.excludes(&entry.file_name().to_string_lossy())
    }
}
