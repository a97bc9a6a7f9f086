// src/core/classifier.rs
use std::collections::BTreeMap;
use std::path::Path;

use crate::config::ScanConfig;

/// Decides which walked files are source code worth analyzing
#[derive(Debug, Clone)]
pub struct FileClassifier {
    /// extension (no dot) -> language tag
    extensions: BTreeMap<String, String>,
}

impl FileClassifier {
    pub fn new(config: &ScanConfig) -> Self {
        Self {
            extensions: config.extensions.clone(),
        }
    }

    /// True iff the file name has an allowed source extension.
    ///
    /// A bare dotfile such as `.ts` has no extension, only a stem, so it is not code.
    pub fn is_code_file(&self, file_name: &str) -> bool {
        self.language_for(file_name).is_some()
    }

    pub fn language_for(&self, file_name: &str) -> Option<&str> {
        let extension = Path::new(file_name).extension()?.to_str()?;
        self.extensions.get(extension).map(String::as_str)
    }
}
