use thiserror::Error;

/// Main error type for Codepulse operations
#[derive(Error, Debug)]
pub enum CodepulseError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Repository acquisition failed: {0}")]
    Acquisition(String),

    #[error("Record store error: {0}")]
    Store(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid status transition for {repo_id}: {from} -> {to}")]
    InvalidTransition {
        repo_id: String,
        from: String,
        to: String,
    },

    #[error("File system error: {0}")]
    FileSystem(String),

    #[error("Pattern error: {0}")]
    Pattern(#[from] regex::Error),
}

pub type Result<T> = std::result::Result<T, CodepulseError>;

/// Failures at the external analysis boundary.
///
/// These never escape a run: per-file failures are tallied by [`AnalysisError::kind`]
/// and summary failures fall back to placeholder text.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnalysisError {
    #[error("network error: {0}")]
    Network(String),

    #[error("upstream call timed out after {0}s")]
    Timeout(u64),

    #[error("upstream rejected request ({status}): {message}")]
    UpstreamRejected { status: u16, message: String },

    #[error("unparseable upstream response: {0}")]
    Parse(String),

    #[error("could not read source file: {0}")]
    Read(String),

    #[error("analysis provider not configured: {0}")]
    Unconfigured(String),
}

impl AnalysisError {
    /// Stable label used when aggregating failure statistics
    pub fn kind(&self) -> &'static str {
        match self {
            AnalysisError::Network(_) => "network",
            AnalysisError::Timeout(_) => "timeout",
            AnalysisError::UpstreamRejected { .. } => "upstream_rejected",
            AnalysisError::Parse(_) => "parse",
            AnalysisError::Read(_) => "read",
            AnalysisError::Unconfigured(_) => "unconfigured",
        }
    }
}

impl From<reqwest::Error> for AnalysisError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AnalysisError::Network(format!("request timed out: {}", err))
        } else if err.is_decode() {
            AnalysisError::Parse(err.to_string())
        } else {
            AnalysisError::Network(err.to_string())
        }
    }
}
