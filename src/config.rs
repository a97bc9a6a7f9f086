use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{CodepulseError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Local storage used by runs
    pub workspace: WorkspaceConfig,

    /// Snapshot traversal and classification
    pub scan: ScanConfig,

    /// Batching, throttling and request bounds
    pub pipeline: PipelineConfig,

    /// External analysis provider settings
    pub llm: LlmConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Root under which each run creates its snapshot directory
    pub temp_dir: PathBuf,

    /// Record store backend
    #[serde(default)]
    pub store: StoreBackend,

    /// JSON-lines journal backing the `json` store
    pub store_path: PathBuf,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Durable journal at `store_path`
    #[default]
    Json,
    /// Process-local; records vanish when the command exits
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Directory names skipped entirely, subtree included
    pub excluded_dirs: Vec<String>,

    /// Allowed source extensions (without the dot) mapped to a language tag
    pub extensions: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Files analyzed concurrently per batch
    pub batch_size: usize,

    /// Pause between successive batches (milliseconds)
    pub batch_delay_ms: u64,

    /// Byte ceiling of the file content sent for analysis
    pub max_content_bytes: usize,

    /// Byte ceiling of the excerpt stored on each file record
    pub excerpt_bytes: usize,

    /// Maximum number of paths sent to the summary call
    pub summary_path_limit: usize,

    /// Deadline for each external analysis call (seconds)
    pub call_timeout_secs: u64,

    /// Deadline for the shallow clone (seconds)
    pub clone_timeout_secs: u64,

    /// Persist placeholder records for files whose analysis failed
    pub persist_degraded: bool,

    /// Drop file and dependency records of a previous incomplete run before re-running
    pub purge_before_rerun: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Provider flavour (groq, openai); both speak the chat-completions protocol
    pub provider: String,

    /// Base URL override, e.g. for a proxy or a local mock
    pub base_url: Option<String>,

    /// API key; falls back to the `api_key_env` variable
    pub api_key: Option<String>,

    /// Environment variable holding the API key
    pub api_key_env: String,

    /// Model used for per-file analysis
    pub file_model: String,

    /// Model used for the architecture summary
    pub summary_model: String,

    /// Model used for repository chat
    pub chat_model: String,

    /// Temperature for chat answers (0.0 to 1.0)
    pub chat_temperature: f32,

    /// Maximum tokens for LLM responses
    pub max_tokens: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        let mut extensions = BTreeMap::new();
        for (ext, language) in [
            ("ts", "typescript"),
            ("tsx", "typescript"),
            ("js", "javascript"),
            ("jsx", "javascript"),
            ("py", "python"),
            ("java", "java"),
            ("go", "go"),
            ("rs", "rust"),
            ("cpp", "cpp"),
        ] {
            extensions.insert(ext.to_string(), language.to_string());
        }

        Self {
            workspace: WorkspaceConfig {
                temp_dir: std::env::temp_dir().join("codepulse"),
                store: StoreBackend::Json,
                store_path: PathBuf::from(".codepulse/records.jsonl"),
            },
            scan: ScanConfig {
                excluded_dirs: vec![
                    ".git".to_string(),
                    ".hg".to_string(),
                    ".svn".to_string(),
                    "node_modules".to_string(),
                ],
                extensions,
            },
            pipeline: PipelineConfig {
                batch_size: 5,
                batch_delay_ms: 5000,
                max_content_bytes: 5000,
                excerpt_bytes: 500,
                summary_path_limit: 100,
                call_timeout_secs: 60,
                clone_timeout_secs: 300,
                persist_degraded: false,
                purge_before_rerun: true,
            },
            llm: LlmConfig {
                provider: "groq".to_string(),
                base_url: None,
                api_key: None,
                api_key_env: "GROQ_API_KEY".to_string(),
                file_model: "llama-3.1-8b-instant".to_string(),
                summary_model: "llama-3.1-8b-instant".to_string(),
                chat_model: "llama-3.3-70b-versatile".to_string(),
                chat_temperature: 0.6,
                max_tokens: Some(2000),
            },
        }
    }
}

impl LlmConfig {
    /// Chat-completions endpoint root for the configured provider
    pub fn resolved_base_url(&self) -> Result<String> {
        if let Some(url) = &self.base_url {
            return Ok(url.trim_end_matches('/').to_string());
        }

        match self.provider.as_str() {
            "groq" => Ok("https://api.groq.com/openai/v1".to_string()),
            "openai" => Ok("https://api.openai.com/v1".to_string()),
            other => Err(CodepulseError::Config(format!(
                "Unsupported LLM provider: {}",
                other
            ))),
        }
    }

    /// Explicit key first, then the configured environment variable
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var(&self.api_key_env).ok())
            .filter(|key| !key.trim().is_empty())
    }
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&content).map_err(|e| CodepulseError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| CodepulseError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load configuration with fallback to default
    pub fn load_or_default<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        match path {
            Some(p) => {
                if p.as_ref().exists() {
                    Self::load(p)
                } else {
                    Ok(Self::default())
                }
            }
            None => {
                let candidates = ["Codepulse.toml", "codepulse.toml", ".codepulse.toml"];

                for candidate in &candidates {
                    if Path::new(candidate).exists() {
                        return Self::load(candidate);
                    }
                }

                Ok(Self::default())
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.pipeline.batch_size == 0 {
            return Err(CodepulseError::Config(
                "pipeline.batch_size must be at least 1".to_string(),
            ));
        }
        if self.pipeline.max_content_bytes == 0 || self.pipeline.excerpt_bytes == 0 {
            return Err(CodepulseError::Config(
                "pipeline byte ceilings must be non-zero".to_string(),
            ));
        }
        if self.scan.extensions.is_empty() {
            return Err(CodepulseError::Config(
                "scan.extensions must list at least one source extension".to_string(),
            ));
        }
        self.llm.resolved_base_url()?;
        Ok(())
    }
}
