//! Preview, elicitation, and logging settings.

use convo_core::logging::LogFormat;
use serde::{Deserialize, Serialize};

/// Budgets for the preview/summarization service.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PreviewSettings {
    /// Hard cap on bytes surfaced by one `show` window.
    pub preview_limit_bytes: u64,
    /// Content above this size is eligible for summarization.
    pub summarize_threshold_bytes: u64,
    /// Chunk size fed to the summarizer.
    pub summarize_chunk_bytes: u64,
    /// Chunk size for pattern scans.
    pub match_chunk_bytes: u64,
    /// Bytes re-read between consecutive scan chunks.
    pub match_overlap_bytes: u64,
    /// Upper bound on hits returned by one scan.
    pub max_matches: usize,
    /// Turns after which a message counts as aged.
    pub aged_after_steps: u32,
    /// Window cap for aged messages.
    pub aged_limit_bytes: u64,
}

impl Default for PreviewSettings {
    fn default() -> Self {
        Self {
            preview_limit_bytes: 16_384,
            summarize_threshold_bytes: 32_768,
            summarize_chunk_bytes: 8_192,
            match_chunk_bytes: 65_536,
            match_overlap_bytes: 256,
            max_matches: 100,
            aged_after_steps: 8,
            aged_limit_bytes: 2_048,
        }
    }
}

/// Interactive elicitation limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ElicitationSettings {
    /// Prompts per request before a validation failure is returned.
    pub max_attempts: u32,
    /// Deadline applied when a request does not carry its own.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_timeout_ms: Option<u64>,
}

impl Default for ElicitationSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            default_timeout_ms: None,
        }
    }
}

/// Logging configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive. `RUST_LOG` wins when set.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl LoggingSettings {
    /// Subscriber output format.
    pub fn format(&self) -> LogFormat {
        if self.json {
            LogFormat::Json
        } else {
            LogFormat::Compact
        }
    }
}
