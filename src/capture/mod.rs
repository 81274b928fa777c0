//! Chat ingestion: log tailing, encoding resolution, and chat line parsing.
//! Downstream only sees `ChatMessage` values and does not care which source produced them.

pub mod chat_line;
pub mod encoding;
pub mod tailer;

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use encoding::TextEncoding;

/// Where a piece of text entered the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Origin {
    Log,
    Clipboard,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Log => write!(f, "log"),
            Origin::Clipboard => write!(f, "clipboard"),
        }
    }
}

/// One extracted chat record. An empty speaker marks a system message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub speaker: String,
    pub text: String,
    pub origin: Origin,
}

impl ChatMessage {
    pub fn is_system(&self) -> bool {
        self.speaker.is_empty()
    }
}

/// How the log is watched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MonitorMode {
    /// Filesystem notifications; a directory target follows the newest `*.log`.
    #[serde(alias = "efficient")]
    Event,
    /// Fixed-interval re-read; a directory target pins `latest.log`.
    #[serde(alias = "compatible")]
    Polling,
}

impl fmt::Display for MonitorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorMode::Event => write!(f, "event"),
            MonitorMode::Polling => write!(f, "polling"),
        }
    }
}

/// What to do with bytes that are invalid in the current encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodePolicy {
    Strict,
    Replace,
}

impl fmt::Display for DecodePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodePolicy::Strict => write!(f, "strict"),
            DecodePolicy::Replace => write!(f, "replace"),
        }
    }
}

/// The monitored log for one session. Mutated by the tailer on rotation and decode failure.
#[derive(Debug, Clone)]
pub struct LogSource {
    pub path_or_directory: PathBuf,
    pub resolved_current_file: Option<PathBuf>,
    pub monitor_mode: MonitorMode,
    pub user_encoding: Option<TextEncoding>,
    pub resolved_encoding: TextEncoding,
    pub decode_error_policy: DecodePolicy,
}

impl LogSource {
    pub fn new(
        path_or_directory: PathBuf,
        monitor_mode: MonitorMode,
        user_encoding: Option<TextEncoding>,
    ) -> Self {
        Self {
            path_or_directory,
            resolved_current_file: None,
            monitor_mode,
            user_encoding,
            resolved_encoding: user_encoding.unwrap_or(TextEncoding::Utf8),
            decode_error_policy: DecodePolicy::Strict,
        }
    }
}
