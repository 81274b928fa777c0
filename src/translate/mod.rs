//! Translation layer: glossary engine, language detection, persistent cache, and the
//! pluggable translate capability. Failures are classified, never retried here.

pub mod cache;
pub mod detect;
pub mod glossary;
pub mod openai;

use serde::{Deserialize, Serialize};

/// Source language sentinel meaning "let the backend detect it".
pub const AUTO_LANGUAGE: &str = "auto";

/// Translation request.
#[derive(Debug, Clone, Serialize)]
pub struct TranslateRequest {
    pub text: String,
    /// `None` or `"auto"` lets the backend detect the source language.
    pub source_lang: Option<String>,
    pub target_lang: String,
}

impl TranslateRequest {
    pub fn new(text: impl Into<String>, source_lang: Option<&str>, target_lang: &str) -> Self {
        let source_lang = source_lang
            .map(str::trim)
            .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case(AUTO_LANGUAGE))
            .map(str::to_string);
        Self {
            text: text.into(),
            source_lang,
            target_lang: target_lang.to_string(),
        }
    }
}

/// Token accounting reported by the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

/// Translation result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslateOutput {
    pub result: String,
    pub usage: Option<Usage>,
}

/// Translator trait (adapter for different backends).
#[async_trait::async_trait]
pub trait Translator: Send + Sync {
    async fn translate(&self, request: &TranslateRequest) -> Result<TranslateOutput, TranslateError>;
}

/// Transport-level translate failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranslateError {
    RateLimited { retry_after_ms: Option<u64> },
    ServerError { status: u16 },
    /// The backend answered but the payload could not be understood.
    MalformedResponse(String),
    /// Connection, timeout, TLS or unexpected HTTP status.
    Network(String),
    Unknown(String),
}

/// The user-facing classification of a [`TranslateError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    RateLimited,
    ServerError,
    MalformedResponse,
    NetworkOrProtocolError,
    UnknownTranslationError,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimited | ErrorKind::ServerError | ErrorKind::NetworkOrProtocolError
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::RateLimited => write!(f, "rate_limited"),
            ErrorKind::ServerError => write!(f, "server_error"),
            ErrorKind::MalformedResponse => write!(f, "malformed_response"),
            ErrorKind::NetworkOrProtocolError => write!(f, "network_or_protocol_error"),
            ErrorKind::UnknownTranslationError => write!(f, "unknown_translation_error"),
        }
    }
}

impl TranslateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TranslateError::RateLimited { .. } => ErrorKind::RateLimited,
            TranslateError::ServerError { .. } => ErrorKind::ServerError,
            TranslateError::MalformedResponse(_) => ErrorKind::MalformedResponse,
            TranslateError::Network(_) => ErrorKind::NetworkOrProtocolError,
            TranslateError::Unknown(_) => ErrorKind::UnknownTranslationError,
        }
    }

    /// Whether a caller may reasonably try again.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// The message shown to the user through the display sink.
    pub fn user_message(&self) -> String {
        match self {
            TranslateError::RateLimited { .. } => {
                "Translation failed: too many requests, please try again later.".into()
            }
            TranslateError::ServerError { .. } => {
                "Translation failed: server error, please try again later.".into()
            }
            TranslateError::MalformedResponse(_) => {
                "Translation failed: invalid response from server, please check your network connection."
                    .into()
            }
            TranslateError::Network(_) => "Translation failed: network issue or HTTP error.".into(),
            TranslateError::Unknown(msg) => format!("Translation failed, error: {msg}"),
        }
    }
}

impl std::fmt::Display for TranslateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TranslateError::RateLimited { retry_after_ms: Some(ms) } => {
                write!(f, "rate limited, retry after {ms}ms")
            }
            TranslateError::RateLimited { retry_after_ms: None } => write!(f, "rate limited"),
            TranslateError::ServerError { status } => write!(f, "server error: HTTP {status}"),
            TranslateError::MalformedResponse(msg) => write!(f, "malformed response: {msg}"),
            TranslateError::Network(msg) => write!(f, "network error: {msg}"),
            TranslateError::Unknown(msg) => write!(f, "translation error: {msg}"),
        }
    }
}

impl std::error::Error for TranslateError {}
