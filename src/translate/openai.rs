//! OpenAI-compatible chat/completions client.
//! Connection pooling via reqwest, token-bucket request spacing, failure classification.
//! No retries here: the scheduler decides whether a classified failure is worth another attempt.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::{debug, warn};

use super::{TranslateError, TranslateOutput, TranslateRequest, Translator, Usage};

/// Connection settings for an OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    /// Base URL up to and including the version segment, e.g. `https://api.openai.com/v1`.
    pub api_base: String,
    pub api_key: String,
    pub model: String,
    pub timeout: Duration,
    /// Minimum spacing between requests (e.g. 100ms = 10 req/s).
    pub min_interval: Duration,
}

pub struct OpenAiTranslator {
    http: reqwest::Client,
    config: OpenAiConfig,
    /// Simple token-bucket: tracks the next allowed request time.
    next_allowed: Arc<tokio::sync::Mutex<Instant>>,
}

impl OpenAiTranslator {
    pub fn new(config: OpenAiConfig) -> Result<Self, TranslateError> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(config.timeout)
            .build()
            .map_err(|e| TranslateError::Unknown(e.to_string()))?;

        Ok(Self {
            http,
            config,
            next_allowed: Arc::new(tokio::sync::Mutex::new(Instant::now())),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.api_base.trim_end_matches('/'))
    }

    /// Wait until the rate limiter allows a request.
    async fn rate_limit_wait(&self) {
        let mut next = self.next_allowed.lock().await;
        let now = Instant::now();
        if *next > now {
            tokio::time::sleep(*next - now).await;
        }
        *next = Instant::now() + self.config.min_interval;
    }
}

#[async_trait::async_trait]
impl Translator for OpenAiTranslator {
    async fn translate(&self, request: &TranslateRequest) -> Result<TranslateOutput, TranslateError> {
        self.rate_limit_wait().await;

        let body = serde_json::json!({
            "model": self.config.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": build_user_prompt(request)}
            ],
            "temperature": 0
        });

        let start = Instant::now();
        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let retry_after_ms = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(|secs| secs * 1000);
            let text = response.text().await.unwrap_or_default();
            warn!(
                status,
                body = %text.chars().take(200).collect::<String>(),
                "translation request rejected"
            );
            return Err(classify_status(status, retry_after_ms, &text));
        }

        let raw = response.text().await.map_err(classify_transport)?;
        let output = parse_completion(&raw)?;
        debug!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            total_tokens = output.usage.map(|u| u.total_tokens).unwrap_or(0),
            "translation_received"
        );
        Ok(output)
    }
}

/// Map a non-success HTTP status to the error taxonomy.
pub fn classify_status(status: u16, retry_after_ms: Option<u64>, body: &str) -> TranslateError {
    match status {
        429 => TranslateError::RateLimited { retry_after_ms },
        500..=599 => TranslateError::ServerError { status },
        400..=499 => TranslateError::Network(format!(
            "HTTP {status}: {}",
            body.chars().take(200).collect::<String>()
        )),
        _ => TranslateError::Network(format!("unexpected HTTP status {status}")),
    }
}

fn classify_transport(e: reqwest::Error) -> TranslateError {
    if e.is_decode() {
        TranslateError::MalformedResponse(e.to_string())
    } else if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
        TranslateError::Network(e.to_string())
    } else {
        TranslateError::Unknown(e.to_string())
    }
}

/// Extract the first choice's content and usage from a chat/completions body.
pub fn parse_completion(raw: &str) -> Result<TranslateOutput, TranslateError> {
    let parsed: CompletionResponse =
        serde_json::from_str(raw).map_err(|e| TranslateError::MalformedResponse(e.to_string()))?;
    let content = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| TranslateError::MalformedResponse("response has no message content".into()))?;
    Ok(TranslateOutput {
        result: content.trim().to_string(),
        usage: parsed.usage,
    })
}

// --- Prompt construction ---

const SYSTEM_PROMPT: &str = "You are a game chat localization engine for the Minecraft community. \
Translate colloquially and keep sentences short. Preserve every Minecraft formatting code \
(such as §c or §l) exactly. Do not translate player names or server names. Leave keyboard \
mashing and garbled text unchanged. Reply with the translated text only.";

fn build_user_prompt(request: &TranslateRequest) -> String {
    let direction = match request.source_lang.as_deref() {
        Some(src) => format!("from {src} to {}", request.target_lang),
        None => format!("to {}", request.target_lang),
    };
    format!(
        "Translate the following text {direction}.\n\n<text_to_translate>\n{}\n</text_to_translate>",
        request.text
    )
}

// --- Response types ---

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::ErrorKind;

    #[test]
    fn status_classification() {
        assert_eq!(
            classify_status(429, Some(2000), ""),
            TranslateError::RateLimited { retry_after_ms: Some(2000) }
        );
        assert_eq!(classify_status(503, None, "").kind(), ErrorKind::ServerError);
        let unauthorized = classify_status(401, None, "bad key");
        assert_eq!(unauthorized.kind(), ErrorKind::NetworkOrProtocolError);
        assert_eq!(unauthorized.to_string(), "network error: HTTP 401: bad key");
        assert!(unauthorized.user_message().contains("HTTP error"));
        assert_eq!(classify_status(404, None, "").kind(), ErrorKind::NetworkOrProtocolError);
        assert_eq!(classify_status(302, None, "").kind(), ErrorKind::NetworkOrProtocolError);
    }

    #[test]
    fn parses_content_and_usage() {
        let raw = r#"{"choices":[{"message":{"role":"assistant","content":" 打得好 \n"}}],
            "usage":{"prompt_tokens":12,"completion_tokens":3,"total_tokens":15}}"#;
        let out = parse_completion(raw).unwrap();
        assert_eq!(out.result, "打得好");
        assert_eq!(
            out.usage,
            Some(Usage { prompt_tokens: 12, completion_tokens: 3, total_tokens: 15 })
        );
    }

    #[test]
    fn malformed_bodies() {
        assert_eq!(
            parse_completion("<html>").unwrap_err().kind(),
            ErrorKind::MalformedResponse
        );
        assert_eq!(
            parse_completion(r#"{"choices":[]}"#).unwrap_err().kind(),
            ErrorKind::MalformedResponse
        );
    }

    #[test]
    fn prompt_mentions_direction() {
        let auto = TranslateRequest::new("gg", Some("auto"), "zh-CN");
        assert!(build_user_prompt(&auto).starts_with("Translate the following text to zh-CN."));
        let pinned = TranslateRequest::new("gg", Some("en"), "zh-CN");
        assert!(build_user_prompt(&pinned).contains("from en to zh-CN"));
        assert!(build_user_prompt(&pinned).contains("<text_to_translate>\ngg\n"));
    }
}
