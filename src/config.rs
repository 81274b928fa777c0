//! TOML configuration. Every field has a default; the glossary table keeps file order
//! because that order is the match priority.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::capture::chat_line::ChatLineParser;
use crate::capture::encoding::TextEncoding;
use crate::capture::{LogSource, MonitorMode};
use crate::dispatch::{DispatchSettings, LanguagePair};
use crate::scheduler::RetryPolicy;
use crate::translate::openai::OpenAiConfig;

/// Environment variable that overrides `translation.api-key`.
pub const API_KEY_ENV: &str = "TAILGLOT_API_KEY";
pub const DEFAULT_CONFIG_FILE: &str = "tailglot.toml";

#[derive(Debug)]
pub enum ConfigError {
    Io { path: PathBuf, source: std::io::Error },
    Parse(toml::de::Error),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, source } => {
                write!(f, "cannot read config {}: {source}", path.display())
            }
            ConfigError::Parse(e) => write!(f, "invalid config: {e}"),
            ConfigError::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CaptureConfig {
    /// Log file or the directory holding it.
    pub log_path: String,
    /// `auto` (or empty) lets the resolver sniff the file.
    pub log_encoding: String,
    pub monitor_mode: MonitorMode,
    pub poll_interval_ms: u64,
    pub chat_marker: String,
    pub filter_system_messages: bool,
    pub replace_garbled_chars: bool,
    pub strict_player_names: bool,
    pub source_language: String,
    pub target_language: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            log_path: String::new(),
            log_encoding: "auto".into(),
            monitor_mode: MonitorMode::Event,
            poll_interval_ms: 200,
            chat_marker: "[CHAT]".into(),
            filter_system_messages: true,
            replace_garbled_chars: false,
            strict_player_names: false,
            source_language: "auto".into(),
            target_language: "zh-CN".into(),
        }
    }
}

/// Languages for clipboard-origin (stdin) messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SendConfig {
    pub source_language: String,
    pub target_language: String,
}

impl Default for SendConfig {
    fn default() -> Self {
        Self {
            source_language: "auto".into(),
            target_language: "en".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DetectionConfig {
    pub min_length: usize,
    pub skip_languages: Vec<String>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            min_length: 100,
            skip_languages: vec!["zh".into()],
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TranslationConfig {
    pub api_base: String,
    pub api_key: String,
    pub model: String,
    pub timeout_secs: u64,
    pub min_interval_ms: u64,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".into(),
            api_key: String::new(),
            model: "gpt-4o-mini".into(),
            timeout_secs: 30,
            min_interval_ms: 100,
        }
    }
}

impl fmt::Debug for TranslationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TranslationConfig")
            .field("api_base", &self.api_base)
            .field("api_key", &if self.api_key.is_empty() { "" } else { "***" })
            .field("model", &self.model)
            .field("timeout_secs", &self.timeout_secs)
            .field("min_interval_ms", &self.min_interval_ms)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DispatchConfig {
    pub queue_capacity: usize,
    pub max_concurrency: usize,
    pub max_attempts: u32,
    pub retry_base_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            max_concurrency: 8,
            max_attempts: 3,
            retry_base_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CacheConfig {
    pub path: String,
    pub memory_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: "tailglot-cache.sqlite3".into(),
            memory_capacity: 512,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DisplayConfig {
    pub console: bool,
    /// Empty disables the history sink.
    pub history_db: String,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            console: true,
            history_db: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SettingsConfig {
    pub debug: bool,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct AppConfig {
    pub capture: CaptureConfig,
    pub send: SendConfig,
    pub detection: DetectionConfig,
    pub translation: TranslationConfig,
    pub dispatch: DispatchConfig,
    pub cache: CacheConfig,
    pub display: DisplayConfig,
    pub settings: SettingsConfig,
    /// Key template → value template, in priority order.
    pub glossary: IndexMap<String, String>,
}

impl AppConfig {
    /// Read, parse and validate; the API key env var wins over the file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&content)?;
        if let Ok(key) = std::env::var(API_KEY_ENV) {
            if !key.trim().is_empty() {
                config.translation.api_key = key.trim().to_string();
            }
        }
        config.validate()?;
        info!(
            path = %path.display(),
            glossary_rules = config.glossary.len(),
            monitor_mode = %config.capture.monitor_mode,
            "config loaded"
        );
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Only the glossary table, for hot reload.
    pub fn load_glossary(path: &Path) -> Result<IndexMap<String, String>, ConfigError> {
        #[derive(Deserialize)]
        struct GlossaryOnly {
            #[serde(default)]
            glossary: IndexMap<String, String>,
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let parsed: GlossaryOnly = toml::from_str(&content)?;
        Ok(parsed.glossary)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capture.log_path.trim().is_empty() {
            return Err(ConfigError::Invalid("capture.log-path is empty".into()));
        }
        self.user_encoding()?;
        let positive = [
            ("dispatch.queue-capacity", self.dispatch.queue_capacity as u64),
            ("dispatch.max-concurrency", self.dispatch.max_concurrency as u64),
            ("dispatch.max-attempts", self.dispatch.max_attempts as u64),
            ("cache.memory-capacity", self.cache.memory_capacity as u64),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be greater than 0")));
            }
        }
        Ok(())
    }

    /// `None` when the resolver should pick the encoding.
    pub fn user_encoding(&self) -> Result<Option<TextEncoding>, ConfigError> {
        let label = self.capture.log_encoding.trim();
        if label.is_empty() || label.eq_ignore_ascii_case("auto") {
            return Ok(None);
        }
        TextEncoding::from_label(label)
            .map(Some)
            .ok_or_else(|| ConfigError::Invalid(format!("unknown log encoding {label:?}")))
    }

    pub fn log_source(&self) -> Result<LogSource, ConfigError> {
        Ok(LogSource::new(
            PathBuf::from(self.capture.log_path.trim()),
            self.capture.monitor_mode,
            self.user_encoding()?,
        ))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.capture.poll_interval_ms)
    }

    pub fn chat_parser(&self) -> ChatLineParser {
        ChatLineParser::new(
            self.capture.chat_marker.clone(),
            self.capture.replace_garbled_chars,
            self.capture.strict_player_names,
        )
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            filter_system_messages: self.capture.filter_system_messages,
            skip_languages: HashSet::new(),
            min_detect_len: self.detection.min_length,
            log_langs: LanguagePair {
                source: self.capture.source_language.clone(),
                target: self.capture.target_language.clone(),
            },
            send_langs: LanguagePair {
                source: self.send.source_language.clone(),
                target: self.send.target_language.clone(),
            },
        }
        .with_skip_languages(&self.detection.skip_languages)
    }

    pub fn openai_config(&self) -> OpenAiConfig {
        OpenAiConfig {
            api_base: self.translation.api_base.clone(),
            api_key: self.translation.api_key.clone(),
            model: self.translation.model.clone(),
            timeout: Duration::from_secs(self.translation.timeout_secs.max(1)),
            min_interval: Duration::from_millis(self.translation.min_interval_ms),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.dispatch.max_attempts,
            base_delay: Duration::from_millis(self.dispatch.retry_base_ms),
        }
    }

    pub fn history_path(&self) -> Option<PathBuf> {
        let raw = self.display.history_db.trim();
        (!raw.is_empty()).then(|| PathBuf::from(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::Origin;

    const FULL: &str = r#"
[capture]
log-path = "/games/.minecraft/logs"
log-encoding = "cp932"
monitor-mode = "compatible"
poll-interval-ms = 100
strict-player-names = true
target-language = "ja"

[send]
target-language = "en"

[detection]
min-length = 20
skip-languages = ["JA-jp", "zh"]

[translation]
api-key = "sk-test"
model = "gpt-4o"

[dispatch]
max-concurrency = 2
retry-base-ms = 250

[display]
history-db = "history.sqlite3"

[settings]
debug = true
log-format = "json"

[glossary]
"{{player}} joined the game" = "{{player}} が参加しました"
"gg wp" = "ナイス"
"afk" = "離席中"
"#;

    #[test]
    fn full_file_parses() {
        let cfg = AppConfig::from_toml_str(FULL).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.capture.monitor_mode, MonitorMode::Polling);
        assert_eq!(
            cfg.user_encoding().unwrap(),
            Some(TextEncoding::Legacy(encoding_rs::SHIFT_JIS))
        );
        assert_eq!(cfg.poll_interval(), Duration::from_millis(100));
        assert_eq!(cfg.settings.log_format, LogFormat::Json);
        assert_eq!(cfg.history_path(), Some(PathBuf::from("history.sqlite3")));

        let settings = cfg.dispatch_settings();
        assert!(settings.skip_languages.contains("ja"));
        assert!(settings.skip_languages.contains("zh"));
        assert_eq!(settings.min_detect_len, 20);
        assert_eq!(settings.log_langs.target, "ja");

        let retry = cfg.retry_policy();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.base_delay, Duration::from_millis(250));
        assert_eq!(cfg.dispatch.queue_capacity, 256);
    }

    #[test]
    fn glossary_keeps_file_order() {
        let cfg = AppConfig::from_toml_str(FULL).unwrap();
        let keys: Vec<&str> = cfg.glossary.keys().map(String::as_str).collect();
        assert_eq!(keys, ["{{player}} joined the game", "gg wp", "afk"]);
    }

    #[test]
    fn defaults_apply_to_missing_sections() {
        let cfg = AppConfig::from_toml_str("[capture]\nlog-path = \"latest.log\"\n").unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.user_encoding().unwrap(), None);
        assert_eq!(cfg.capture.chat_marker, "[CHAT]");
        assert_eq!(cfg.capture.monitor_mode, MonitorMode::Event);
        assert!(cfg.display.console);
        assert_eq!(cfg.history_path(), None);
        assert!(cfg.glossary.is_empty());
    }

    #[test]
    fn validation_rejects_bad_values() {
        let empty_path = AppConfig::default();
        assert!(matches!(empty_path.validate(), Err(ConfigError::Invalid(_))));

        let bad_encoding =
            AppConfig::from_toml_str("[capture]\nlog-path = \"x\"\nlog-encoding = \"klingon\"\n")
                .unwrap();
        assert!(bad_encoding.validate().is_err());

        let zero_workers =
            AppConfig::from_toml_str("[capture]\nlog-path = \"x\"\n[dispatch]\nmax-concurrency = 0\n")
                .unwrap();
        let err = zero_workers.validate().unwrap_err();
        assert!(err.to_string().contains("max-concurrency"));
    }

    #[test]
    fn unknown_monitor_mode_is_a_parse_error() {
        let err = AppConfig::from_toml_str("[capture]\nmonitor-mode = \"turbo\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn load_from_disk_and_reload_glossary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(&path, FULL).unwrap();
        let cfg = AppConfig::load(&path).unwrap();
        assert_eq!(cfg.glossary.len(), 3);

        std::fs::write(&path, "[glossary]\n\"brb\" = \"马上回来\"\n").unwrap();
        let glossary = AppConfig::load_glossary(&path).unwrap();
        assert_eq!(glossary.get("brb").map(String::as_str), Some("马上回来"));

        let missing = AppConfig::load(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::Io { .. }));
    }

    #[test]
    fn parser_uses_configured_marker() {
        let cfg = AppConfig::from_toml_str("[capture]\nchat-marker = \"[MSG]\"\n").unwrap();
        let msg = cfg
            .chat_parser()
            .parse("[12:00:00] [MSG] <Alice> hi", Origin::Log)
            .unwrap();
        assert_eq!(msg.speaker, "Alice");
    }

    #[test]
    fn api_key_is_redacted_in_debug() {
        let cfg = AppConfig::from_toml_str(FULL).unwrap();
        assert!(!format!("{:?}", cfg.translation).contains("sk-test"));
    }
}
