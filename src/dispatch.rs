//! Per-message decision pipeline: parse → classify → resolve.
//!
//! Resolution order, first hit wins: glossary, skip-language passthrough, cache, translate.
//! The dispatcher holds no per-call state and never retries a failed translation.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::capture::{ChatMessage, Origin};
use crate::display::ERROR_SPEAKER;
use crate::translate::cache::TranslationStore;
use crate::translate::detect::{normalize_lang_code, LanguageDetector};
use crate::translate::glossary::GlossaryEngine;
use crate::translate::{ErrorKind, TranslateRequest, Translator, Usage};

/// Source/target pair for one message origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguagePair {
    pub source: String,
    pub target: String,
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub filter_system_messages: bool,
    /// Primary language subtags (`zh`, `es`) passed through untranslated.
    pub skip_languages: HashSet<String>,
    /// Detection only runs for texts of at least this many characters.
    pub min_detect_len: usize,
    /// Languages for log-origin messages.
    pub log_langs: LanguagePair,
    /// Languages for clipboard-origin messages.
    pub send_langs: LanguagePair,
}

impl DispatchSettings {
    pub fn with_skip_languages<I, S>(mut self, langs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.skip_languages = langs
            .into_iter()
            .map(|l| normalize_lang_code(l.as_ref()))
            .filter(|l| !l.is_empty())
            .collect();
        self
    }
}

/// Observability flags attached to every outcome.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DispatchInfo {
    pub glossary_match: bool,
    pub skip_src_lang: bool,
    pub cache_hit: bool,
    pub usage: Option<Usage>,
    pub detected_lang: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessingOutcome {
    Discarded,
    Translated {
        speaker: String,
        text: String,
        info: DispatchInfo,
    },
    Failed {
        kind: ErrorKind,
        message: String,
        info: DispatchInfo,
    },
}

/// Outcome reshaped for its origin: log lines keep the speaker, clipboard text reports failure.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchReply {
    Log {
        speaker: String,
        text: String,
        info: DispatchInfo,
    },
    Clipboard {
        failed: bool,
        text: String,
        info: DispatchInfo,
    },
}

impl ProcessingOutcome {
    pub fn into_reply(self, origin: Origin) -> Option<DispatchReply> {
        let reply = match (self, origin) {
            (ProcessingOutcome::Discarded, _) => return None,
            (ProcessingOutcome::Translated { speaker, text, info }, Origin::Log) => {
                DispatchReply::Log { speaker, text, info }
            }
            (ProcessingOutcome::Failed { message, info, .. }, Origin::Log) => DispatchReply::Log {
                speaker: ERROR_SPEAKER.to_string(),
                text: message,
                info,
            },
            (ProcessingOutcome::Translated { text, info, .. }, Origin::Clipboard) => {
                DispatchReply::Clipboard { failed: false, text, info }
            }
            (ProcessingOutcome::Failed { message, info, .. }, Origin::Clipboard) => {
                DispatchReply::Clipboard { failed: true, text: message, info }
            }
        };
        Some(reply)
    }
}

pub struct MessageDispatcher {
    glossary: Arc<GlossaryEngine>,
    cache: Arc<dyn TranslationStore>,
    translator: Arc<dyn Translator>,
    detector: Arc<dyn LanguageDetector>,
    settings: DispatchSettings,
}

impl MessageDispatcher {
    pub fn new(
        glossary: Arc<GlossaryEngine>,
        cache: Arc<dyn TranslationStore>,
        translator: Arc<dyn Translator>,
        detector: Arc<dyn LanguageDetector>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            glossary,
            cache,
            translator,
            detector,
            settings,
        }
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Confident detection only; short texts are always "unknown".
    fn detect_language(&self, text: &str) -> Option<String> {
        if text.chars().count() < self.settings.min_detect_len {
            return None;
        }
        let detection = self.detector.detect(text)?;
        if !detection.is_confident() {
            debug!(
                code = %detection.code,
                confidence = detection.confidence,
                "language detection below threshold"
            );
            return None;
        }
        Some(normalize_lang_code(&detection.code))
    }

    pub async fn dispatch(&self, message: &ChatMessage) -> ProcessingOutcome {
        if message.origin == Origin::Log
            && message.is_system()
            && self.settings.filter_system_messages
        {
            return ProcessingOutcome::Discarded;
        }
        let text = message.text.trim();
        if text.is_empty() {
            return ProcessingOutcome::Discarded;
        }

        let speaker = message.speaker.clone();
        let mut info = DispatchInfo {
            detected_lang: self.detect_language(text),
            ..Default::default()
        };

        if let Some(substituted) = self.glossary.lookup(text) {
            debug!(origin = %message.origin, "resolved by glossary");
            info.glossary_match = true;
            return ProcessingOutcome::Translated { speaker, text: substituted, info };
        }

        if let Some(lang) = info.detected_lang.as_deref() {
            if self.settings.skip_languages.contains(lang) {
                debug!(lang, "source language skipped");
                info.skip_src_lang = true;
                return ProcessingOutcome::Translated {
                    speaker,
                    text: text.to_string(),
                    info,
                };
            }
        }

        if let Some(cached) = self.cache.get(text) {
            debug!(origin = %message.origin, "resolved by cache");
            info.cache_hit = true;
            return ProcessingOutcome::Translated { speaker, text: cached, info };
        }

        let langs = match message.origin {
            Origin::Log => &self.settings.log_langs,
            Origin::Clipboard => &self.settings.send_langs,
        };
        let request = TranslateRequest::new(text, Some(langs.source.as_str()), &langs.target);
        match self.translator.translate(&request).await {
            Ok(output) => {
                info.usage = output.usage;
                if !output.result.is_empty() {
                    self.cache.set(text, &output.result);
                }
                ProcessingOutcome::Translated {
                    speaker,
                    text: output.result,
                    info,
                }
            }
            Err(e) => {
                warn!(origin = %message.origin, kind = %e.kind(), error = %e, "translation failed");
                ProcessingOutcome::Failed {
                    kind: e.kind(),
                    message: e.user_message(),
                    info,
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use indexmap::IndexMap;
    use parking_lot::Mutex;

    use crate::translate::cache::TranslationCache;
    use crate::translate::detect::Detection;
    use crate::translate::{TranslateError, TranslateOutput};

    /// Replays scripted results and records every request.
    pub(crate) struct ScriptedTranslator {
        script: Mutex<Vec<Result<TranslateOutput, TranslateError>>>,
        pub requests: Mutex<Vec<TranslateRequest>>,
    }

    impl ScriptedTranslator {
        pub(crate) fn new(mut script: Vec<Result<TranslateOutput, TranslateError>>) -> Self {
            script.reverse();
            Self {
                script: Mutex::new(script),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn calls(&self) -> usize {
            self.requests.lock().len()
        }
    }

    #[async_trait::async_trait]
    impl Translator for ScriptedTranslator {
        async fn translate(
            &self,
            request: &TranslateRequest,
        ) -> Result<TranslateOutput, TranslateError> {
            self.requests.lock().push(request.clone());
            self.script.lock().pop().unwrap_or_else(|| {
                Ok(TranslateOutput {
                    result: format!("<{}>", request.text),
                    usage: None,
                })
            })
        }
    }

    pub(crate) struct FixedDetector {
        answer: Option<Detection>,
        pub calls: AtomicUsize,
    }

    impl FixedDetector {
        pub(crate) fn new(code: &str, confidence: f64) -> Self {
            Self {
                answer: Some(Detection { code: code.into(), confidence }),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl LanguageDetector for FixedDetector {
        fn detect(&self, _text: &str) -> Option<Detection> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answer.clone()
        }
    }

    pub(crate) fn settings() -> DispatchSettings {
        DispatchSettings {
            filter_system_messages: true,
            skip_languages: HashSet::new(),
            min_detect_len: 0,
            log_langs: LanguagePair { source: "auto".into(), target: "zh-CN".into() },
            send_langs: LanguagePair { source: "auto".into(), target: "en".into() },
        }
        .with_skip_languages(["es"])
    }

    struct Fixture {
        dispatcher: MessageDispatcher,
        translator: Arc<ScriptedTranslator>,
        detector: Arc<FixedDetector>,
        cache: Arc<TranslationCache>,
    }

    fn fixture(
        glossary: &[(&str, &str)],
        detector: FixedDetector,
        script: Vec<Result<TranslateOutput, TranslateError>>,
        settings: DispatchSettings,
    ) -> Fixture {
        let entries: IndexMap<String, String> = glossary
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let translator = Arc::new(ScriptedTranslator::new(script));
        let detector = Arc::new(detector);
        let cache = Arc::new(TranslationCache::in_memory(16).unwrap());
        let dispatcher = MessageDispatcher::new(
            Arc::new(GlossaryEngine::new(&entries)),
            cache.clone(),
            translator.clone(),
            detector.clone(),
            settings,
        );
        Fixture { dispatcher, translator, detector, cache }
    }

    fn log(speaker: &str, text: &str) -> ChatMessage {
        ChatMessage { speaker: speaker.into(), text: text.into(), origin: Origin::Log }
    }

    fn clipboard(text: &str) -> ChatMessage {
        ChatMessage { speaker: String::new(), text: text.into(), origin: Origin::Clipboard }
    }

    #[tokio::test]
    async fn glossary_hit_from_log_line() {
        let f = fixture(&[("gg wp", "well played")], FixedDetector::new("en", 0.5), vec![], settings());
        let reply = f
            .dispatcher
            .dispatch(&log("Alice", "gg wp"))
            .await
            .into_reply(Origin::Log)
            .unwrap();
        match reply {
            DispatchReply::Log { speaker, text, info } => {
                assert_eq!(speaker, "Alice");
                assert_eq!(text, "well played");
                assert!(info.glossary_match);
                assert!(!info.cache_hit && !info.skip_src_lang);
            }
            other => panic!("unexpected reply {other:?}"),
        }
        assert_eq!(f.translator.calls(), 0);
    }

    #[tokio::test]
    async fn clipboard_skip_language_passthrough() {
        let f = fixture(&[], FixedDetector::new("es", 0.97), vec![], settings());
        let reply = f
            .dispatcher
            .dispatch(&clipboard("hola"))
            .await
            .into_reply(Origin::Clipboard)
            .unwrap();
        match reply {
            DispatchReply::Clipboard { failed, text, info } => {
                assert!(!failed);
                assert_eq!(text, "hola");
                assert!(info.skip_src_lang);
                assert_eq!(info.detected_lang.as_deref(), Some("es"));
            }
            other => panic!("unexpected reply {other:?}"),
        }
        assert_eq!(f.translator.calls(), 0);
    }

    #[tokio::test]
    async fn low_confidence_is_unknown_language() {
        let f = fixture(&[], FixedDetector::new("es", 0.6), vec![], settings());
        let out = f.dispatcher.dispatch(&clipboard("hola")).await;
        match out {
            ProcessingOutcome::Translated { text, info, .. } => {
                assert_eq!(text, "<hola>");
                assert!(!info.skip_src_lang);
                assert_eq!(info.detected_lang, None);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn short_text_skips_detection() {
        let mut s = settings();
        s.min_detect_len = 10;
        let f = fixture(&[], FixedDetector::new("es", 1.0), vec![], s);
        f.dispatcher.dispatch(&clipboard("hola")).await;
        assert_eq!(f.detector.calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.translator.calls(), 1);
    }

    #[tokio::test]
    async fn system_messages_follow_filter_flag() {
        let f = fixture(&[], FixedDetector::new("en", 0.1), vec![], settings());
        assert_eq!(
            f.dispatcher.dispatch(&log("", "Alice joined the game")).await,
            ProcessingOutcome::Discarded
        );
        // clipboard text has no speaker but is never a system message
        assert_ne!(f.dispatcher.dispatch(&clipboard("hello")).await, ProcessingOutcome::Discarded);

        let mut s = settings();
        s.filter_system_messages = false;
        let f = fixture(&[], FixedDetector::new("en", 0.1), vec![], s);
        assert!(matches!(
            f.dispatcher.dispatch(&log("", "Alice joined the game")).await,
            ProcessingOutcome::Translated { .. }
        ));
    }

    #[tokio::test]
    async fn empty_text_is_discarded() {
        let f = fixture(&[], FixedDetector::new("en", 0.1), vec![], settings());
        assert_eq!(f.dispatcher.dispatch(&log("Bob", "   ")).await, ProcessingOutcome::Discarded);
        assert_eq!(f.translator.calls(), 0);
    }

    #[tokio::test]
    async fn cache_short_circuits_translation() {
        let f = fixture(&[], FixedDetector::new("en", 0.99), vec![], settings());
        f.cache.set("good luck", "祝你好运");
        let out = f.dispatcher.dispatch(&log("Bob", "good luck")).await;
        match out {
            ProcessingOutcome::Translated { text, info, .. } => {
                assert_eq!(text, "祝你好运");
                assert!(info.cache_hit);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(f.translator.calls(), 0);
    }

    #[tokio::test]
    async fn translation_is_cached_with_usage() {
        let usage = Usage { prompt_tokens: 10, completion_tokens: 2, total_tokens: 12 };
        let f = fixture(
            &[],
            FixedDetector::new("en", 0.99),
            vec![Ok(TranslateOutput { result: "你好".into(), usage: Some(usage) })],
            settings(),
        );
        let out = f.dispatcher.dispatch(&log("Bob", "hello")).await;
        match out {
            ProcessingOutcome::Translated { text, info, .. } => {
                assert_eq!(text, "你好");
                assert_eq!(info.usage, Some(usage));
                assert!(!info.cache_hit);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(f.translator.requests.lock()[0].target_lang, "zh-CN");
        assert_eq!(f.translator.requests.lock()[0].source_lang, None);

        let again = f.dispatcher.dispatch(&log("Carol", "hello")).await;
        assert!(matches!(again, ProcessingOutcome::Translated { ref info, .. } if info.cache_hit));
        assert_eq!(f.translator.calls(), 1);
    }

    #[tokio::test]
    async fn clipboard_uses_send_languages() {
        let f = fixture(&[], FixedDetector::new("zh", 0.2), vec![], settings());
        f.dispatcher.dispatch(&clipboard("你好")).await;
        assert_eq!(f.translator.requests.lock()[0].target_lang, "en");
    }

    #[tokio::test]
    async fn failures_are_classified_not_cached() {
        let f = fixture(
            &[],
            FixedDetector::new("en", 0.99),
            vec![Err(TranslateError::RateLimited { retry_after_ms: None })],
            settings(),
        );
        let out = f.dispatcher.dispatch(&log("Bob", "hello")).await;
        assert!(matches!(
            out,
            ProcessingOutcome::Failed { kind: ErrorKind::RateLimited, .. }
        ));
        assert!(!f.cache.contains("hello"));
        assert_eq!(f.translator.calls(), 1);

        match out.into_reply(Origin::Log).unwrap() {
            DispatchReply::Log { speaker, text, .. } => {
                assert_eq!(speaker, ERROR_SPEAKER);
                assert!(text.contains("too many requests"));
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_translation_is_not_cached() {
        let f = fixture(
            &[],
            FixedDetector::new("en", 0.99),
            vec![Ok(TranslateOutput { result: String::new(), usage: None })],
            settings(),
        );
        f.dispatcher.dispatch(&log("Bob", "hmm")).await;
        assert!(!f.cache.contains("hmm"));
    }
}
