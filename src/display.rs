//! Display sinks. Every processed message, including failures, ends up here exactly once.
//! Failures carry the `[ERROR]` sentinel speaker instead of being raised.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

use crate::dispatch::{DispatchInfo, DispatchReply};

/// Speaker shown for failed translations.
pub const ERROR_SPEAKER: &str = "[ERROR]";
/// Speaker shown for clipboard-origin results.
pub const INFO_SPEAKER: &str = "[INFO]";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DisplayEntry {
    /// Empty for system messages.
    pub speaker: String,
    pub message: String,
    pub info: DispatchInfo,
    pub duration: Option<Duration>,
}

impl DisplayEntry {
    pub fn from_reply(reply: DispatchReply, duration: Option<Duration>) -> Self {
        match reply {
            DispatchReply::Log { speaker, text, info } => Self {
                speaker,
                message: text,
                info,
                duration,
            },
            DispatchReply::Clipboard { failed, text, info } => Self {
                speaker: if failed { ERROR_SPEAKER } else { INFO_SPEAKER }.to_string(),
                message: text,
                info,
                duration,
            },
        }
    }

    pub fn is_error(&self) -> bool {
        self.speaker == ERROR_SPEAKER
    }
}

pub trait DisplaySink: Send + Sync {
    fn display(&self, entry: &DisplayEntry);
}

/// `instant` under 1 ms, whole milliseconds under 1 s, else seconds with two decimals.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs_f64();
    if secs < 0.001 {
        "instant".to_string()
    } else if secs < 1.0 {
        format!("{}ms", (secs * 1000.0).round() as u64)
    } else {
        format!("{:.2}s", secs)
    }
}

/// Human-readable line writer (stdout by default).
pub struct ConsoleSink<W: Write + Send = std::io::Stdout> {
    out: Mutex<W>,
}

impl ConsoleSink<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> ConsoleSink<W> {
    pub fn new(out: W) -> Self {
        Self { out: Mutex::new(out) }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }

    fn render(entry: &DisplayEntry) -> String {
        let mut line = String::new();
        if !entry.speaker.is_empty() {
            if entry.speaker.starts_with('[') {
                line.push_str(&entry.speaker);
                line.push(' ');
            } else {
                line.push_str(&format!("<{}> ", entry.speaker));
            }
        }
        line.push_str(&entry.message);

        let mut tags = Vec::new();
        if entry.info.glossary_match {
            tags.push("glossary".to_string());
        }
        if entry.info.skip_src_lang {
            tags.push("skipped".to_string());
        }
        if entry.info.cache_hit {
            tags.push("cached".to_string());
        }
        if let Some(usage) = entry.info.usage {
            tags.push(format!("{} tokens", usage.total_tokens));
        }
        if let Some(d) = entry.duration {
            tags.push(format_duration(d));
        }
        if !tags.is_empty() {
            line.push_str(&format!("  ({})", tags.join(", ")));
        }
        line
    }
}

impl<W: Write + Send> DisplaySink for ConsoleSink<W> {
    fn display(&self, entry: &DisplayEntry) {
        let line = Self::render(entry);
        let mut out = self.out.lock();
        if let Err(e) = writeln!(out, "{line}").and_then(|_| out.flush()) {
            warn!(error = %e, "console display write failed");
        }
    }
}

/// Fan-out to several sinks in order.
#[derive(Default)]
pub struct MultiSink {
    sinks: Vec<Arc<dyn DisplaySink>>,
}

impl MultiSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sink: Arc<dyn DisplaySink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl DisplaySink for MultiSink {
    fn display(&self, entry: &DisplayEntry) {
        for sink in &self.sinks {
            sink.display(entry);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::translate::Usage;

    /// Collects entries for assertions.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub entries: Mutex<Vec<DisplayEntry>>,
    }

    impl DisplaySink for RecordingSink {
        fn display(&self, entry: &DisplayEntry) {
            self.entries.lock().push(entry.clone());
        }
    }

    #[test]
    fn durations() {
        assert_eq!(format_duration(Duration::from_micros(300)), "instant");
        assert_eq!(format_duration(Duration::from_millis(120)), "120ms");
        assert_eq!(format_duration(Duration::from_micros(999_400)), "999ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.50s");
    }

    #[test]
    fn console_line_layout() {
        let sink = ConsoleSink::new(Vec::new());
        sink.display(&DisplayEntry {
            speaker: "Alice".into(),
            message: "well played".into(),
            info: DispatchInfo { glossary_match: true, ..Default::default() },
            duration: Some(Duration::from_millis(3)),
        });
        sink.display(&DisplayEntry {
            speaker: String::new(),
            message: "你好".into(),
            info: DispatchInfo {
                usage: Some(Usage { prompt_tokens: 9, completion_tokens: 3, total_tokens: 12 }),
                ..Default::default()
            },
            duration: None,
        });
        let text = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "<Alice> well played  (glossary, 3ms)");
        assert_eq!(lines[1], "你好  (12 tokens)");
    }

    #[test]
    fn clipboard_replies_use_sentinels() {
        let ok = DisplayEntry::from_reply(
            DispatchReply::Clipboard { failed: false, text: "hola".into(), info: DispatchInfo::default() },
            None,
        );
        assert_eq!(ok.speaker, INFO_SPEAKER);
        let failed = DisplayEntry::from_reply(
            DispatchReply::Clipboard { failed: true, text: "x".into(), info: DispatchInfo::default() },
            None,
        );
        assert!(failed.is_error());
    }

    #[test]
    fn multi_sink_fans_out() {
        let a = Arc::new(RecordingSink::default());
        let b = Arc::new(RecordingSink::default());
        let mut multi = MultiSink::new();
        multi.push(a.clone());
        multi.push(b.clone());
        multi.display(&DisplayEntry {
            speaker: "Bob".into(),
            message: "hi".into(),
            info: DispatchInfo::default(),
            duration: None,
        });
        assert_eq!(a.entries.lock().len(), 1);
        assert_eq!(b.entries.lock().len(), 1);
    }
}
