//! Chat line grammar: `<marker> <speaker> text`, `<marker> speaker: text`, or a bare system line.

use std::sync::OnceLock;

use regex::Regex;

use super::{ChatMessage, Origin};

/// Mojibake left behind when the `§` formatting byte is decoded as UTF-8.
const GARBLED_SECTION_SIGN: &str = "\u{FFFD}\u{FFFD}";
const SECTION_SIGN: &str = "\u{00A7}";

/// Extracts `(speaker, text)` from raw log lines and clipboard strings.
#[derive(Debug, Clone)]
pub struct ChatLineParser {
    marker: String,
    replace_garbled: bool,
    strict_names: bool,
}

impl ChatLineParser {
    pub fn new(marker: impl Into<String>, replace_garbled: bool, strict_names: bool) -> Self {
        Self {
            marker: marker.into(),
            replace_garbled,
            strict_names,
        }
    }

    /// Returns `None` for log lines that are not chat records.
    pub fn parse(&self, raw: &str, origin: Origin) -> Option<ChatMessage> {
        match origin {
            Origin::Clipboard => Some(ChatMessage {
                speaker: String::new(),
                text: raw.trim().to_string(),
                origin,
            }),
            Origin::Log => {
                let (_, payload) = raw.split_once(self.marker.as_str())?;
                let payload = if self.replace_garbled {
                    payload.replace(GARBLED_SECTION_SIGN, SECTION_SIGN)
                } else {
                    payload.to_string()
                };
                let (speaker, text) = self.split_speaker(payload.trim());
                Some(ChatMessage {
                    speaker,
                    text,
                    origin,
                })
            }
        }
    }

    fn split_speaker(&self, payload: &str) -> (String, String) {
        let system = || (String::new(), payload.to_string());

        if let Some(rest) = payload.strip_prefix('<') {
            return match rest.split_once('>') {
                Some((name, text)) => {
                    let name = name.trim();
                    if self.strict_names && !is_valid_player_name(name) {
                        system()
                    } else {
                        (name.to_string(), text.trim().to_string())
                    }
                }
                None => system(),
            };
        }

        match payload.split_once(':') {
            Some((name, text)) => {
                if self.strict_names && !is_valid_player_name(&sanitize_name(name)) {
                    system()
                } else {
                    (name.trim().to_string(), text.trim().to_string())
                }
            }
            None => system(),
        }
    }
}

/// 3-16 characters of `[A-Za-z0-9_]`.
pub fn is_valid_player_name(name: &str) -> bool {
    let len = name.chars().count();
    (3..=16).contains(&len) && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn sanitizers() -> &'static [Regex] {
    static SANITIZERS: OnceLock<Vec<Regex>> = OnceLock::new();
    SANITIZERS.get_or_init(|| {
        [
            r"§.",             // formatting codes
            r"\[.*?\]",        // rank tags
            r"\w+\s*>\s*",     // channel prefixes, e.g. "Guild > "
            r"(?:From|To)\s+", // private messages
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

/// Strip server decorations from a `name:` candidate. Used for validation only.
pub fn sanitize_name(name: &str) -> String {
    let mut out = name.to_string();
    for re in sanitizers() {
        out = re.replace_all(&out, "").into_owned();
    }
    out.trim().to_string()
}
