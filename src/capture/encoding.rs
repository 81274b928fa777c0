//! Encoding resolution for tailed log files.
//! Priority: BOM > ASCII-only > strict UTF-8 > locale fallback (single legacy codepage).
//! Decoding is per complete line; line framing depends on the encoding's code unit width.

use std::borrow::Cow;
use std::fmt;
use std::io::Read;
use std::path::Path;

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use encoding_rs::Encoding;
use tracing::debug;

use super::DecodePolicy;

/// Bytes sampled from the head of a file before resolving its encoding.
pub const SNIFF_SAMPLE_BYTES: u64 = 256 * 1024;

/// Modified base64 used inside UTF-7 shifted sequences (no padding, trailing bits allowed).
const UTF7_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_allow_trailing_bits(true)
        .with_decode_padding_mode(DecodePaddingMode::RequireNone),
);

/// A concrete text encoding the tailer can decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Utf8,
    /// UTF-8 with a leading byte-order mark.
    Utf8Bom,
    Utf16Le,
    Utf16Be,
    Utf32Le,
    Utf32Be,
    Utf7,
    /// Any single or multi-byte legacy codepage handled by encoding_rs.
    Legacy(&'static Encoding),
}

impl TextEncoding {
    pub fn name(&self) -> &'static str {
        match self {
            TextEncoding::Utf8 => "UTF-8",
            TextEncoding::Utf8Bom => "UTF-8-BOM",
            TextEncoding::Utf16Le => "UTF-16LE",
            TextEncoding::Utf16Be => "UTF-16BE",
            TextEncoding::Utf32Le => "UTF-32LE",
            TextEncoding::Utf32Be => "UTF-32BE",
            TextEncoding::Utf7 => "UTF-7",
            TextEncoding::Legacy(enc) => enc.name(),
        }
    }

    /// Byte-order mark that may prefix a file in this encoding.
    pub fn bom(&self) -> &'static [u8] {
        match self {
            TextEncoding::Utf8 | TextEncoding::Utf8Bom => b"\xEF\xBB\xBF",
            TextEncoding::Utf16Le => b"\xFF\xFE",
            TextEncoding::Utf16Be => b"\xFE\xFF",
            TextEncoding::Utf32Le => b"\xFF\xFE\x00\x00",
            TextEncoding::Utf32Be => b"\x00\x00\xFE\xFF",
            TextEncoding::Utf7 | TextEncoding::Legacy(_) => b"",
        }
    }

    /// Width in bytes of one code unit; lines are only split on unit boundaries.
    pub fn unit_width(&self) -> usize {
        match self {
            TextEncoding::Utf16Le | TextEncoding::Utf16Be => 2,
            TextEncoding::Utf32Le | TextEncoding::Utf32Be => 4,
            _ => 1,
        }
    }

    /// The encoded form of `\n`.
    pub fn newline(&self) -> &'static [u8] {
        match self {
            TextEncoding::Utf16Le => b"\x0A\x00",
            TextEncoding::Utf16Be => b"\x00\x0A",
            TextEncoding::Utf32Le => b"\x0A\x00\x00\x00",
            TextEncoding::Utf32Be => b"\x00\x00\x00\x0A",
            _ => b"\n",
        }
    }

    /// Parse a user-supplied encoding label. `None` for "auto"/empty is handled by the caller.
    pub fn from_label(label: &str) -> Option<TextEncoding> {
        let lower = label.trim().to_ascii_lowercase();
        let norm = lower.replace('_', "-");
        let fixed = match norm.as_str() {
            "utf-8" | "utf8" => Some(TextEncoding::Utf8),
            "utf-8-sig" | "utf8-sig" => Some(TextEncoding::Utf8Bom),
            "utf-16" | "utf-16le" | "utf-16-le" => Some(TextEncoding::Utf16Le),
            "utf-16be" | "utf-16-be" => Some(TextEncoding::Utf16Be),
            "utf-32" | "utf-32le" | "utf-32-le" => Some(TextEncoding::Utf32Le),
            "utf-32be" | "utf-32-be" => Some(TextEncoding::Utf32Be),
            "utf-7" | "utf7" => Some(TextEncoding::Utf7),
            "cp932" | "ms932" | "mskanji" => Some(TextEncoding::Legacy(encoding_rs::SHIFT_JIS)),
            "cp949" | "uhc" => Some(TextEncoding::Legacy(encoding_rs::EUC_KR)),
            "cp936" => Some(TextEncoding::Legacy(encoding_rs::GBK)),
            "cp950" => Some(TextEncoding::Legacy(encoding_rs::BIG5)),
            _ => None,
        };
        if fixed.is_some() {
            return fixed;
        }

        // "cp1251" style labels map to WHATWG "windows-1251"
        let label = match lower.strip_prefix("cp") {
            Some(digits) if digits.chars().all(|c| c.is_ascii_digit()) => {
                Cow::Owned(format!("windows-{digits}"))
            }
            _ => Cow::Borrowed(lower.as_str()),
        };
        Encoding::for_label(label.as_bytes()).map(TextEncoding::from_encoding)
    }

    fn from_encoding(enc: &'static Encoding) -> TextEncoding {
        if enc == encoding_rs::UTF_8 {
            TextEncoding::Utf8
        } else if enc == encoding_rs::UTF_16LE {
            TextEncoding::Utf16Le
        } else if enc == encoding_rs::UTF_16BE {
            TextEncoding::Utf16Be
        } else {
            TextEncoding::Legacy(enc)
        }
    }

    /// Decode one complete line (without its newline unit).
    pub fn decode_line(&self, bytes: &[u8], policy: DecodePolicy) -> Result<String, DecodeError> {
        let decoded = match self {
            TextEncoding::Utf8 | TextEncoding::Utf8Bom => {
                let body = bytes.strip_prefix(self.bom()).unwrap_or(bytes);
                decode_with(encoding_rs::UTF_8, body, policy)
            }
            TextEncoding::Utf16Le => decode_with(encoding_rs::UTF_16LE, bytes, policy),
            TextEncoding::Utf16Be => decode_with(encoding_rs::UTF_16BE, bytes, policy),
            TextEncoding::Utf32Le => decode_utf32(bytes, false, policy),
            TextEncoding::Utf32Be => decode_utf32(bytes, true, policy),
            TextEncoding::Utf7 => decode_utf7(bytes, policy),
            TextEncoding::Legacy(enc) => decode_with(enc, bytes, policy),
        };
        decoded.ok_or(DecodeError { encoding: *self })
    }
}

impl fmt::Display for TextEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A line could not be decoded under a strict policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeError {
    pub encoding: TextEncoding,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bytes are not valid {}", self.encoding)
    }
}

impl std::error::Error for DecodeError {}

fn decode_with(enc: &'static Encoding, bytes: &[u8], policy: DecodePolicy) -> Option<String> {
    match policy {
        DecodePolicy::Strict => enc
            .decode_without_bom_handling_and_without_replacement(bytes)
            .map(Cow::into_owned),
        DecodePolicy::Replace => Some(enc.decode_without_bom_handling(bytes).0.into_owned()),
    }
}

fn decode_utf32(bytes: &[u8], big_endian: bool, policy: DecodePolicy) -> Option<String> {
    let chunks = bytes.chunks_exact(4);
    let trailing = chunks.remainder();
    let mut out = String::with_capacity(bytes.len() / 4);
    for unit in chunks {
        let raw = [unit[0], unit[1], unit[2], unit[3]];
        let value = if big_endian {
            u32::from_be_bytes(raw)
        } else {
            u32::from_le_bytes(raw)
        };
        match char::from_u32(value) {
            Some(c) => out.push(c),
            None if policy == DecodePolicy::Replace => out.push(char::REPLACEMENT_CHARACTER),
            None => return None,
        }
    }
    if !trailing.is_empty() {
        if policy == DecodePolicy::Strict {
            return None;
        }
        out.push(char::REPLACEMENT_CHARACTER);
    }
    Some(out)
}

fn is_utf7_base64(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'+' || b == b'/'
}

fn decode_utf7(bytes: &[u8], policy: DecodePolicy) -> Option<String> {
    let strict = policy == DecodePolicy::Strict;
    let mut out = String::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b >= 0x80 {
            if strict {
                return None;
            }
            out.push(char::REPLACEMENT_CHARACTER);
            i += 1;
            continue;
        }
        if b != b'+' {
            out.push(b as char);
            i += 1;
            continue;
        }

        let start = i + 1;
        let mut end = start;
        while end < bytes.len() && is_utf7_base64(bytes[end]) {
            end += 1;
        }
        // "+-" is a literal plus
        if end == start {
            out.push('+');
        } else {
            match UTF7_BASE64.decode(&bytes[start..end]) {
                Ok(raw) => {
                    let units = raw.chunks_exact(2).map(|p| u16::from_be_bytes([p[0], p[1]]));
                    for decoded in char::decode_utf16(units) {
                        match decoded {
                            Ok(c) => out.push(c),
                            Err(_) if !strict => out.push(char::REPLACEMENT_CHARACTER),
                            Err(_) => return None,
                        }
                    }
                }
                Err(_) if !strict => out.push(char::REPLACEMENT_CHARACTER),
                Err(_) => return None,
            }
        }
        i = if bytes.get(end) == Some(&b'-') { end + 1 } else { end };
    }
    Some(out)
}

// --- Resolution ---

/// Check byte-order-mark prefixes. UTF-32LE must be tested before UTF-16LE.
pub fn sniff_bom(raw: &[u8]) -> Option<TextEncoding> {
    if raw.starts_with(b"\xEF\xBB\xBF") {
        Some(TextEncoding::Utf8Bom)
    } else if raw.starts_with(b"\xFF\xFE\x00\x00") {
        Some(TextEncoding::Utf32Le)
    } else if raw.starts_with(b"\x00\x00\xFE\xFF") {
        Some(TextEncoding::Utf32Be)
    } else if raw.starts_with(b"\xFF\xFE") {
        Some(TextEncoding::Utf16Le)
    } else if raw.starts_with(b"\xFE\xFF") {
        Some(TextEncoding::Utf16Be)
    } else if raw.starts_with(b"\x2B\x2F\x76") {
        Some(TextEncoding::Utf7)
    } else {
        None
    }
}

/// Resolve the encoding of a byte sample using an explicit locale.
pub fn resolve_with_locale(sample: &[u8], locale: &Locale) -> TextEncoding {
    if let Some(enc) = sniff_bom(sample) {
        return enc;
    }
    if sample.is_ascii() {
        return TextEncoding::Utf8;
    }
    match std::str::from_utf8(sample) {
        Ok(_) => return TextEncoding::Utf8,
        // sample ends inside a multibyte sequence
        Err(e) if e.error_len().is_none() => return TextEncoding::Utf8,
        Err(_) => {}
    }
    fallback_for_locale(locale)
}

/// Resolve the encoding of a byte sample using the process locale.
pub fn resolve(sample: &[u8]) -> TextEncoding {
    resolve_with_locale(sample, &Locale::from_env())
}

/// Sample the head of `path` and resolve its encoding. Unreadable files resolve to UTF-8.
pub fn sniff_file(path: &Path) -> TextEncoding {
    let mut sample = Vec::new();
    let read = std::fs::File::open(path)
        .and_then(|f| f.take(SNIFF_SAMPLE_BYTES).read_to_end(&mut sample));
    match read {
        Ok(_) => {
            let enc = resolve(&sample);
            debug!(path = %path.display(), sample_len = sample.len(), encoding = %enc, "encoding_sniffed");
            enc
        }
        Err(e) => {
            debug!(path = %path.display(), error = %e, "sniff failed, assuming UTF-8");
            TextEncoding::Utf8
        }
    }
}

/// Language and region derived from the environment (e.g. `zh_TW.UTF-8`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Locale {
    pub lang: Option<String>,
    pub region: Option<String>,
}

impl Locale {
    /// Parse a POSIX-style locale string such as `ru_RU.CP1251` or `zh-Hant-TW`.
    pub fn parse(raw: &str) -> Locale {
        let code = raw.split(['.', '@']).next().unwrap_or("").replace('-', "_");
        let mut parts = code.split('_').filter(|p| !p.is_empty());
        let lang = parts.next().map(|p| p.to_ascii_lowercase());
        let region = parts.last().map(|p| p.to_ascii_uppercase());
        Locale { lang, region }
    }

    /// Read LC_ALL, LC_CTYPE, LANG in that order; "C"/"POSIX" count as unset.
    pub fn from_env() -> Locale {
        ["LC_ALL", "LC_CTYPE", "LANG", "LANGUAGE"]
            .iter()
            .filter_map(|key| std::env::var(key).ok())
            .find(|v| !v.is_empty() && v != "C" && v != "POSIX")
            .map(|v| Locale::parse(&v))
            .unwrap_or_default()
    }
}

/// The single legacy codepage used when a file is neither BOM-marked nor UTF-8.
pub fn fallback_for_locale(locale: &Locale) -> TextEncoding {
    use encoding_rs::*;
    let region = locale.region.as_deref();
    let enc = match locale.lang.as_deref() {
        Some("zh") if matches!(region, Some("TW" | "HK" | "MO")) => BIG5,
        Some("zh") => GB18030,
        Some("ja") => SHIFT_JIS,
        Some("ko") => EUC_KR,
        Some("ru" | "uk" | "bg" | "sr" | "be" | "mk") => WINDOWS_1251,
        Some("el") => WINDOWS_1253,
        Some("tr") => WINDOWS_1254,
        Some("he") => WINDOWS_1255,
        Some("ar" | "fa" | "ur") => WINDOWS_1256,
        Some("et" | "lv" | "lt") => WINDOWS_1257,
        Some("vi") => WINDOWS_1258,
        Some("th") => WINDOWS_874,
        Some("pl" | "cs" | "sk" | "hu" | "ro" | "hr" | "sl" | "bs") => WINDOWS_1250,
        _ => WINDOWS_1252,
    };
    TextEncoding::Legacy(enc)
}

/// The fallback codepage for the current process locale.
pub fn locale_fallback() -> TextEncoding {
    fallback_for_locale(&Locale::from_env())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locale(raw: &str) -> Locale {
        Locale::parse(raw)
    }

    #[test]
    fn bom_wins_over_ascii_check() {
        let sample = b"\xEF\xBB\xBFplain ascii after bom\n";
        assert_eq!(resolve_with_locale(sample, &locale("ja_JP")), TextEncoding::Utf8Bom);
    }

    #[test]
    fn ascii_only_is_utf8_without_locale() {
        let sample = b"[12:00:00] [Server thread/INFO]: [CHAT] <Alice> gg wp\n";
        assert_eq!(resolve_with_locale(sample, &locale("zh_CN")), TextEncoding::Utf8);
    }

    #[test]
    fn valid_utf8_is_utf8() {
        let sample = "[CHAT] <Bob> 你好\n".as_bytes();
        assert_eq!(resolve_with_locale(sample, &locale("ru_RU")), TextEncoding::Utf8);
    }

    #[test]
    fn sample_cut_inside_multibyte_char_is_utf8() {
        let full = "[CHAT] <Bob> 你好".as_bytes();
        let cut = &full[..full.len() - 1];
        assert!(std::str::from_utf8(cut).is_err());
        assert_eq!(resolve_with_locale(cut, &locale("zh_CN")), TextEncoding::Utf8);

        let mut garbage = cut.to_vec();
        garbage.extend_from_slice(b"\xE9 tail");
        assert_eq!(
            resolve_with_locale(&garbage, &locale("zh_CN")),
            TextEncoding::Legacy(encoding_rs::GB18030)
        );
    }

    #[test]
    fn invalid_utf8_falls_back_to_locale() {
        let (gbk, _, _) = encoding_rs::GB18030.encode("[CHAT] <Bob> 你好");
        assert_eq!(
            resolve_with_locale(&gbk, &locale("zh_CN.UTF-8")),
            TextEncoding::Legacy(encoding_rs::GB18030)
        );
        assert_eq!(
            resolve_with_locale(&gbk, &locale("zh_TW")),
            TextEncoding::Legacy(encoding_rs::BIG5)
        );
        assert_eq!(
            resolve_with_locale(&gbk, &Locale::default()),
            TextEncoding::Legacy(encoding_rs::WINDOWS_1252)
        );
    }

    #[test]
    fn utf32le_bom_is_not_mistaken_for_utf16() {
        assert_eq!(sniff_bom(b"\xFF\xFE\x00\x00a\x00\x00\x00"), Some(TextEncoding::Utf32Le));
        assert_eq!(sniff_bom(b"\xFF\xFEa\x00"), Some(TextEncoding::Utf16Le));
    }

    #[test]
    fn locale_table() {
        let cases = [
            ("ja_JP", encoding_rs::SHIFT_JIS),
            ("ko_KR", encoding_rs::EUC_KR),
            ("uk_UA", encoding_rs::WINDOWS_1251),
            ("pl_PL", encoding_rs::WINDOWS_1250),
            ("th_TH", encoding_rs::WINDOWS_874),
            ("de_DE", encoding_rs::WINDOWS_1252),
        ];
        for (raw, expected) in cases {
            assert_eq!(fallback_for_locale(&locale(raw)), TextEncoding::Legacy(expected), "{raw}");
        }
    }

    #[test]
    fn strict_decode_rejects_and_replace_recovers() {
        let bytes = b"caf\xE9";
        assert!(TextEncoding::Utf8.decode_line(bytes, DecodePolicy::Strict).is_err());
        let lossy = TextEncoding::Utf8
            .decode_line(bytes, DecodePolicy::Replace)
            .unwrap();
        assert_eq!(lossy, "caf\u{FFFD}");
        let latin = TextEncoding::Legacy(encoding_rs::WINDOWS_1252)
            .decode_line(bytes, DecodePolicy::Strict)
            .unwrap();
        assert_eq!(latin, "café");
    }

    #[test]
    fn utf7_shifted_sequences() {
        let text = TextEncoding::Utf7
            .decode_line(b"Hi Mom -+Jjo--! 1 +- 1", DecodePolicy::Strict)
            .unwrap();
        assert_eq!(text, "Hi Mom -\u{263A}-! 1 + 1");
    }

    #[test]
    fn utf32_units() {
        let mut bytes = Vec::new();
        for c in "gg€".chars() {
            bytes.extend_from_slice(&(c as u32).to_be_bytes());
        }
        let text = TextEncoding::Utf32Be.decode_line(&bytes, DecodePolicy::Strict).unwrap();
        assert_eq!(text, "gg€");
        assert!(TextEncoding::Utf32Be
            .decode_line(&bytes[..5], DecodePolicy::Strict)
            .is_err());
    }

    #[test]
    fn labels() {
        assert_eq!(TextEncoding::from_label("UTF-8"), Some(TextEncoding::Utf8));
        assert_eq!(TextEncoding::from_label("utf_8_sig"), Some(TextEncoding::Utf8Bom));
        assert_eq!(
            TextEncoding::from_label("cp1251"),
            Some(TextEncoding::Legacy(encoding_rs::WINDOWS_1251))
        );
        assert_eq!(
            TextEncoding::from_label("shift_jis"),
            Some(TextEncoding::Legacy(encoding_rs::SHIFT_JIS))
        );
        assert_eq!(TextEncoding::from_label("gbk"), Some(TextEncoding::Legacy(encoding_rs::GBK)));
        assert_eq!(TextEncoding::from_label("klingon"), None);
    }

    #[test]
    fn locale_parsing() {
        assert_eq!(
            Locale::parse("zh_TW.UTF-8"),
            Locale { lang: Some("zh".into()), region: Some("TW".into()) }
        );
        assert_eq!(Locale::parse("en"), Locale { lang: Some("en".into()), region: None });
    }
}
