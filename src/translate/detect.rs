//! Language detection for the skip-language check.
//! whatlang behind a trait so dispatch can be tested with a scripted detector.

/// Candidates below this confidence are treated as "unknown language".
pub const CONFIDENCE_THRESHOLD: f64 = 0.9;

/// Top candidate reported by a detector.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// ISO 639-1 where one exists, otherwise the detector's own code.
    pub code: String,
    pub confidence: f64,
}

impl Detection {
    pub fn is_confident(&self) -> bool {
        self.confidence >= CONFIDENCE_THRESHOLD
    }
}

pub trait LanguageDetector: Send + Sync {
    fn detect(&self, text: &str) -> Option<Detection>;
}

/// Trigram/script based detection via whatlang.
#[derive(Debug, Default, Clone, Copy)]
pub struct WhatlangDetector;

impl LanguageDetector for WhatlangDetector {
    fn detect(&self, text: &str) -> Option<Detection> {
        let info = whatlang::detect(text)?;
        Some(Detection {
            code: lang_to_code(info.lang()),
            confidence: info.confidence(),
        })
    }
}

fn lang_to_code(lang: whatlang::Lang) -> String {
    use whatlang::Lang::*;
    let code = match lang {
        Eng => "en",
        Cmn => "zh",
        Jpn => "ja",
        Kor => "ko",
        Fra => "fr",
        Deu => "de",
        Spa => "es",
        Rus => "ru",
        Por => "pt",
        Ita => "it",
        Ara => "ar",
        Hin => "hi",
        Tur => "tr",
        Vie => "vi",
        Tha => "th",
        Nld => "nl",
        Pol => "pl",
        Ukr => "uk",
        Ces => "cs",
        Swe => "sv",
        Dan => "da",
        Fin => "fi",
        Hun => "hu",
        Ron => "ro",
        Ell => "el",
        Heb => "he",
        Ind => "id",
        Bul => "bg",
        Srp => "sr",
        Hrv => "hr",
        Slk => "sk",
        Slv => "sl",
        Lit => "lt",
        Lav => "lv",
        Est => "et",
        Pes => "fa",
        Urd => "ur",
        Bel => "be",
        Mkd => "mk",
        other => return other.code().to_string(),
    };
    code.to_string()
}

/// Reduce a language tag to its lowercase primary subtag: `zh-CN` → `zh`, `en_US` → `en`.
pub fn normalize_lang_code(tag: &str) -> String {
    tag.trim()
        .split(['-', '_'])
        .next()
        .unwrap_or("")
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_based_detection_is_confident() {
        let d = WhatlangDetector.detect("これはテストです。ひらがなとカタカナ。").unwrap();
        assert_eq!(d.code, "ja");
        assert!(d.is_confident());

        let d = WhatlangDetector.detect("안녕하세요 반갑습니다 오늘 날씨가 좋네요").unwrap();
        assert_eq!(d.code, "ko");
        assert!(d.is_confident());
    }

    #[test]
    fn threshold_is_inclusive() {
        let d = Detection { code: "es".into(), confidence: 0.9 };
        assert!(d.is_confident());
        let d = Detection { code: "es".into(), confidence: 0.89 };
        assert!(!d.is_confident());
    }

    #[test]
    fn tags_normalize_to_primary_subtag() {
        assert_eq!(normalize_lang_code("zh-CN"), "zh");
        assert_eq!(normalize_lang_code(" EN_us "), "en");
        assert_eq!(normalize_lang_code("es"), "es");
    }
}
