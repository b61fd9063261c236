//! Language detection seam.
//!
//! Detection itself is an external concern; the crawl only needs a best
//! guess at an ISO 639-1 code to pass along to the matcher, and treats any
//! detector failure as "unknown".

use once_cell::sync::Lazy;
use regex::Regex;

/// Detects the dominant natural language of extracted page text.
pub trait LanguageDetector: Send + Sync {
    /// Returns an ISO 639-1 code, or `None` when no confident guess exists.
    fn detect(&self, text: &str) -> anyhow::Result<Option<String>>;
}

/// Detector that never guesses; the default when no external detector is
/// wired in.
#[derive(Debug, Default)]
pub struct NullLanguageDetector;

impl LanguageDetector for NullLanguageDetector {
    fn detect(&self, _text: &str) -> anyhow::Result<Option<String>> {
        Ok(None)
    }
}

static MARKUP_TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"</?[^>]+(>|$)").expect("markup tag regex"));

/// Strip markup tags so the detector sees prose, not attribute soup.
pub fn strip_markup(html: &str) -> String {
    MARKUP_TAG_RE.replace_all(html, " ").into_owned()
}
