//! Interface to the external technology-fingerprinting matcher.
//!
//! The orchestrator implements [`MatcherSink`] and hands it to the matcher
//! at analysis time; the matcher reports detections and unmatched signals
//! through it. No callback injection, no shared mutable driver object.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::signals::PageCookie;

/// JS fingerprint patterns: application name -> dotted property chain ->
/// pattern strings. The driver only evaluates the chains; pattern matching
/// itself stays inside the matcher.
pub type JsPatternIndex = BTreeMap<String, BTreeMap<String, Vec<String>>>;

/// One detected application, as reported by the matcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedApp {
    pub name: String,
    pub confidence_total: u32,
    pub version: Option<String>,
    pub category_ids: Vec<u32>,
    pub icon: Option<String>,
    pub website: String,
    pub cpe: Option<String>,
}

/// Signals that matched no fingerprint, reported for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnmatchedSignals {
    pub scripts: Vec<String>,
    pub headers: Vec<String>,
    pub cookies: Vec<String>,
    pub metas: Vec<String>,
}

/// The per-visit signal view handed to the matcher.
pub struct MatcherSignals<'a> {
    pub cookies: &'a [PageCookie],
    pub headers: &'a BTreeMap<String, Vec<String>>,
    /// Size-windowed HTML, see [`process_html`].
    pub html: &'a str,
    /// Global-state snapshot evaluated through the matcher's JS patterns,
    /// see [`process_js`].
    pub js: &'a Value,
    pub scripts: &'a [String],
    pub language: Option<&'a str>,
}

/// Callbacks the matcher invokes while analyzing a page. Implemented by the
/// crawl orchestrator.
pub trait MatcherSink {
    /// Called when fingerprints matched. `detected` maps may repeat apps
    /// across pages; the sink deduplicates.
    fn display_apps(&mut self, detected: &[DetectedApp], meta: &Value);

    /// Called with signals that matched nothing.
    fn display_not_detected(&mut self, unmatched: &UnmatchedSignals);
}

/// The external fingerprint matcher.
pub trait TechnologyMatcher: Send + Sync {
    fn js_patterns(&self) -> &JsPatternIndex;

    fn analyze(
        &self,
        url: &Url,
        signals: &MatcherSignals<'_>,
        sink: &mut dyn MatcherSink,
    ) -> anyhow::Result<()>;
}

/// Matcher that detects nothing; used for diagnostics-only crawls and tests.
#[derive(Debug, Default)]
pub struct NullMatcher {
    patterns: JsPatternIndex,
}

impl TechnologyMatcher for NullMatcher {
    fn js_patterns(&self) -> &JsPatternIndex {
        &self.patterns
    }

    fn analyze(
        &self,
        _url: &Url,
        _signals: &MatcherSignals<'_>,
        _sink: &mut dyn MatcherSink,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Bound matcher input on huge pages: keep the first and last `max_rows / 2`
/// rows of `max_cols` characters each, rejoined with newlines. Passing 0 for
/// either bound disables windowing.
pub fn process_html(html: &str, max_cols: usize, max_rows: usize) -> String {
    if max_cols == 0 || max_rows == 0 {
        return html.to_string();
    }

    let chars: Vec<char> = html.chars().collect();
    let total_rows = chars.len().div_ceil(max_cols);

    let mut chunks: Vec<String> = Vec::new();
    for row in 0..total_rows {
        // Head and tail halves; comparisons are scaled by two so an odd
        // max_rows keeps its fractional half-row on both ends.
        let keep_head = 2 * row < max_rows;
        let keep_tail = (2 * row + max_rows) * max_cols > 2 * chars.len();
        if keep_head || keep_tail {
            let start = row * max_cols;
            let end = ((row + 1) * max_cols).min(chars.len());
            chunks.push(chars[start..end].iter().collect());
        }
    }

    chunks.join("\n")
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Evaluate the matcher's property chains against a global-state snapshot.
///
/// For each `app -> chain` the dotted chain is walked through the snapshot;
/// string and number leaves are passed through, anything else collapses to
/// its truthiness. Falsy results are omitted, matching how the patterns are
/// consumed downstream.
pub fn process_js(snapshot: &Value, patterns: &JsPatternIndex) -> Value {
    let mut apps = serde_json::Map::new();

    for (app, chains) in patterns {
        let mut chain_results = serde_json::Map::new();

        for (chain, chain_patterns) in chains {
            let mut resolved: Option<&Value> = Some(snapshot);
            for property in chain.split('.') {
                resolved = resolved
                    .and_then(|v| v.get(property))
                    .filter(|v| !v.is_null());
            }

            let mut per_index = serde_json::Map::new();
            if let Some(value) = resolved {
                let reduced = match value {
                    Value::String(_) | Value::Number(_) => value.clone(),
                    other => Value::Bool(truthy(other)),
                };
                if truthy(&reduced) {
                    for index in 0..chain_patterns.len() {
                        per_index.insert(index.to_string(), reduced.clone());
                    }
                }
            }
            chain_results.insert(chain.clone(), Value::Object(per_index));
        }

        apps.insert(app.clone(), Value::Object(chain_results));
    }

    Value::Object(apps)
}
