//! The signal bundle produced by one page visit, plus the crawl-wide
//! page-text accumulator.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Placeholder written wherever a value could not be serialized safely
/// (too deep, cyclic, or mid-serialization failure).
pub const REMOVED_PLACEHOLDER: &str = "[Removed]";

/// Maximum depth retained when sanitizing a global-state snapshot.
pub const SNAPSHOT_MAX_DEPTH: usize = 5;

/// An anchor (or synthesized form) link as seen by the rendered page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageLink {
    pub hash: String,
    pub hostname: String,
    pub href: String,
    pub pathname: String,
    pub protocol: String,
    pub rel: String,
    pub search: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
}

/// Crawl-wide text record. Fields are filled at most once per crawl;
/// the first page to produce a non-empty value wins.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageTexts {
    pub title: Option<String>,
    pub site_name: Option<String>,
    pub description: Option<String>,
    pub secondary_title: Option<String>,
    pub page_text: Option<String>,
    pub jsonld: Option<String>,
}

impl PageTexts {
    /// Explicit set-if-absent merge: a field already holding a value is
    /// never overwritten, and empty strings never count as values.
    pub fn merge_absent(&mut self, other: PageTexts) {
        fn fill(slot: &mut Option<String>, candidate: Option<String>) {
            if slot.is_none() {
                if let Some(value) = candidate {
                    if !value.is_empty() {
                        *slot = Some(value);
                    }
                }
            }
        }
        fill(&mut self.title, other.title);
        fill(&mut self.site_name, other.site_name);
        fill(&mut self.description, other.description);
        fill(&mut self.secondary_title, other.secondary_title);
        fill(&mut self.page_text, other.page_text);
        fill(&mut self.jsonld, other.jsonld);
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.site_name.is_none()
            && self.description.is_none()
            && self.secondary_title.is_none()
            && self.page_text.is_none()
            && self.jsonld.is_none()
    }
}

/// Everything one page visit observed, as sent over the worker protocol.
///
/// The screenshot travels in its own protocol message and is attached by
/// the orchestrator side, so it is skipped here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalBundle {
    pub status_code: u16,
    /// Header values normalized to lists; duplicate headers arrive from the
    /// browser joined with newlines and are split back apart.
    pub headers: BTreeMap<String, Vec<String>>,
    pub content_type: Option<String>,
    pub cookies: Vec<PageCookie>,
    pub html: String,
    pub links: Vec<PageLink>,
    pub scripts: Vec<String>,
    /// Serialized snapshot of the page's global execution state.
    pub js: Value,
    pub page_texts: PageTexts,
    #[serde(skip)]
    pub screenshot: Option<Vec<u8>>,
}

/// Re-apply the snapshot depth bound to a worker-produced value.
///
/// The in-page serializer already bounds depth, time, and cycles, but the
/// worker output crosses a process boundary and is treated as untrusted:
/// anything deeper than [`SNAPSHOT_MAX_DEPTH`] collapses to the placeholder.
pub fn sanitize_snapshot(value: &Value) -> Value {
    fn walk(value: &Value, depth: usize) -> Value {
        if depth > SNAPSHOT_MAX_DEPTH {
            return Value::String(REMOVED_PLACEHOLDER.to_string());
        }
        match value {
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| walk(v, depth + 1)).collect())
            }
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), walk(v, depth + 1)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
    walk(value, 0)
}
