//! Page text bundle: titles, descriptions, site name, and a de-tagged
//! plain-text rendering of the body.
//!
//! Site names are filtered against a denylist of placeholder values that
//! CMS templates ship by default; surfacing "A WordPress Site" as a site
//! name helps nobody.

use once_cell::sync::Lazy;
use scraper::{Html, Node, Selector};
use serde_json::Value;

use crate::signals::PageTexts;

/// Every string field except the body text is capped at this many characters.
const FIELD_MAX_CHARS: usize = 250;

/// The body text is capped by encoded size, not character count.
const PAGE_TEXT_MAX_BYTES: usize = 65_534;

static PLACEHOLDER_SITE_NAMES: &[&str] = &[
    "mysite", "website", "home", "Â ", "classy", "blog", "default store view", "default",
    "website-1", "my site", "welcome", "english", "my blog", "mysite-1", "blank title",
    "online store", "my website", "your site title", "my cms", "gitlab", "jalbum", "yelp",
    "newsite", "tumblr", "main", "custom logo cases", "getty images", "mysite 1", "news",
    "airbnb", "en", "startseite", ".", "{$plugin.tx_news.opengraph.site_name}", "monsite",
    "medium", "land rover configurator", "your site name goes here", "perfect test site",
    "help center", "homepage", "mynewsdesk", "mysite-2", "nextcloud", "site name", "site",
    "portal", "salon", "test", "shopify", "support", "vimeo", "google docs",
    "printing & more", "pinterest", "classic-layout", "a wordpress site", "meinewebsite",
    "-customer value-", "youtube", "website-2", "construction-company", "home page",
    "default site", "main website", "my wordpress", "/", "start", "facebook",
];

static TITLE_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("title").expect("selector"));
static META_DESCRIPTION_SEL: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"meta[name="description"]"#).expect("selector"));
static TWITTER_TITLE_SEL: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"meta[name="twitter:title"]"#).expect("selector"));
static TWITTER_DESCRIPTION_SEL: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"meta[name="twitter:description"]"#).expect("selector"));
static OG_TITLE_SEL: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"meta[property="og:title"]"#).expect("selector"));
static OG_DESCRIPTION_SEL: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"meta[property="og:description"]"#).expect("selector"));
static OG_SITE_NAME_SEL: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"meta[property="og:site_name"]"#).expect("selector"));
static JSONLD_SEL: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"script[type="application/ld+json"]"#).expect("selector"));
static H1_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("h1").expect("selector"));
static H2_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("h2").expect("selector"));

/// Build the full text bundle for one rendered page. `first` controls
/// whether the raw linked-data block is captured; only the crawl's seed
/// page contributes it.
pub fn page_texts_from_html(html: &str, first: bool) -> PageTexts {
    let document = Html::parse_document(html);
    let jsonld_blocks = extract_jsonld_blocks(&document);

    let title = cap_field(&title_string(&document, &jsonld_blocks));
    let description = cap_field(&description_string(&document, &jsonld_blocks));
    let site_name = site_name_string(&document, &jsonld_blocks).as_deref().and_then(cap_str);
    let secondary_title = cap_field(&secondary_title_string(&document));

    let jsonld = if first && !jsonld_blocks.is_empty() {
        serde_json::to_string(&Value::Array(jsonld_blocks)).ok()
    } else {
        None
    };

    let body = body_text(&document);
    let combined = format!(
        "{} {} {}",
        title.as_deref().unwrap_or(""),
        description.as_deref().unwrap_or(""),
        body
    );
    let combined = truncate_to_bytes(combined.trim(), PAGE_TEXT_MAX_BYTES);
    let page_text = if combined.is_empty() { None } else { Some(combined) };

    PageTexts {
        title,
        site_name,
        description,
        secondary_title,
        page_text,
        jsonld,
    }
}

fn meta_content(document: &Html, selector: &Selector) -> Option<String> {
    document
        .select(selector)
        .filter_map(|el| el.value().attr("content"))
        .map(|s| s.trim().to_string())
        .find(|s| !s.is_empty())
}

fn title_string(document: &Html, jsonld: &[Value]) -> String {
    if let Some(el) = document.select(&TITLE_SEL).next() {
        let text: String = el.text().collect();
        let text = text.trim();
        if !text.is_empty() {
            return text.to_string();
        }
    }
    if let Some(title) = meta_content(document, &TWITTER_TITLE_SEL) {
        return title;
    }
    if let Some(title) = find_key_in_jsonld(jsonld, "title") {
        return title;
    }
    meta_content(document, &OG_TITLE_SEL).unwrap_or_default()
}

fn description_string(document: &Html, jsonld: &[Value]) -> String {
    if let Some(desc) = meta_content(document, &META_DESCRIPTION_SEL) {
        return desc;
    }
    if let Some(desc) = meta_content(document, &TWITTER_DESCRIPTION_SEL) {
        return desc;
    }
    if let Some(desc) = find_key_in_jsonld(jsonld, "description") {
        return desc;
    }
    meta_content(document, &OG_DESCRIPTION_SEL).unwrap_or_default()
}

fn site_name_string(document: &Html, jsonld: &[Value]) -> Option<String> {
    let candidate = meta_content(document, &OG_SITE_NAME_SEL)
        .or_else(|| find_key_in_jsonld(jsonld, "name"))?;

    if PLACEHOLDER_SITE_NAMES.contains(&candidate.to_lowercase().as_str()) {
        return None;
    }
    Some(candidate)
}

/// First non-empty `<h1>` text, falling back to `<h2>`.
fn secondary_title_string(document: &Html) -> String {
    for selector in [&*H1_SEL, &*H2_SEL] {
        for el in document.select(selector) {
            let text: String = el.text().collect();
            let text = text.trim();
            if !text.is_empty() {
                return text.to_string();
            }
        }
    }
    String::new()
}

fn extract_jsonld_blocks(document: &Html) -> Vec<Value> {
    let mut blocks = Vec::new();
    for el in document.select(&JSONLD_SEL) {
        let raw: String = el.text().collect();
        if let Ok(value) = serde_json::from_str::<Value>(&raw) {
            blocks.push(value);
        }
    }
    blocks
}

/// Look for a top-level string value under `key` across linked-data blocks.
/// Values wrapped as `[{"@value": "..."}]` are unwrapped.
fn find_key_in_jsonld(blocks: &[Value], key: &str) -> Option<String> {
    fn from_object(obj: &Value, key: &str) -> Option<String> {
        match obj.get(key)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Array(items) => items
                .iter()
                .filter_map(|item| item.get("@value"))
                .filter_map(|v| v.as_str())
                .map(|s| s.to_string())
                .find(|s| !s.is_empty()),
            _ => None,
        }
    }

    for block in blocks {
        match block {
            Value::Array(items) => {
                if let Some(found) = items.iter().find_map(|item| from_object(item, key)) {
                    return Some(found);
                }
            }
            obj @ Value::Object(_) => {
                if let Some(found) = from_object(obj, key) {
                    return Some(found);
                }
            }
            _ => {}
        }
    }
    None
}

/// De-tagged rendering of the document body. Script, style, and head
/// content is excluded; list items get a "- " prefix.
pub fn body_text(document: &Html) -> String {
    fn walk(node: ego_tree::NodeRef<'_, Node>, out: &mut String) {
        match node.value() {
            Node::Element(el) => {
                let name = el.name();
                if matches!(name, "script" | "style" | "noscript" | "template" | "head") {
                    return;
                }
                if name == "li" {
                    out.push_str("- ");
                }
                for child in node.children() {
                    walk(child, out);
                }
                out.push(' ');
            }
            Node::Text(text) => {
                let trimmed = text.text.trim();
                if !trimmed.is_empty() {
                    out.push_str(trimmed);
                    out.push(' ');
                }
            }
            _ => {
                for child in node.children() {
                    walk(child, out);
                }
            }
        }
    }

    let mut out = String::new();
    walk(document.tree.root(), &mut out);
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn cap_field(value: &str) -> Option<String> {
    cap_str(value.trim())
}

fn cap_str(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(FIELD_MAX_CHARS).collect())
}

/// Truncate to at most `max_bytes` of UTF-8 without splitting a character.
pub fn truncate_to_bytes(value: &str, max_bytes: usize) -> String {
    if value.len() <= max_bytes {
        return value.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !value.is_char_boundary(end) {
        end -= 1;
    }
    value[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_title_prefers_title_tag() {
        let html = r#"<html><head>
            <title>Real Title</title>
            <meta name="twitter:title" content="Twitter Title">
            <meta property="og:title" content="OG Title">
        </head><body></body></html>"#;
        let texts = page_texts_from_html(html, false);
        assert_eq!(texts.title.as_deref(), Some("Real Title"));
    }

    #[test]
    fn test_title_falls_back_to_twitter_then_og() {
        let html = r#"<html><head>
            <meta name="twitter:title" content="Twitter Title">
        </head><body></body></html>"#;
        let texts = page_texts_from_html(html, false);
        assert_eq!(texts.title.as_deref(), Some("Twitter Title"));

        let html = r#"<html><head>
            <meta property="og:title" content="OG Title">
        </head><body></body></html>"#;
        let texts = page_texts_from_html(html, false);
        assert_eq!(texts.title.as_deref(), Some("OG Title"));
    }

    #[test]
    fn test_placeholder_site_names_rejected() {
        let html = r#"<html><head>
            <meta property="og:site_name" content="A WordPress Site">
        </head><body></body></html>"#;
        let texts = page_texts_from_html(html, false);
        assert!(texts.site_name.is_none());

        let html = r#"<html><head>
            <meta property="og:site_name" content="Acme Rockets">
        </head><body></body></html>"#;
        let texts = page_texts_from_html(html, false);
        assert_eq!(texts.site_name.as_deref(), Some("Acme Rockets"));
    }

    #[test]
    fn test_site_name_from_jsonld() {
        let html = r#"<html><head>
            <script type="application/ld+json">{"@type": "Organization", "name": "Acme Corp"}</script>
        </head><body></body></html>"#;
        let texts = page_texts_from_html(html, false);
        assert_eq!(texts.site_name.as_deref(), Some("Acme Corp"));
    }

    #[test]
    fn test_jsonld_block_only_on_first_page() {
        let html = r#"<html><head>
            <script type="application/ld+json">{"name": "Acme"}</script>
        </head><body></body></html>"#;
        assert!(page_texts_from_html(html, true).jsonld.is_some());
        assert!(page_texts_from_html(html, false).jsonld.is_none());
    }

    #[test]
    fn test_secondary_title_h1_then_h2() {
        let html = "<html><body><h1>  </h1><h1>Main Heading</h1><h2>Sub</h2></body></html>";
        let texts = page_texts_from_html(html, false);
        assert_eq!(texts.secondary_title.as_deref(), Some("Main Heading"));

        let html = "<html><body><h2>Only Sub</h2></body></html>";
        let texts = page_texts_from_html(html, false);
        assert_eq!(texts.secondary_title.as_deref(), Some("Only Sub"));
    }

    #[test]
    fn test_body_text_excludes_scripts_and_prefixes_lists() {
        let html = r#"<html><head><title>T</title><style>.a{}</style></head>
            <body><p>Hello world</p>
            <script>var hidden = 1;</script>
            <ul><li>one</li><li>two</li></ul></body></html>"#;
        let document = Html::parse_document(html);
        let text = body_text(&document);

        assert!(text.contains("Hello world"));
        assert!(!text.contains("hidden"));
        assert!(!text.contains(".a{}"));
        assert!(text.contains("- one"));
        assert!(text.contains("- two"));
    }

    #[test]
    fn test_field_cap_at_250_chars() {
        let long_title = "t".repeat(400);
        let html = format!("<html><head><title>{long_title}</title></head><body></body></html>");
        let texts = page_texts_from_html(&html, false);
        assert_eq!(texts.title.unwrap().chars().count(), 250);
    }

    #[test]
    fn test_truncate_to_bytes_respects_char_boundaries() {
        // 'é' is two bytes; cutting at an odd byte count must back off.
        let value = "é".repeat(10);
        let truncated = truncate_to_bytes(&value, 7);
        assert_eq!(truncated.len(), 6);
        assert!(truncated.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_page_text_byte_cap() {
        let body = "word ".repeat(20_000);
        let html = format!("<html><body><p>{body}</p></body></html>");
        let texts = page_texts_from_html(&html, false);
        let text = texts.page_text.unwrap();
        assert!(text.len() <= PAGE_TEXT_MAX_BYTES);
        assert!(text.len() > PAGE_TEXT_MAX_BYTES - 8);
    }
}
