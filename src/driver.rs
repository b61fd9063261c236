//! Crawl orchestrator.
//!
//! Drives one page-visit worker per URL, deduplicates and filters the links
//! each visit discovers, applies the retry/redirect policy, and recurses
//! breadth-first in depth-limited, concurrency-limited batches. `analyze`
//! resolves exactly once; every failure a crawl can hit is encoded in the
//! returned result, never thrown past it.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures::future::{join_all, BoxFuture, FutureExt};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, warn};
use url::Url;

use crate::dispatch::VisitDispatcher;
use crate::domain_utils;
use crate::error::{FetchErrorKind, UrlError, VisitFailure};
use crate::lang::{strip_markup, LanguageDetector};
use crate::matcher::{
    process_html, process_js, DetectedApp, MatcherSignals, MatcherSink, TechnologyMatcher,
    UnmatchedSignals,
};
use crate::options::{CrawlOptions, VisitFlags};
use crate::signals::{PageLink, PageTexts};

/// Paths worth analyzing: no extension at all, or one of the common
/// server-rendered document extensions.
static ANALYZABLE_EXTENSION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:^[^.]+$|\.(?:asp|aspx|cgi|htm|html|jsp|php)$)").expect("extension regex")
});

/// A discovered URL with its derived crawl metadata. Immutable once created.
#[derive(Debug, Clone)]
pub struct CrawlUrl {
    url: Url,
    canonical: String,
    slashes: usize,
}

impl CrawlUrl {
    pub fn new(url: Url) -> Self {
        let canonical = domain_utils::canonical_form(&url);
        let slashes = domain_utils::slashes_count(url.path());
        CrawlUrl {
            url,
            canonical,
            slashes,
        }
    }

    pub fn href(&self) -> &str {
        self.url.as_str()
    }

    pub fn canonical(&self) -> &str {
        &self.canonical
    }
}

/// Status and error recorded for one visited URL.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UrlOutcome {
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<UrlError>,
}

/// Crawl-level redirect record: set only when the seed page redirected off
/// the site's registrable domain.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RedirectOutcome {
    pub detected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

/// Fingerprint-relevant signals seen during the crawl that matched nothing.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NotDetected {
    pub scripts: BTreeSet<String>,
    pub headers: BTreeSet<String>,
    pub cookies: BTreeSet<String>,
    pub metas: BTreeSet<String>,
}

/// One detected application in the final result, deduplicated by name.
#[derive(Debug, Clone, Serialize)]
pub struct AppRecord {
    pub name: String,
    pub confidence: String,
    pub version: Option<String>,
    pub icon: String,
    pub website: String,
    pub cpe: Option<String>,
    pub categories: Vec<u32>,
}

/// Aggregate result of one crawl.
#[derive(Debug, Serialize)]
pub struct CrawlResult {
    pub urls: BTreeMap<String, UrlOutcome>,
    pub applications: Vec<AppRecord>,
    pub meta: Value,
    pub redirect: RedirectOutcome,
    pub other_technologies: NotDetected,
    #[serde(serialize_with = "serialize_screenshot")]
    pub screenshot: Option<Vec<u8>>,
    pub page_texts: PageTexts,
}

fn serialize_screenshot<S>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match bytes {
        Some(bytes) => serializer.serialize_some(&BASE64.encode(bytes)),
        None => serializer.serialize_none(),
    }
}

/// Mutable crawl accumulators; only ever touched under the state lock, and
/// only by orchestrator code.
#[derive(Default)]
struct CrawlState {
    urls: BTreeMap<String, UrlOutcome>,
    apps: Vec<AppRecord>,
    meta: Value,
    base_paths: HashSet<String>,
    not_detected: NotDetected,
    page_texts: PageTexts,
    screenshot: Option<Vec<u8>>,
    redirect: RedirectOutcome,
    /// Once any page needed the simple-mode retry, later visits start in
    /// simple mode; the site evidently cannot settle in time.
    recovered_timeout: bool,
    seed_registered: bool,
}

impl MatcherSink for CrawlState {
    fn display_apps(&mut self, detected: &[DetectedApp], meta: &Value) {
        self.meta = meta.clone();
        for app in detected {
            if self.apps.iter().any(|existing| existing.name == app.name) {
                continue;
            }
            self.apps.push(AppRecord {
                name: app.name.clone(),
                confidence: app.confidence_total.to_string(),
                version: app.version.clone(),
                icon: app
                    .icon
                    .clone()
                    .unwrap_or_else(|| "default.svg".to_string()),
                website: app.website.clone(),
                cpe: app.cpe.clone(),
                categories: app.category_ids.clone(),
            });
        }
    }

    fn display_not_detected(&mut self, unmatched: &UnmatchedSignals) {
        self.not_detected
            .scripts
            .extend(unmatched.scripts.iter().cloned());
        self.not_detected
            .headers
            .extend(unmatched.headers.iter().cloned());
        self.not_detected
            .cookies
            .extend(unmatched.cookies.iter().cloned());
        self.not_detected
            .metas
            .extend(unmatched.metas.iter().cloned());
    }
}

struct Shared {
    options: CrawlOptions,
    origin: Url,
    origin_domain: Option<String>,
    matcher: Box<dyn TechnologyMatcher>,
    language: Box<dyn LanguageDetector>,
    dispatcher: Box<dyn VisitDispatcher>,
    started: Instant,
    state: Mutex<CrawlState>,
}

/// The crawl driver. Construction validates the start URL and options;
/// everything after that is infallible from the caller's perspective.
pub struct Driver {
    shared: Arc<Shared>,
}

impl Driver {
    pub fn new(
        start_url: &str,
        options: CrawlOptions,
        matcher: Box<dyn TechnologyMatcher>,
        language: Box<dyn LanguageDetector>,
        dispatcher: Box<dyn VisitDispatcher>,
    ) -> anyhow::Result<Self> {
        let options = options.validated()?;
        let origin = Url::parse(start_url).context("invalid start URL")?;
        if !matches!(origin.scheme(), "http" | "https") {
            anyhow::bail!("unsupported scheme '{}' in start URL", origin.scheme());
        }
        let origin_domain = domain_utils::registrable_domain_of(&origin);

        Ok(Driver {
            shared: Arc::new(Shared {
                options,
                origin,
                origin_domain,
                matcher,
                language,
                dispatcher,
                started: Instant::now(),
                state: Mutex::new(CrawlState::default()),
            }),
        })
    }

    /// Run the crawl to completion and return the aggregate result.
    pub async fn analyze(self) -> CrawlResult {
        let shared = self.shared;
        let seed = CrawlUrl::new(shared.origin.clone());
        crawl(shared.clone(), seed, 1, 1).await;

        debug!(
            "crawl finished in {:.2}s",
            shared.started.elapsed().as_secs_f64()
        );

        let state = {
            let mut guard = shared.state.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        CrawlResult {
            urls: state.urls,
            applications: state.apps,
            meta: state.meta,
            redirect: state.redirect,
            other_technologies: state.not_detected,
            screenshot: state.screenshot,
            page_texts: state.page_texts,
        }
    }
}

fn crawl(shared: Arc<Shared>, url: CrawlUrl, index: usize, depth: u32) -> BoxFuture<'static, ()> {
    async move {
        match fetch(&shared, &url, index, depth).await {
            Ok(links) => {
                if shared.options.recursive
                    && depth < shared.options.max_depth
                    && !links.is_empty()
                {
                    let batch: Vec<CrawlUrl> =
                        links.into_iter().take(shared.options.max_urls).collect();
                    chunk(shared.clone(), batch, depth + 1).await;
                }
            }
            Err(kind) => {
                {
                    let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
                    if let Some(entry) = state.urls.get_mut(url.href()) {
                        entry.error = Some(UrlError::from(kind));
                    }
                }
                error!("{}; url: {}", kind.message(), url.href());
            }
        }
    }
    .boxed()
}

/// Dispatch `chunk_size` links concurrently, wait for the whole chunk to
/// settle, then recurse on the remainder. Peak concurrency stays bounded
/// while network and render latency still overlap.
fn chunk(shared: Arc<Shared>, mut links: Vec<CrawlUrl>, depth: u32) -> BoxFuture<'static, ()> {
    async move {
        if links.is_empty() {
            return;
        }
        let take = links.len().min(shared.options.chunk_size);
        let chunked: Vec<CrawlUrl> = links.drain(..take).collect();

        join_all(
            chunked
                .into_iter()
                .enumerate()
                .map(|(index, link)| crawl(shared.clone(), link, index, depth)),
        )
        .await;

        chunk(shared, links, depth).await;
    }
    .boxed()
}

enum VisitOutcome {
    Links(Vec<CrawlUrl>),
    /// Seed-page invalid redirect, recorded as crawl metadata.
    RedirectRecorded,
    /// First attempt failed; try once more with the simple load strategy.
    Retry,
    Fatal(FetchErrorKind),
}

async fn fetch(
    shared: &Arc<Shared>,
    url: &CrawlUrl,
    index: usize,
    depth: u32,
) -> Result<Vec<CrawlUrl>, FetchErrorKind> {
    let is_seed;
    {
        let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
        // Idempotent no-op on duplicates and once the URL budget is spent.
        if state.urls.contains_key(url.href()) || state.urls.len() >= shared.options.max_urls {
            return Ok(Vec::new());
        }
        state
            .urls
            .insert(url.href().to_string(), UrlOutcome::default());
        is_seed = !state.seed_registered;
        state.seed_registered = true;
    }

    let stagger_ms = shared.options.delay_ms * index as u64;
    debug!(
        "fetch; url: {}; canonical: {}; depth: {depth}; delay: {stagger_ms}ms; elapsed: {:.2}s",
        url.href(),
        url.canonical(),
        shared.started.elapsed().as_secs_f64()
    );
    if stagger_ms > 0 {
        tokio::time::sleep(Duration::from_millis(stagger_ms)).await;
    }

    match visit(shared, url, is_seed, false).await {
        VisitOutcome::Links(links) => Ok(links),
        VisitOutcome::RedirectRecorded => Ok(Vec::new()),
        VisitOutcome::Fatal(kind) => Err(kind),
        VisitOutcome::Retry => {
            warn!("retrying page visit; url: {}", url.href());
            match visit(shared, url, is_seed, true).await {
                VisitOutcome::Links(links) => {
                    shared
                        .state
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .recovered_timeout = true;
                    Ok(links)
                }
                VisitOutcome::RedirectRecorded => Ok(Vec::new()),
                VisitOutcome::Retry | VisitOutcome::Fatal(_) => {
                    error!("retrying page failed; url: {}", url.href());
                    Err(FetchErrorKind::ResponseNotOk)
                }
            }
        }
    }
}

async fn visit(shared: &Arc<Shared>, url: &CrawlUrl, is_seed: bool, retry: bool) -> VisitOutcome {
    let flags = {
        let state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
        VisitFlags {
            simple: retry || state.recovered_timeout,
            // The crawl captures at most one screenshot, on its first visit.
            screenshot: is_seed,
            // Only the seed page contributes linked-data text.
            first: is_seed,
        }
    };

    debug!("visit start; url: {}", url.href());
    let dispatched = shared
        .dispatcher
        .dispatch(url.url.clone(), flags, shared.options.clone())
        .await;
    debug!("visit end; url: {}", url.href());

    let output = match dispatched {
        Err(VisitFailure::InvalidRedirect {
            original_url,
            redirect_url,
        }) if is_seed => {
            warn!("invalid redirect from {original_url} to {redirect_url}");
            let domain = Url::parse(&redirect_url)
                .ok()
                .and_then(|u| domain_utils::registrable_domain_of(&u));
            let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
            state.redirect = RedirectOutcome {
                detected: true,
                url: Some(redirect_url),
                domain,
            };
            return VisitOutcome::RedirectRecorded;
        }
        Err(failure) => {
            if !retry {
                return VisitOutcome::Retry;
            }
            error!("{failure}; url: {}", url.href());
            return VisitOutcome::Fatal(FetchErrorKind::ResponseNotOk);
        }
        Ok(output) => output,
    };

    let bundle = output.bundle;
    {
        let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = state.urls.get_mut(url.href()) {
            entry.status = bundle.status_code;
        }
    }
    if bundle.status_code == 0 {
        return VisitOutcome::Fatal(FetchErrorKind::NoResponse);
    }

    let windowed = process_html(
        &bundle.html,
        shared.options.html_max_cols,
        shared.options.html_max_rows,
    );

    // Detector failure leaves the language unset, nothing more.
    let language = match shared.language.detect(&strip_markup(&windowed)) {
        Ok(language) => language,
        Err(e) => {
            error!("language detection failed: {e}; url: {}", url.href());
            None
        }
    };

    let js_matches = process_js(&bundle.js, shared.matcher.js_patterns());

    let links = {
        let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(screenshot) = output.screenshot {
            if state.screenshot.is_none() {
                state.screenshot = Some(screenshot);
            }
        }
        state.page_texts.merge_absent(bundle.page_texts.clone());

        let signals = MatcherSignals {
            cookies: &bundle.cookies,
            headers: &bundle.headers,
            html: &windowed,
            js: &js_matches,
            scripts: &bundle.scripts,
            language: language.as_deref(),
        };
        if let Err(e) = shared.matcher.analyze(&url.url, &signals, &mut *state) {
            error!("matcher failed: {e}; url: {}", url.href());
        }

        derive_links(&mut state, &shared.origin_domain, &bundle.links)
    };

    VisitOutcome::Links(links)
}

/// Filter one page's anchors down to the next-depth candidates: http(s)
/// only, no nofollow, same registrable domain, analyzable extension, not
/// already scheduled (by href or by base path), ordered shallowest-first.
fn derive_links(
    state: &mut CrawlState,
    origin_domain: &Option<String>,
    links: &[PageLink],
) -> Vec<CrawlUrl> {
    let mut results: Vec<CrawlUrl> = Vec::new();

    for link in links {
        if !matches!(link.protocol.as_str(), "http:" | "https:") {
            continue;
        }
        if link.rel == "nofollow" {
            continue;
        }
        match (domain_utils::registrable_domain(&link.hostname), origin_domain) {
            (Some(domain), Some(origin)) if domain == *origin => {}
            _ => continue,
        }
        if !ANALYZABLE_EXTENSION_RE.is_match(&link.pathname) {
            continue;
        }

        let href = if link.hash.is_empty() {
            link.href.clone()
        } else {
            link.href.replace(&link.hash, "")
        };
        let base = domain_utils::base_path(&link.pathname);

        if results.iter().any(|existing| existing.href() == href) {
            continue;
        }
        if state.base_paths.contains(&base) {
            continue;
        }
        if state.urls.contains_key(href.as_str()) {
            continue;
        }
        let Ok(parsed) = Url::parse(&href) else {
            continue;
        };

        results.push(CrawlUrl::new(parsed));
        state.base_paths.insert(base);
    }

    results.sort_by_key(|link| link.slashes);
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(href: &str, pathname: &str, rel: &str) -> PageLink {
        let url = Url::parse(href).unwrap();
        PageLink {
            hash: url.fragment().map(|f| format!("#{f}")).unwrap_or_default(),
            hostname: url.host_str().unwrap_or_default().to_string(),
            href: href.to_string(),
            pathname: pathname.to_string(),
            protocol: format!("{}:", url.scheme()),
            rel: rel.to_string(),
            search: url.query().map(|q| format!("?{q}")).unwrap_or_default(),
        }
    }

    fn origin() -> Option<String> {
        Some("example.com".to_string())
    }

    #[test]
    fn test_derive_links_filters_scheme_rel_domain_extension() {
        let mut state = CrawlState::default();
        let links = vec![
            link("https://example.com/about", "/about", ""),
            link("https://example.com/tagged", "/tagged", "nofollow"),
            link("https://other.org/offsite", "/offsite", ""),
            link("mailto:hi@example.com", "hi@example.com", ""),
            link("https://example.com/logo.png", "/logo.png", ""),
            link("https://example.com/page.html", "/page.html", ""),
        ];
        let derived = derive_links(&mut state, &origin(), &links);

        let hrefs: Vec<&str> = derived.iter().map(|l| l.href()).collect();
        assert_eq!(
            hrefs,
            vec!["https://example.com/about", "https://example.com/page.html"]
        );
    }

    #[test]
    fn test_derive_links_strips_fragment_and_dedups() {
        let mut state = CrawlState::default();
        let links = vec![
            link("https://example.com/docs#intro", "/docs", ""),
            link("https://example.com/docs#usage", "/docs", ""),
        ];
        let derived = derive_links(&mut state, &origin(), &links);
        assert_eq!(derived.len(), 1);
        assert_eq!(derived[0].href(), "https://example.com/docs");
    }

    #[test]
    fn test_derive_links_skips_already_visited() {
        let mut state = CrawlState::default();
        state
            .urls
            .insert("https://example.com/seen".to_string(), UrlOutcome::default());
        let links = vec![link("https://example.com/seen", "/seen", "")];
        assert!(derive_links(&mut state, &origin(), &links).is_empty());
    }

    #[test]
    fn test_derive_links_base_path_filter() {
        let mut state = CrawlState::default();
        let links = vec![
            link("https://example.com/blog/post-1", "/blog/post-1", ""),
            link("https://example.com/blog/post-2", "/blog/post-2", ""),
            link("https://example.com/shop", "/shop", ""),
        ];
        let derived = derive_links(&mut state, &origin(), &links);
        let hrefs: Vec<&str> = derived.iter().map(|l| l.href()).collect();
        // Second /blog path drops; only one link per mount point.
        assert_eq!(
            hrefs,
            vec![
                "https://example.com/shop",
                "https://example.com/blog/post-1"
            ]
        );
    }

    #[test]
    fn test_derive_links_orders_shallow_paths_first() {
        let mut state = CrawlState::default();
        let links = vec![
            link("https://example.com/a/b/c", "/a/b/c", ""),
            link("https://example.com/x", "/x", ""),
        ];
        let derived = derive_links(&mut state, &origin(), &links);
        assert_eq!(derived[0].href(), "https://example.com/x");
    }

    #[test]
    fn test_crawl_url_canonical_strips_query() {
        let crawl_url = CrawlUrl::new(Url::parse("https://example.com/a?q=1#f").unwrap());
        assert_eq!(crawl_url.canonical(), "https://example.com/a");
    }

    #[test]
    fn test_subdomain_links_count_as_same_site() {
        let mut state = CrawlState::default();
        let links = vec![link("https://www.example.com/about", "/about", "")];
        assert_eq!(derive_links(&mut state, &origin(), &links).len(), 1);
    }

    #[test]
    fn test_display_apps_dedups_by_name() {
        let mut state = CrawlState::default();
        let app = DetectedApp {
            name: "Nginx".to_string(),
            confidence_total: 100,
            version: Some("1.25".to_string()),
            category_ids: vec![22],
            icon: None,
            website: "https://nginx.org".to_string(),
            cpe: None,
        };
        state.display_apps(std::slice::from_ref(&app), &Value::Null);
        state.display_apps(std::slice::from_ref(&app), &Value::Null);

        assert_eq!(state.apps.len(), 1);
        assert_eq!(state.apps[0].icon, "default.svg");
        assert_eq!(state.apps[0].confidence, "100");
    }
}
