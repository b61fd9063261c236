//! One page-visit browser session.
//!
//! State machine per visit: Launch -> Configure -> Navigate -> AwaitSettled
//! -> Extract -> Close. Close always runs: the `done` flag flips before
//! teardown so the request interceptor aborts stragglers, and dropping the
//! browser guard kills the Chrome process on every exit path.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ffi::{OsStr, OsString};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use headless_chrome::browser::tab::RequestPausedDecision;
use headless_chrome::browser::transport::{SessionId, Transport};
use headless_chrome::protocol::cdp::types::Event;
use headless_chrome::protocol::cdp::Fetch::{events::RequestPausedEvent, FailRequest};
use headless_chrome::protocol::cdp::{Network, Page};
use headless_chrome::{Browser, LaunchOptions, Tab};
use url::Url;

use crate::blocklist::ContentBlocklist;
use crate::config::RuntimeConfig;
use crate::domain_utils;
use crate::error::VisitFailure;
use crate::extractor;
use crate::options::{CrawlOptions, VisitFlags};
use crate::page_text;
use crate::signals::SignalBundle;

/// Environment variable forcing sandboxless launch, for containers the
/// filesystem probe cannot identify.
pub const CONTAINER_ENV: &str = "STACKPROBE_CONTAINER";

const RESPONSE_HANDLER_NAME: &str = "visit-session";

/// The page-content read is the one extraction that cannot be skipped.
const CONTENT_READ_TIMEOUT: Duration = Duration::from_secs(10);
/// Budget for each individual sub-extraction.
const EXTRACTION_STEP_TIMEOUT: Duration = Duration::from_secs(5);
/// Form-synthesized links are nice to have; give up quickly.
const FORM_LINKS_TIMEOUT: Duration = Duration::from_secs(3);
const SCREENSHOT_SETTLE: Duration = Duration::from_secs(3);
const SCREENSHOT_TIMEOUT: Duration = Duration::from_secs(5);

/// Log sink for the session; the worker forwards these over the message
/// protocol.
#[derive(Clone)]
pub struct SessionLog {
    emit: Arc<dyn Fn(&str, &str) + Send + Sync>,
}

impl SessionLog {
    pub fn new(emit: impl Fn(&str, &str) + Send + Sync + 'static) -> Self {
        SessionLog { emit: Arc::new(emit) }
    }

    pub fn info(&self, message: &str) {
        (self.emit)("info", message);
    }

    pub fn warn(&self, message: &str) {
        (self.emit)("warn", message);
    }

    pub fn error(&self, message: &str) {
        (self.emit)("error", message);
    }
}

/// What a completed session hands back to the worker.
pub struct SessionOutput {
    pub bundle: SignalBundle,
    pub screenshot: Option<Vec<u8>>,
}

/// First-response capture plus redirect classification. Only the first
/// response populates status/headers; later redirected or sub-resource
/// responses must not overwrite it.
#[derive(Default)]
struct ResponseObservation {
    status: u16,
    headers: BTreeMap<String, Vec<String>>,
    content_type: Option<String>,
    received_final: bool,
    redirected: bool,
}

/// Run one complete visit. Teardown is guaranteed on success, error, and
/// timeout alike.
pub fn run_visit(
    url: &Url,
    flags: VisitFlags,
    options: &CrawlOptions,
    config: &RuntimeConfig,
    blocklist: Option<Arc<ContentBlocklist>>,
    log: SessionLog,
) -> Result<SessionOutput, VisitFailure> {
    let browser = launch_browser(options, config, flags.screenshot)?;
    let tab = browser
        .new_tab()
        .map_err(|e| VisitFailure::generic(format!("failed to open tab: {e}")))?;

    let done = Arc::new(AtomicBool::new(false));
    let observed = Arc::new(Mutex::new(ResponseObservation::default()));
    let request_urls = Arc::new(Mutex::new(HashSet::new()));

    let result = visit_inner(
        &tab,
        url,
        flags,
        options,
        config,
        blocklist,
        &log,
        &done,
        &observed,
        &request_urls,
    );

    done.store(true, Ordering::SeqCst);
    if let Err(e) = tab.deregister_response_handling(RESPONSE_HANDLER_NAME) {
        log.info(&format!("response handler teardown: {e}"));
    }
    if let Ok(urls) = request_urls.lock() {
        log.info(&format!("observed {} distinct request urls", urls.len()));
    }
    match &result {
        Ok(_) => log.info(&format!("visit ok ({url})")),
        Err(e) => log.error(&format!("visit error: {e} ({url})")),
    }
    // Dropping `browser` here closes the session and kills the process.
    result
}

#[allow(clippy::too_many_arguments)]
fn visit_inner(
    tab: &Arc<Tab>,
    url: &Url,
    flags: VisitFlags,
    options: &CrawlOptions,
    config: &RuntimeConfig,
    blocklist: Option<Arc<ContentBlocklist>>,
    log: &SessionLog,
    done: &Arc<AtomicBool>,
    observed: &Arc<Mutex<ResponseObservation>>,
    request_urls: &Arc<Mutex<HashSet<String>>>,
) -> Result<SessionOutput, VisitFailure> {
    configure_tab(tab, url, options, blocklist, log, done, observed, request_urls)?;
    navigate(tab, url, flags, config, log)?;
    validate_redirect(tab, url, flags, config, log, observed)?;
    extract_signals(tab, flags, log, observed)
}

fn launch_browser(
    options: &CrawlOptions,
    config: &RuntimeConfig,
    screenshot: bool,
) -> Result<Browser, VisitFailure> {
    let sandboxless = config.browser.force_no_sandbox
        || std::env::var(CONTAINER_ENV).is_ok()
        || std::path::Path::new("/.dockerenv").exists();

    let chrome_path: Option<PathBuf> = config
        .browser
        .chrome_path
        .clone()
        .map(PathBuf::from)
        .or_else(|| std::env::var("CHROME_PATH").ok().map(PathBuf::from));

    let mut extra_args: Vec<OsString> = options.chromium_args.iter().map(OsString::from).collect();
    extra_args.push(OsString::from("--disable-gpu"));
    let arg_refs: Vec<&OsStr> = extra_args.iter().map(|s| s.as_os_str()).collect();

    let mut builder = LaunchOptions::default_builder();
    builder
        .headless(true)
        .sandbox(!sandboxless)
        .ignore_certificate_errors(true)
        .args(arg_refs)
        .port(Some(next_debug_port(config.browser.debug_port_base)))
        .idle_browser_timeout(Duration::from_millis(options.max_wait_ms.saturating_mul(4)));
    if screenshot {
        builder.window_size(Some((1920, 1080)));
    }
    if let Some(path) = chrome_path {
        builder.path(Some(path));
    }
    if let Some(proxy) = &options.proxy {
        builder.proxy_server(Some(proxy.as_str()));
    }

    let launch_options = builder
        .build()
        .map_err(|e| VisitFailure::generic(format!("failed to build browser launch options: {e}")))?;

    Browser::new(launch_options)
        .map_err(|e| VisitFailure::generic(format!("failed to launch browser: {e}")))
}

/// Unique debug port per browser instance so concurrent workers never
/// collide; wraps after a hundred launches.
fn next_debug_port(base: u16) -> u16 {
    static PORT_OFFSET: AtomicU16 = AtomicU16::new(0);
    let offset = PORT_OFFSET.fetch_add(1, Ordering::Relaxed) % 100;
    base.saturating_add(offset)
}

#[allow(clippy::too_many_arguments)]
fn configure_tab(
    tab: &Arc<Tab>,
    url: &Url,
    options: &CrawlOptions,
    blocklist: Option<Arc<ContentBlocklist>>,
    log: &SessionLog,
    done: &Arc<AtomicBool>,
    observed: &Arc<Mutex<ResponseObservation>>,
    request_urls: &Arc<Mutex<HashSet<String>>>,
) -> Result<(), VisitFailure> {
    tab.set_default_timeout(Duration::from_millis(options.navigation_timeout_ms()));

    if let Some(user_agent) = &options.user_agent {
        tab.set_user_agent(user_agent, None, None)
            .map_err(|e| VisitFailure::generic(format!("failed to set user agent: {e}")))?;
    }

    if !options.username.is_empty() {
        let token = BASE64.encode(format!("{}:{}", options.username, options.password));
        let value = format!("Basic {token}");
        let mut headers = HashMap::new();
        headers.insert("Authorization", value.as_str());
        tab.set_extra_http_headers(headers)
            .map_err(|e| VisitFailure::generic(format!("failed to set auth header: {e}")))?;
    }

    let obs = observed.clone();
    tab.register_response_handling(
        RESPONSE_HANDLER_NAME,
        Box::new(move |params, _fetch_body| {
            let response = &params.response;
            let status = response.status as i64;
            let Ok(mut o) = obs.lock() else { return };
            if o.status == 0 {
                o.status = u16::try_from(status).unwrap_or(0);
                o.headers = normalize_headers(&response.headers);
                o.content_type = o
                    .headers
                    .get("content-type")
                    .and_then(|values| values.first())
                    .cloned();
            }
            if (300..=399).contains(&status) {
                o.redirected = true;
            } else {
                o.received_final = true;
            }
        }),
    )
    .map_err(|e| VisitFailure::generic(format!("failed to observe responses: {e}")))?;

    let done_flag = done.clone();
    let obs = observed.clone();
    let interceptor_log = log.clone();
    let original_url = url.to_string();
    let seen_requests = request_urls.clone();
    let interceptor = Arc::new(
        move |_transport: Arc<Transport>, _session_id: SessionId, event: RequestPausedEvent| {
            let params = &event.params;
            let request_url = params.request.url.clone();
            if let Ok(mut seen) = seen_requests.lock() {
                seen.insert(request_url.clone());
            }
            let abort = || {
                RequestPausedDecision::Fail(FailRequest {
                    request_id: params.request_id.clone(),
                    error_reason: Network::ErrorReason::Aborted,
                })
            };

            // After Close nothing gets through.
            if done_flag.load(Ordering::SeqCst) {
                return abort();
            }

            // Once a final response exists, block client-side navigations
            // away from the page under analysis; the original navigation
            // chain stays allowed.
            let received_final = obs.lock().map(|o| o.received_final).unwrap_or(false);
            let is_navigation = params.resource_Type == Network::ResourceType::Document;
            if received_final && is_navigation && request_url != original_url {
                interceptor_log.info(&format!("abort navigation to {request_url}"));
                return abort();
            }

            match &blocklist {
                // Screenshot mode renders everything except filtered hosts.
                Some(list) => {
                    let blocked = Url::parse(&request_url)
                        .map(|u| list.should_block(&u))
                        .unwrap_or(false);
                    if blocked {
                        return abort();
                    }
                }
                // Fingerprinting only needs HTML and scripts.
                None => {
                    let allowed = matches!(
                        params.resource_Type,
                        Network::ResourceType::Document | Network::ResourceType::Script
                    );
                    if !allowed {
                        return abort();
                    }
                }
            }

            RequestPausedDecision::Continue(None)
        },
    );
    tab.enable_request_interception(interceptor)
        .map_err(|e| VisitFailure::generic(format!("failed to enable interception: {e}")))?;

    let weak_tab = Arc::downgrade(tab);
    let dialog_log = log.clone();
    tab.add_event_listener(Arc::new(move |event: &Event| {
        if let Event::PageJavascriptDialogOpening(opening) = event {
            dialog_log.info("dismissing dialog");
            if let Some(tab) = weak_tab.upgrade() {
                let accept = opening.params.Type == Page::DialogType::Prompt;
                let _ = tab.call_method(Page::HandleJavaScriptDialog {
                    accept,
                    prompt_text: accept.then(String::new),
                });
            }
        }
    }))
    .map_err(|e| VisitFailure::generic(format!("failed to install dialog handler: {e}")))?;

    Ok(())
}

fn navigate(
    tab: &Arc<Tab>,
    url: &Url,
    flags: VisitFlags,
    config: &RuntimeConfig,
    log: &SessionLog,
) -> Result<(), VisitFailure> {
    let outcome = tab
        .navigate_to(url.as_str())
        .and_then(|t| t.wait_until_navigated())
        .map(|_| ());

    if let Err(e) = outcome {
        if is_timeout_error(&e) {
            // Partial content is still usable.
            log.warn("ignoring navigation timeout");
        } else {
            return Err(VisitFailure::generic(format!("navigation failed: {e}")));
        }
    }

    // Full mode waits out late network activity; there is no network-idle
    // event to subscribe to, so the settle delay stands in for one.
    if !flags.simple {
        std::thread::sleep(Duration::from_millis(config.browser.network_settle_ms));
    }
    Ok(())
}

fn validate_redirect(
    tab: &Arc<Tab>,
    url: &Url,
    flags: VisitFlags,
    config: &RuntimeConfig,
    log: &SessionLog,
    observed: &Arc<Mutex<ResponseObservation>>,
) -> Result<(), VisitFailure> {
    let redirected = observed.lock().map(|o| o.redirected).unwrap_or(false);
    if !redirected {
        return Ok(());
    }

    // A redirect happened but the visible URL did not move: the redirect
    // target itself triggered further client-side navigation. Wait for it
    // to settle on the same budget.
    if tab.get_url() == url.as_str() {
        if let Err(e) = tab.wait_until_navigated() {
            if is_timeout_error(&e) {
                log.warn("ignoring navigation timeout");
            } else {
                return Err(VisitFailure::generic(format!("navigation failed: {e}")));
            }
        }
        if !flags.simple {
            std::thread::sleep(Duration::from_millis(config.browser.network_settle_ms));
        }
    }

    let final_url = tab.get_url();
    if domain_utils::same_registrable_domain_str(url.as_str(), &final_url) {
        log.info(&format!("redirected from {url} to {final_url}"));
        Ok(())
    } else {
        Err(VisitFailure::InvalidRedirect {
            original_url: url.to_string(),
            redirect_url: final_url,
        })
    }
}

fn extract_signals(
    tab: &Arc<Tab>,
    flags: VisitFlags,
    log: &SessionLog,
    observed: &Arc<Mutex<ResponseObservation>>,
) -> Result<SessionOutput, VisitFailure> {
    // The content read is the one unrecoverable extraction: without HTML
    // there is nothing to analyze.
    tab.set_default_timeout(CONTENT_READ_TIMEOUT);
    let html = tab
        .get_content()
        .map_err(|e| VisitFailure::generic(format!("unrecoverable content read failure: {e}")))?;

    // Everything below degrades to a missing field.
    tab.set_default_timeout(EXTRACTION_STEP_TIMEOUT);
    let mut links = match extractor::extract_links(tab) {
        Ok(links) => links,
        Err(e) => {
            log.error(&format!("link extraction failed: {e}"));
            Vec::new()
        }
    };

    tab.set_default_timeout(FORM_LINKS_TIMEOUT);
    match extractor::extract_form_links(tab) {
        Ok(form_links) if !form_links.is_empty() => {
            log.info(&format!("found {} form links", form_links.len()));
            links.extend(form_links);
        }
        Ok(_) => {}
        Err(e) => log.warn(&format!("form link extraction failed: {e}")),
    }

    tab.set_default_timeout(EXTRACTION_STEP_TIMEOUT);
    let scripts = match extractor::extract_scripts(tab) {
        Ok(scripts) => scripts,
        Err(e) => {
            log.error(&format!("script extraction failed: {e}"));
            Vec::new()
        }
    };

    let js = extractor::extract_global_snapshot(tab, log);

    let cookies = match extractor::extract_cookies(tab) {
        Ok(cookies) => cookies,
        Err(e) => {
            log.error(&format!("cookie extraction failed: {e}"));
            Vec::new()
        }
    };

    let screenshot = if flags.screenshot {
        capture_screenshot(tab, log)
    } else {
        None
    };

    let page_texts = page_text::page_texts_from_html(&html, flags.first);

    let (status_code, headers, content_type) = {
        let o = observed
            .lock()
            .map_err(|_| VisitFailure::generic("response observation poisoned"))?;
        (o.status, o.headers.clone(), o.content_type.clone())
    };

    Ok(SessionOutput {
        bundle: SignalBundle {
            status_code,
            headers,
            content_type,
            cookies,
            html,
            links,
            scripts,
            js,
            page_texts,
            screenshot: None,
        },
        screenshot,
    })
}

fn capture_screenshot(tab: &Arc<Tab>, log: &SessionLog) -> Option<Vec<u8>> {
    std::thread::sleep(SCREENSHOT_SETTLE);
    tab.set_default_timeout(SCREENSHOT_TIMEOUT);
    match tab.capture_screenshot(Page::CaptureScreenshotFormatOption::Jpeg, None, None, true) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            log.error(&format!("failed taking screenshot: {e}"));
            None
        }
    }
}

fn is_timeout_error(error: &anyhow::Error) -> bool {
    let message = error.to_string().to_ascii_lowercase();
    message.contains("timeout") || message.contains("timed out") || message.contains("never came")
}

/// Flatten browser header objects into name -> values lists. Duplicate
/// headers arrive joined with newlines and are split back apart.
fn normalize_headers(headers: &Network::Headers) -> BTreeMap<String, Vec<String>> {
    let mut out = BTreeMap::new();
    if let Ok(serde_json::Value::Object(map)) = serde_json::to_value(headers) {
        for (key, value) in map {
            let values = match value {
                serde_json::Value::String(s) => {
                    s.split('\n').map(|v| v.to_string()).collect()
                }
                serde_json::Value::Array(items) => items
                    .into_iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect(),
                other => vec![other.to_string()],
            };
            out.insert(key.to_ascii_lowercase(), values);
        }
    }
    out
}
