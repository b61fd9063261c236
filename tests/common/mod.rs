//! Shared test fixtures: an in-process stand-in for the worker dispatcher
//! and builders for canned page results.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use url::Url;

use stackprobe::dispatch::{VisitDispatcher, WorkerOutput};
use stackprobe::error::VisitFailure;
use stackprobe::options::{CrawlOptions, VisitFlags};
use stackprobe::signals::{PageLink, PageTexts, SignalBundle};

/// Scripted behavior for one URL.
#[derive(Clone)]
#[allow(dead_code)]
pub enum StubBehavior {
    Succeed(SignalBundle),
    SucceedWithScreenshot(SignalBundle, Vec<u8>),
    /// Fail the full-mode attempt, succeed the simple-mode retry.
    FailThenSucceed(SignalBundle),
    AlwaysFail(String),
    InvalidRedirect { redirect_url: String },
}

/// Dispatcher that replays scripted outcomes and records every call with
/// the flags it carried.
#[derive(Clone, Default)]
pub struct StubDispatcher {
    pages: HashMap<String, StubBehavior>,
    pub calls: Arc<Mutex<Vec<(String, VisitFlags)>>>,
    delay_ms: u64,
}

#[allow(dead_code)]
impl StubDispatcher {
    pub fn new() -> Self {
        StubDispatcher::default()
    }

    pub fn page(mut self, href: &str, behavior: StubBehavior) -> Self {
        self.pages.insert(href.to_string(), behavior);
        self
    }

    /// Simulated per-visit latency, to exercise chunk settling.
    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    pub fn recorded_calls(&self) -> Vec<(String, VisitFlags)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, href: &str) -> Vec<VisitFlags> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(url, _)| url == href)
            .map(|(_, flags)| *flags)
            .collect()
    }
}

impl VisitDispatcher for StubDispatcher {
    fn dispatch(
        &self,
        url: Url,
        flags: VisitFlags,
        _options: CrawlOptions,
    ) -> BoxFuture<'static, Result<WorkerOutput, VisitFailure>> {
        self.calls
            .lock()
            .unwrap()
            .push((url.as_str().to_string(), flags));
        let behavior = self.pages.get(url.as_str()).cloned();
        let delay_ms = self.delay_ms;

        Box::pin(async move {
            if delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
            match behavior {
                None => Err(VisitFailure::generic(format!("no stub page for {url}"))),
                Some(StubBehavior::Succeed(bundle)) => Ok(WorkerOutput {
                    bundle,
                    screenshot: None,
                }),
                Some(StubBehavior::SucceedWithScreenshot(bundle, bytes)) => Ok(WorkerOutput {
                    bundle,
                    screenshot: Some(bytes),
                }),
                Some(StubBehavior::FailThenSucceed(bundle)) => {
                    if flags.simple {
                        Ok(WorkerOutput {
                            bundle,
                            screenshot: None,
                        })
                    } else {
                        Err(VisitFailure::generic("page load failed"))
                    }
                }
                Some(StubBehavior::AlwaysFail(message)) => Err(VisitFailure::Generic(message)),
                Some(StubBehavior::InvalidRedirect { redirect_url }) => {
                    Err(VisitFailure::InvalidRedirect {
                        original_url: url.to_string(),
                        redirect_url,
                    })
                }
            }
        })
    }
}

/// A minimal successful page with the given status and outgoing links.
#[allow(dead_code)]
pub fn page(status: u16, links: &[&str]) -> SignalBundle {
    SignalBundle {
        status_code: status,
        html: "<html><head><title>stub</title></head><body></body></html>".to_string(),
        links: links.iter().map(|href| page_link(href)).collect(),
        ..Default::default()
    }
}

/// A page that also carries text fields, for accumulator tests.
#[allow(dead_code)]
pub fn page_with_texts(status: u16, links: &[&str], texts: PageTexts) -> SignalBundle {
    SignalBundle {
        page_texts: texts,
        ..page(status, links)
    }
}

/// Build a PageLink the way the in-page extractor would.
#[allow(dead_code)]
pub fn page_link(href: &str) -> PageLink {
    let url = Url::parse(href).expect("stub link must parse");
    PageLink {
        hash: url.fragment().map(|f| format!("#{f}")).unwrap_or_default(),
        hostname: url.host_str().unwrap_or_default().to_string(),
        href: href.to_string(),
        pathname: url.path().to_string(),
        protocol: format!("{}:", url.scheme()),
        rel: String::new(),
        search: url.query().map(|q| format!("?{q}")).unwrap_or_default(),
    }
}
