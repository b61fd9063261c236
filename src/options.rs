//! Per-crawl options, validated and coerced once at construction.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OptionsError {
    #[error("chunk_size must be at least 1")]
    ZeroChunkSize,

    #[error("max_urls must be at least 1")]
    ZeroMaxUrls,

    #[error("max_depth must be at least 1")]
    ZeroMaxDepth,

    #[error("max_wait_ms must be at least {min} ms (got {got})")]
    MaxWaitTooSmall { min: u64, got: u64 },
}

/// Immutable configuration for one crawl invocation.
///
/// Serializes to JSON so the orchestrator can hand it to the worker process
/// verbatim on the command line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlOptions {
    pub username: String,
    pub password: String,
    pub proxy: Option<String>,
    /// Peak number of concurrent page visits within a depth level.
    pub chunk_size: usize,
    pub debug: bool,
    /// Stagger between same-chunk visit starts; forced to 0 when the crawl
    /// is not recursive.
    pub delay_ms: u64,
    /// HTML window bounds handed to the matcher; 0 disables windowing.
    pub html_max_cols: usize,
    pub html_max_rows: usize,
    pub max_depth: u32,
    pub max_urls: usize,
    /// Hard wall-clock budget for a single page load.
    pub max_wait_ms: u64,
    pub recursive: bool,
    pub user_agent: Option<String>,
    /// Extra arguments appended to the browser command line.
    pub chromium_args: Vec<String>,
}

impl Default for CrawlOptions {
    fn default() -> Self {
        CrawlOptions {
            username: String::new(),
            password: String::new(),
            proxy: None,
            chunk_size: 5,
            debug: false,
            delay_ms: 500,
            html_max_cols: 2000,
            html_max_rows: 3000,
            max_depth: 3,
            max_urls: 10,
            max_wait_ms: 5000,
            recursive: false,
            user_agent: None,
            chromium_args: Vec::new(),
        }
    }
}

impl CrawlOptions {
    /// Validate and coerce the options. Runs exactly once, at crawl
    /// construction; the returned value is never mutated afterwards.
    pub fn validated(mut self) -> Result<Self, OptionsError> {
        if self.chunk_size == 0 {
            return Err(OptionsError::ZeroChunkSize);
        }
        if self.max_urls == 0 {
            return Err(OptionsError::ZeroMaxUrls);
        }
        if self.max_depth == 0 {
            return Err(OptionsError::ZeroMaxDepth);
        }
        const MIN_WAIT_MS: u64 = 1000;
        if self.max_wait_ms < MIN_WAIT_MS {
            return Err(OptionsError::MaxWaitTooSmall {
                min: MIN_WAIT_MS,
                got: self.max_wait_ms,
            });
        }
        // The stagger only exists to spread out recursive batches.
        if !self.recursive {
            self.delay_ms = 0;
        }
        Ok(self)
    }

    /// Navigation timeout: the page-automation layer gets 10% headroom over
    /// the configured budget so the outer guard fires first.
    pub fn navigation_timeout_ms(&self) -> u64 {
        self.max_wait_ms + self.max_wait_ms / 10
    }
}

/// Per-visit policy flags handed to the worker.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VisitFlags {
    /// Use the faster, less complete load strategy (retry path).
    pub simple: bool,
    /// Capture a screenshot; requested for the crawl's first visit only.
    pub screenshot: bool,
    /// This is the crawl's seed URL; only it contributes linked-data text.
    pub first: bool,
}
