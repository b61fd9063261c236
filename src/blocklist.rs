//! Content-blocking filter list used in screenshot mode.
//!
//! When a screenshot is requested the page is rendered with styles and
//! images enabled, so ad and cookie-banner noise would end up in the
//! capture. The filter list is fetched once and cached on disk; concurrent
//! workers may race to populate the cache, which is harmless because the
//! parsed result is identical.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, warn};
use url::Url;

/// Filter list the original deployment uses: EU cookie-banner blocking.
pub const DEFAULT_FILTER_LIST_URL: &str =
    "https://raw.githubusercontent.com/iAlex97/block-the-eu-cookie-shit-list/development/filterlist_v2.txt";

const FETCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Parsed network-filter domains from an adblock-style list.
#[derive(Debug, Clone, Default)]
pub struct ContentBlocklist {
    domains: HashSet<String>,
}

impl ContentBlocklist {
    /// Parse adblock-style filter syntax, keeping only the domain-anchored
    /// network rules (`||domain.tld^...`). Cosmetic rules, comments, and
    /// exceptions are skipped; this blocker only needs request-level
    /// decisions.
    pub fn parse(text: &str) -> Self {
        let mut domains = HashSet::new();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('!') || line.starts_with('[') {
                continue;
            }
            // Exception and cosmetic rules never block requests.
            if line.starts_with("@@") || line.contains("##") || line.contains("#@#") {
                continue;
            }
            let Some(rest) = line.strip_prefix("||") else {
                continue;
            };
            let domain: String = rest
                .chars()
                .take_while(|c| !matches!(c, '^' | '/' | '$' | '|' | '*'))
                .collect();
            let domain = domain.trim().to_ascii_lowercase();
            if domain.contains('.') {
                domains.insert(domain);
            }
        }

        ContentBlocklist { domains }
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// Whether a request URL's host is covered by the list (exact match or
    /// any parent domain).
    pub fn should_block(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();

        let mut labels = host.as_str();
        loop {
            if self.domains.contains(labels) {
                return true;
            }
            match labels.find('.') {
                Some(idx) => labels = &labels[idx + 1..],
                None => return false,
            }
        }
    }

    /// Load the list, preferring the on-disk cache. A cache miss fetches the
    /// list and best-effort writes it back; a failed write only costs the
    /// next run a refetch.
    pub async fn load(list_url: &str, cache_path: &Path) -> Result<Self> {
        if let Ok(cached) = tokio::fs::read_to_string(cache_path).await {
            let list = Self::parse(&cached);
            if !list.is_empty() {
                debug!(
                    "loaded {} blocklist entries from cache {}",
                    list.len(),
                    cache_path.display()
                );
                return Ok(list);
            }
        }

        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .context("failed to build blocklist HTTP client")?;

        let text = client
            .get(list_url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("failed to fetch filter list from {list_url}"))?
            .text()
            .await
            .context("failed to read filter list body")?;

        if let Some(parent) = cache_path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        if let Err(e) = tokio::fs::write(cache_path, &text).await {
            warn!("failed to cache filter list at {}: {}", cache_path.display(), e);
        }

        let list = Self::parse(&text);
        debug!("fetched {} blocklist entries from {}", list.len(), list_url);
        Ok(list)
    }
}

/// Default on-disk location for the cached filter list.
pub fn default_cache_path() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("stackprobe")
        .join("blocklist.txt")
}
