//! stackprobe: crawl a site, render each page in an isolated browser
//! process, and feed the extracted signals to a technology-fingerprinting
//! matcher.
//!
//! The two load-bearing pieces are the crawl orchestrator ([`driver`]) and
//! the page-visit machinery ([`dispatch`] / [`worker`] / [`browser`]); the
//! rest is signal extraction and the seams to external collaborators.

pub mod blocklist;
pub mod browser;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod domain_utils;
pub mod driver;
pub mod error;
pub mod extractor;
pub mod lang;
pub mod matcher;
pub mod options;
pub mod page_text;
pub mod signals;
pub mod worker;

pub use driver::{CrawlResult, Driver};
pub use error::{FetchErrorKind, VisitFailure};
pub use options::{CrawlOptions, VisitFlags};
pub use signals::{PageTexts, SignalBundle};
