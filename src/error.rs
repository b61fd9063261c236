//! Error taxonomy for crawl and visit failures.
//!
//! Fetch errors are recorded per URL in the crawl result and never abort the
//! crawl; visit failures travel over the worker protocol and are classified
//! by the orchestrator.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a failed page fetch, recorded against the URL entry
/// in the visited registry. Each kind carries a fixed human-readable message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FetchErrorKind {
    ResponseNotOk,
    NoResponse,
    /// Reserved: declared so result consumers can match on it.
    NoHtmlDocument,
    UnknownError,
}

impl FetchErrorKind {
    pub fn message(&self) -> &'static str {
        match self {
            FetchErrorKind::ResponseNotOk => "Response was not ok",
            FetchErrorKind::NoResponse => "No response from server",
            FetchErrorKind::NoHtmlDocument => "No HTML document",
            FetchErrorKind::UnknownError => "Unknown error",
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            FetchErrorKind::ResponseNotOk => "RESPONSE_NOT_OK",
            FetchErrorKind::NoResponse => "NO_RESPONSE",
            FetchErrorKind::NoHtmlDocument => "NO_HTML_DOCUMENT",
            FetchErrorKind::UnknownError => "UNKNOWN_ERROR",
        }
    }
}

/// Error entry stored alongside a URL in the crawl result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlError {
    #[serde(rename = "type")]
    pub kind: FetchErrorKind,
    pub message: String,
}

impl From<FetchErrorKind> for UrlError {
    fn from(kind: FetchErrorKind) -> Self {
        UrlError {
            kind,
            message: kind.message().to_string(),
        }
    }
}

/// A failed page visit as reported by the worker process.
///
/// Invalid redirects are kept distinct from everything else because the
/// orchestrator records them as crawl-level redirect metadata (seed page)
/// instead of a per-URL error, and never retries them.
#[derive(Debug, Clone, Error)]
pub enum VisitFailure {
    #[error("invalid redirect from {original_url} to {redirect_url}")]
    InvalidRedirect {
        original_url: String,
        redirect_url: String,
    },

    #[error("{0}")]
    Generic(String),
}

impl VisitFailure {
    pub fn generic(message: impl Into<String>) -> Self {
        VisitFailure::Generic(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_messages_are_fixed() {
        assert_eq!(FetchErrorKind::ResponseNotOk.message(), "Response was not ok");
        assert_eq!(FetchErrorKind::NoResponse.message(), "No response from server");
        assert_eq!(FetchErrorKind::NoHtmlDocument.message(), "No HTML document");
        assert_eq!(FetchErrorKind::UnknownError.message(), "Unknown error");
    }

    #[test]
    fn test_url_error_serializes_with_tag() {
        let err = UrlError::from(FetchErrorKind::ResponseNotOk);
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["type"], "RESPONSE_NOT_OK");
        assert_eq!(json["message"], "Response was not ok");
    }
}
