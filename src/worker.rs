//! Worker-process side of the page-visit protocol.
//!
//! Each visit runs in a freshly spawned process that owns exactly one
//! browser session; a hung or crashed render never reaches the
//! orchestrator's state. The worker speaks line-delimited JSON on stdout:
//! any number of `log` messages, at most one `ss` (screenshot) message, and
//! exactly one terminal `data` or `error` message.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::warn;
use url::Url;

use crate::blocklist::ContentBlocklist;
use crate::browser::{self, SessionLog};
use crate::config::RuntimeConfig;
use crate::error::VisitFailure;
use crate::options::{CrawlOptions, VisitFlags};
use crate::signals::SignalBundle;

/// Exit code for a classified visit failure (an `error` message was sent).
pub const EXIT_VISIT_FAILED: i32 = 2;
/// Exit code for an unclassified crash inside the session.
pub const EXIT_PANIC: i32 = 10;

/// Failure kind tag carried by `error` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerErrorKind {
    Redirect,
    Generic,
}

/// One line of the worker protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum WorkerMessage {
    Log {
        message: String,
        source: String,
        #[serde(rename = "type")]
        level: String,
    },
    /// Screenshot bytes, base64-encoded.
    Ss {
        data: String,
    },
    Data(Box<SignalBundle>),
    Error {
        message: String,
        #[serde(rename = "type")]
        kind: WorkerErrorKind,
        #[serde(
            rename = "originalUrl",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        original_url: Option<String>,
        #[serde(
            rename = "redirectUrl",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        redirect_url: Option<String>,
    },
}

impl WorkerMessage {
    pub fn from_failure(failure: &VisitFailure) -> Self {
        match failure {
            VisitFailure::InvalidRedirect {
                original_url,
                redirect_url,
            } => WorkerMessage::Error {
                message: failure.to_string(),
                kind: WorkerErrorKind::Redirect,
                original_url: Some(original_url.clone()),
                redirect_url: Some(redirect_url.clone()),
            },
            VisitFailure::Generic(message) => WorkerMessage::Error {
                message: message.clone(),
                kind: WorkerErrorKind::Generic,
                original_url: None,
                redirect_url: None,
            },
        }
    }
}

/// Arguments the orchestrator passes on the worker command line.
#[derive(Debug, Clone)]
pub struct WorkerArgs {
    pub url: String,
    pub flags_json: String,
    pub options_json: String,
}

/// Worker entrypoint; returns the process exit code.
pub async fn run(args: WorkerArgs) -> i32 {
    let url = match Url::parse(&args.url) {
        Ok(url) => url,
        Err(e) => {
            eprintln!("invalid worker url {}: {e}", args.url);
            return 1;
        }
    };
    let flags: VisitFlags = match serde_json::from_str(&args.flags_json) {
        Ok(flags) => flags,
        Err(e) => {
            eprintln!("invalid worker flags: {e}");
            return 1;
        }
    };
    let options: CrawlOptions = match serde_json::from_str(&args.options_json) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("invalid worker options: {e}");
            return 1;
        }
    };

    let config = RuntimeConfig::load().unwrap_or_else(|e| {
        warn!("runtime config rejected, using defaults: {e}");
        RuntimeConfig::default()
    });

    // Screenshot mode renders with full resources and needs the filter
    // list; a fetch failure degrades to unfiltered rendering.
    let blocklist = if flags.screenshot {
        match ContentBlocklist::load(&config.blocklist.url, &config.blocklist.cache_path()).await {
            Ok(list) => Some(Arc::new(list)),
            Err(e) => {
                warn!("blocklist unavailable, rendering unfiltered: {e}");
                None
            }
        }
    } else {
        None
    };

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<WorkerMessage>();

    // Messages stream out as the session produces them so the orchestrator
    // sees logs from a hung visit before killing it.
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(message) = rx.recv().await {
            let Ok(mut line) = serde_json::to_string(&message) else {
                continue;
            };
            line.push('\n');
            if stdout.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    let log_tx = tx.clone();
    let pid = std::process::id();
    let session_log = SessionLog::new(move |level, message| {
        let _ = log_tx.send(WorkerMessage::Log {
            message: format!("[{pid}] {message}"),
            source: "browser".to_string(),
            level: level.to_string(),
        });
    });

    let session = {
        let url = url.clone();
        tokio::task::spawn_blocking(move || {
            browser::run_visit(&url, flags, &options, &config, blocklist, session_log)
        })
        .await
    };

    let exit_code = match session {
        Ok(Ok(output)) => {
            if let Some(bytes) = output.screenshot {
                let _ = tx.send(WorkerMessage::Ss {
                    data: BASE64.encode(bytes),
                });
            }
            let _ = tx.send(WorkerMessage::Data(Box::new(output.bundle)));
            0
        }
        Ok(Err(failure)) => {
            let _ = tx.send(WorkerMessage::from_failure(&failure));
            EXIT_VISIT_FAILED
        }
        Err(join_error) => {
            let _ = tx.send(WorkerMessage::Error {
                message: format!("page {url} crashed: {join_error}"),
                kind: WorkerErrorKind::Generic,
                original_url: None,
                redirect_url: None,
            });
            EXIT_PANIC
        }
    };

    drop(tx);
    let _ = writer.await;
    exit_code
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_message_wire_format() {
        let message = WorkerMessage::Log {
            message: "hello".to_string(),
            source: "browser".to_string(),
            level: "info".to_string(),
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "log");
        assert_eq!(json["data"]["message"], "hello");
        assert_eq!(json["data"]["type"], "info");
    }

    #[test]
    fn test_error_message_wire_format() {
        let message = WorkerMessage::from_failure(&VisitFailure::InvalidRedirect {
            original_url: "https://a.example.com/".to_string(),
            redirect_url: "https://b.other.org/".to_string(),
        });
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["data"]["type"], "redirect");
        assert_eq!(json["data"]["originalUrl"], "https://a.example.com/");
        assert_eq!(json["data"]["redirectUrl"], "https://b.other.org/");
    }

    #[test]
    fn test_data_message_round_trip() {
        let bundle = SignalBundle {
            status_code: 200,
            html: "<html></html>".to_string(),
            ..Default::default()
        };
        let message = WorkerMessage::Data(Box::new(bundle));
        let line = serde_json::to_string(&message).unwrap();
        let back: WorkerMessage = serde_json::from_str(&line).unwrap();
        match back {
            WorkerMessage::Data(bundle) => assert_eq!(bundle.status_code, 200),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_generic_failure_message() {
        let message = WorkerMessage::from_failure(&VisitFailure::generic("boom"));
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["data"]["type"], "generic");
        assert_eq!(json["data"]["message"], "boom");
    }
}
