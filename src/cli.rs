//! Command-line interface.

use clap::{Parser, Subcommand};

use crate::options::CrawlOptions;

#[derive(Parser, Debug)]
#[command(name = "stackprobe")]
#[command(about = "Renders a site in isolated browser workers and fingerprints its technology stack")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// URL to analyze
    #[arg(value_name = "URL")]
    pub url: Option<String>,

    /// Follow same-site links recursively
    #[arg(short, long)]
    pub recursive: bool,

    /// Maximum crawl depth in recursive mode
    #[arg(long, default_value_t = 3)]
    pub max_depth: u32,

    /// Maximum number of URLs to visit
    #[arg(long, default_value_t = 10)]
    pub max_urls: usize,

    /// Concurrent page visits within one depth level
    #[arg(long, default_value_t = 5)]
    pub chunk_size: usize,

    /// Stagger between same-chunk visit starts, in milliseconds
    #[arg(long, default_value_t = 500)]
    pub delay: u64,

    /// Per-visit wall-clock budget, in milliseconds
    #[arg(long, default_value_t = 5000)]
    pub max_wait: u64,

    /// Column bound for the HTML window handed to the matcher (0 = off)
    #[arg(long, default_value_t = 2000)]
    pub html_max_cols: usize,

    /// Row bound for the HTML window handed to the matcher (0 = off)
    #[arg(long, default_value_t = 3000)]
    pub html_max_rows: usize,

    /// Browser user-agent override
    #[arg(long)]
    pub user_agent: Option<String>,

    /// Proxy server, e.g. socks5://127.0.0.1:9050
    #[arg(long)]
    pub proxy: Option<String>,

    /// Basic-auth credentials as user:password
    #[arg(long)]
    pub auth: Option<String>,

    /// Extra Chromium argument (repeatable)
    #[arg(long = "chromium-arg", value_name = "ARG")]
    pub chromium_args: Vec<String>,

    /// Surface worker stderr and browser chatter
    #[arg(long, global = true)]
    pub debug: bool,

    /// Pretty-print the JSON result
    #[arg(long)]
    pub pretty: bool,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Internal: run one page visit in an isolated worker process.
    #[command(name = "visit-worker", hide = true)]
    VisitWorker {
        #[arg(long)]
        url: String,
        /// Visit policy flags, JSON-encoded.
        #[arg(long)]
        flags: String,
        /// Crawl options, JSON-encoded.
        #[arg(long)]
        options: String,
    },
}

impl Cli {
    /// Assemble crawl options from the flags; validation happens at driver
    /// construction.
    pub fn crawl_options(&self) -> CrawlOptions {
        let (username, password) = match self.auth.as_deref().and_then(|a| a.split_once(':')) {
            Some((user, pass)) => (user.to_string(), pass.to_string()),
            None => (
                self.auth.clone().unwrap_or_default(),
                String::new(),
            ),
        };

        CrawlOptions {
            username,
            password,
            proxy: self.proxy.clone(),
            chunk_size: self.chunk_size,
            debug: self.debug,
            delay_ms: self.delay,
            html_max_cols: self.html_max_cols,
            html_max_rows: self.html_max_rows,
            max_depth: self.max_depth,
            max_urls: self.max_urls,
            max_wait_ms: self.max_wait,
            recursive: self.recursive,
            user_agent: self.user_agent.clone(),
            chromium_args: self.chromium_args.clone(),
        }
    }
}
