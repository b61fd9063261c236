use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use stackprobe::cli::{Cli, Commands};
use stackprobe::dispatch::ProcessDispatcher;
use stackprobe::driver::Driver;
use stackprobe::lang::NullLanguageDetector;
use stackprobe::matcher::NullMatcher;
use stackprobe::worker::{self, WorkerArgs};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    // Hidden worker mode: one isolated page visit, protocol on stdout.
    if let Some(Commands::VisitWorker { url, flags, options }) = cli.command {
        let code = worker::run(WorkerArgs {
            url,
            flags_json: flags,
            options_json: options,
        })
        .await;
        std::process::exit(code);
    }

    let Some(url) = cli.url.clone() else {
        eprintln!("error: no URL given\n\nUsage: stackprobe [OPTIONS] <URL>");
        std::process::exit(2);
    };

    let options = cli.crawl_options();
    let dispatcher = ProcessDispatcher::from_current_exe()?;
    let driver = Driver::new(
        &url,
        options,
        Box::new(NullMatcher::default()),
        Box::new(NullLanguageDetector),
        Box::new(dispatcher),
    )?;

    let result = driver.analyze().await;

    let rendered = if cli.pretty {
        serde_json::to_string_pretty(&result)?
    } else {
        serde_json::to_string(&result)?
    };
    println!("{rendered}");

    Ok(())
}

/// Logs always go to stderr: stdout belongs to the result JSON in driver
/// mode and to the message protocol in worker mode.
fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("stackprobe={level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
