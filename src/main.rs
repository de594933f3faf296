use std::env;
use std::process::ExitCode;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use gridthumb::app::{ThumbnailBrowser, UiEvent};
use gridthumb::cli::{self, Args};
use gridthumb::scanner::{FileScanner, ScanConfig};
use gridthumb::thumbnails::ThumbnailManager;

/// Longest single wait inside the loop.
const PUMP_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);

fn main() -> ExitCode {
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    if let Ok(directive) = "gridthumb=info".parse() {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = match cli::parse_args(env::args().skip(1)) {
        Ok(Some(args)) => args,
        Ok(None) => {
            println!("{}", cli::USAGE);
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            eprintln!("{e:#}\n{}", cli::USAGE);
            return ExitCode::FAILURE;
        }
    };

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<()> {
    let manager = ThumbnailManager::new(&args.config);
    if args.clear_cache {
        manager.clear().context("Failed to clear thumbnail cache")?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    let scanner = FileScanner::with_config(ScanConfig {
        recursive: args.recursive,
        ..Default::default()
    });
    let scan = runtime.block_on(scanner.scan_directory(&args.directory))?;
    info!(
        path = ?args.directory,
        images = scan.items.len(),
        errors = scan.error_count,
        "Scanned directory"
    );

    let started = Instant::now();
    let mut browser = ThumbnailBrowser::new(&manager, &args.config, args.viewport);
    browser.set_items(scan.items, started);

    log_notices(&mut browser);

    while !browser.is_settled() {
        if started.elapsed() >= args.timeout {
            warn!(timeout = ?args.timeout, "Gave up waiting for visible thumbnails");
            break;
        }
        browser.pump_wait(PUMP_INTERVAL);
        log_notices(&mut browser);
    }

    info!(elapsed = ?started.elapsed(), "Visible set resolved");
    browser.log_summary();
    Ok(())
}

fn log_notices(browser: &mut ThumbnailBrowser<'_>) {
    for event in browser.drain_events() {
        if let UiEvent::Notice(message) = event {
            warn!("{message}");
        }
    }
}
