//! Command-line arguments of the headless driver.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::config::ThumbnailConfig;
use crate::layout::Viewport;
use crate::thumbnails::key::SizeClass;

pub const USAGE: &str = "usage: gridthumb [--no-disk-cache] [--cache-dir DIR] [--workers N] \
[--memory-mb N] [--size N] [--viewport WxH] [--recursive] [--timeout-secs N] [--clear-cache] <directory>";

const DEFAULT_VIEWPORT: Viewport = Viewport {
    width: 1280,
    height: 800,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct Args {
    pub directory: PathBuf,
    pub config: ThumbnailConfig,
    pub viewport: Viewport,
    pub recursive: bool,
    pub clear_cache: bool,
    /// Give up waiting for the visible set after this long.
    pub timeout: Duration,
}

fn parse_viewport(value: &str) -> Result<Viewport> {
    let (w, h) = value
        .split_once(['x', 'X'])
        .context("--viewport expects WIDTHxHEIGHT")?;
    let width = w
        .parse::<u32>()
        .context("Failed to parse viewport width")?;
    let height = h
        .parse::<u32>()
        .context("Failed to parse viewport height")?;
    if width == 0 || height == 0 {
        bail!("--viewport dimensions must be greater than 0");
    }
    Ok(Viewport::new(width, height))
}

/// Parse arguments (without the program name). `Ok(None)` means help was
/// requested.
pub fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Option<Args>> {
    let mut config = ThumbnailConfig::default();
    let mut directory: Option<PathBuf> = None;
    let mut viewport = DEFAULT_VIEWPORT;
    let mut recursive = false;
    let mut clear_cache = false;
    let mut timeout = DEFAULT_TIMEOUT;

    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(None),
            "--no-disk-cache" => config = config.disk_cache(false),
            "--recursive" => recursive = true,
            "--clear-cache" => clear_cache = true,
            "--cache-dir" => {
                let value = args.next().context("Missing value for --cache-dir")?;
                config = config.cache_dir(PathBuf::from(value));
            }
            "--workers" => {
                let value = args.next().context("Missing value for --workers")?;
                let workers = value
                    .parse::<usize>()
                    .context("Failed to parse --workers as a positive integer")?;
                if workers == 0 {
                    bail!("--workers must be greater than 0");
                }
                config = config.workers(workers);
            }
            "--memory-mb" => {
                let value = args.next().context("Missing value for --memory-mb")?;
                let mb = value
                    .parse::<usize>()
                    .context("Failed to parse --memory-mb as a positive integer")?;
                config = config.max_memory_mb(mb);
            }
            "--size" => {
                let value = args.next().context("Missing value for --size")?;
                let pixels = value
                    .parse::<u32>()
                    .context("Failed to parse --size as a positive integer")?;
                config = config.size_class(SizeClass::nearest(pixels));
            }
            "--viewport" => {
                let value = args.next().context("Missing value for --viewport")?;
                viewport = parse_viewport(&value)?;
            }
            "--timeout-secs" => {
                let value = args.next().context("Missing value for --timeout-secs")?;
                let secs = value
                    .parse::<u64>()
                    .context("Failed to parse --timeout-secs as a non-negative integer")?;
                timeout = Duration::from_secs(secs);
            }
            other if other.starts_with('-') => bail!("Unknown option {other}"),
            _ => {
                if directory.is_some() {
                    bail!("Only one directory may be given");
                }
                directory = Some(PathBuf::from(arg));
            }
        }
    }

    let directory = directory.context("Missing <directory> argument")?;
    Ok(Some(Args {
        directory,
        config,
        viewport,
        recursive,
        clear_cache,
        timeout,
    }))
}
