// src/main.rs

use anyhow::{bail, Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use partfetch::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

const BAR_TEMPLATE: &str =
    "{spinner:.blue} [{elapsed_precise}] {wide_bar:.cyan/blue} {bytes}/{total_bytes} ({bytes_per_sec}, {eta})";

/// Segmented, resumable HTTP downloader.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Url to download.
    url: Option<String>,

    /// JSON config file; command line flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for the final file and its partial files.
    #[arg(short, long)]
    dir: Option<PathBuf>,

    /// Sub-directory created under the download directory.
    #[arg(long)]
    base_folder: Option<String>,

    /// Output filename; detected from the url when absent.
    #[arg(short, long)]
    output: Option<String>,

    /// Number of parallel segments.
    #[arg(short, long)]
    concurrency: Option<usize>,

    /// Bytes copied per write.
    #[arg(long)]
    buffer_size: Option<usize>,

    /// Extra request header, as `Name: value`. Repeatable.
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,

    /// Maximum retries for transient transport errors.
    #[arg(long)]
    retry_max: Option<u32>,

    /// Minimum backoff between retries, in seconds.
    #[arg(long)]
    retry_wait_min: Option<u64>,

    /// Maximum backoff between retries, in seconds.
    #[arg(long)]
    retry_wait_max: Option<u64>,

    /// Stop the remaining segments as soon as one fails.
    #[arg(long)]
    cancel_on_error: bool,

    /// Continue from the partial files of an earlier run; fails if the server cannot serve ranges.
    #[arg(long)]
    resume: bool,

    /// Hide the progress bar.
    #[arg(long)]
    no_progress: bool,

    /// Print the result as JSON.
    #[arg(long)]
    json: bool,

    /// Verbose logging.
    #[arg(long)]
    debug: bool,
}

impl Args {
    fn into_config(self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_json_file(path)?,
            None => Config::default(),
        };
        if let Some(url) = self.url {
            config.url = url;
        }
        if let Some(dir) = self.dir {
            config.root_path = dir;
        }
        if let Some(folder) = self.base_folder.as_deref() {
            config = config.with_base_folder(folder);
        }
        if self.output.is_some() {
            config.filename = self.output;
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(size) = self.buffer_size {
            config.copy_buffer_size = size;
        }
        for header in &self.headers {
            let (name, value) = header
                .split_once(':')
                .with_context(|| format!("header {header:?} is not `Name: value`"))?;
            config
                .headers
                .insert(name.trim().to_string(), value.trim().to_string());
        }
        if let Some(max) = self.retry_max {
            config.retry.max_retries = max;
        }
        if let Some(secs) = self.retry_wait_min {
            config.retry.wait_min = Duration::from_secs(secs);
        }
        if let Some(secs) = self.retry_wait_max {
            config.retry.wait_max = Duration::from_secs(secs);
        }
        if self.cancel_on_error {
            config.failure_policy = FailurePolicy::CancelSiblings;
        }
        if self.no_progress {
            config.show_progress = false;
        }
        config.debug |= self.debug;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let (json, resume) = (args.json, args.resume);
    let config = args.into_config()?;

    let default_level = if config.debug { "partfetch=debug" } else { "partfetch=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let show_progress = config.show_progress;
    let mut downloader = Downloader::new(config)?;
    let renderer = if show_progress {
        let (tx, rx) = mpsc::channel(64);
        downloader = downloader.with_progress(tx);
        Some(tokio::spawn(render(rx)))
    } else {
        None
    };
    let downloader = Arc::new(downloader);

    let pauser = downloader.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            pauser.pause().await;
        }
    });

    let outcome = if resume {
        downloader.resume().await
    } else {
        downloader.download().await
    };
    interrupt.abort();
    let _ = interrupt.await;
    drop(downloader);
    if let Some(renderer) = renderer {
        let _ = renderer.await;
    }

    match outcome? {
        Outcome::Completed(result) if json => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Outcome::Completed(result) => {
            println!("Downloaded {} ({} bytes)", result.path.display(), result.size);
            println!("  from {}", result.origin_url);
        }
        Outcome::Paused(paused) if paused.transfer.is_segmentable() => {
            info!(downloaded = paused.downloaded(), "paused");
            println!(
                "Paused after {} bytes; run again with --resume to continue.",
                paused.downloaded()
            );
        }
        Outcome::Paused(_) => bail!("download interrupted; the server does not support resuming"),
    }
    Ok(())
}

/// Draws progress events until the sender side is dropped.
///
/// The final event can be dropped on a full channel, so the bar is also
/// finished when the channel closes.
async fn render(mut rx: mpsc::Receiver<ProgressEvent>) {
    let mut bar: Option<ProgressBar> = None;
    while let Some(event) = rx.recv().await {
        let bar = bar.get_or_insert_with(|| {
            let bar = match event.total {
                Some(total) => ProgressBar::new(total),
                None => ProgressBar::new_spinner(),
            };
            if let Ok(style) = ProgressStyle::with_template(BAR_TEMPLATE) {
                bar.set_style(style);
            }
            bar
        });
        bar.set_position(event.transferred);
        if event.finished {
            bar.finish();
            return;
        }
    }
    if let Some(bar) = bar {
        bar.finish();
    }
}
