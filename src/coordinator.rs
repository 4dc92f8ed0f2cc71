// src/coordinator.rs

use crate::config::{Config, ConfigError, FailurePolicy};
use crate::merger::{self, MergeError};
use crate::metadata::{self, MetadataError};
use crate::models::{Outcome, PausedTransfer, Phase, Segment, Transfer, TransferResult, TransferState};
use crate::planner::plan_segments;
use crate::progress::{Counter, ProgressEvent, Reporter};
use crate::transport::{ReqwestTransport, ResponseMeta, Transport, TransportError};
use crate::worker::{self, CopyEnd, SegmentWorker, TransferError};
use futures_util::future::join_all;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),
    #[error("{} already exists", .0.display())]
    AlreadyExists(PathBuf),
    #[error("transfer failed: {0}")]
    Transfer(TransferFailures),
    #[error("merge failed: {0}")]
    Merge(#[from] MergeError),
    #[error("transport setup failed: {0}")]
    Transport(#[from] TransportError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A worker failure, tagged with its segment.
#[derive(Debug, Error)]
#[error("segment {index}: {source}")]
pub struct SegmentFailure {
    pub index: usize,
    #[source]
    pub source: TransferError,
}

/// Every worker failure of one attempt, ordered by segment index.
#[derive(Debug)]
pub struct TransferFailures(Vec<SegmentFailure>);

impl TransferFailures {
    pub fn new(mut failures: Vec<SegmentFailure>) -> Self {
        failures.sort_by_key(|f| f.index);
        Self(failures)
    }

    /// The failure with the lowest segment index.
    pub fn first(&self) -> Option<&SegmentFailure> {
        self.0.first()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SegmentFailure> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> Vec<SegmentFailure> {
        self.0
    }
}

impl fmt::Display for TransferFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_slice() {
            [] => write!(f, "no segment failed"),
            [only] => write!(f, "{}", only),
            [first, rest @ ..] => write!(f, "{} (and {} more failed segments)", first, rest.len()),
        }
    }
}

impl std::error::Error for TransferFailures {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.first().map(|f| f as &(dyn std::error::Error + 'static))
    }
}

/// Drives one transfer from probe to merged file.
pub struct Downloader {
    config: Config,
    transport: Arc<dyn Transport>,
    pause_token: Mutex<CancellationToken>,
    resume_requested: AtomicBool,
    progress: Option<mpsc::Sender<ProgressEvent>>,
    phase: watch::Sender<Phase>,
}

impl Downloader {
    /// Create a downloader backed by the reqwest transport.
    pub fn new(config: Config) -> Result<Self, DownloadError> {
        let transport = ReqwestTransport::new(&config)?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    pub fn with_transport(config: Config, transport: Arc<dyn Transport>) -> Self {
        let (phase, _) = watch::channel(Phase::Created);
        Self {
            config,
            transport,
            pause_token: Mutex::new(CancellationToken::new()),
            resume_requested: AtomicBool::new(false),
            progress: None,
            phase,
        }
    }

    /// Send progress snapshots to `tx` every `progress_interval`.
    pub fn with_progress(mut self, tx: mpsc::Sender<ProgressEvent>) -> Self {
        self.progress = Some(tx);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Follows the phase of the current transfer.
    pub fn phase(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    /// Ask the running transfer to stop after its current piece.
    ///
    /// Partial files are kept so that a later [`Downloader::resume`] or
    /// [`Downloader::download`] can pick up where the workers stopped.
    pub async fn pause(&self) {
        info!(url = %self.config.url, "pause requested");
        self.pause_token.lock().await.cancel();
    }

    /// The token that [`Downloader::pause`] cancels. Cancelling a clone of it
    /// pauses the running transfer the same way.
    ///
    /// A cancelled token is replaced when the next run starts, so the clone
    /// only reaches the run that was current when it was taken.
    pub async fn cancel_token(&self) -> CancellationToken {
        self.pause_token.lock().await.clone()
    }

    /// Continue a paused (or interrupted) transfer.
    ///
    /// Fails with [`DownloadError::UnsupportedOperation`] when the server
    /// does not support ranged requests.
    pub async fn resume(&self) -> Result<Outcome, DownloadError> {
        self.start(true).await;
        let mut state = TransferState::default();
        let result = self.resolve_and_run(&mut state).await;
        self.finish(&mut state, result)
    }

    /// Probe the url without downloading anything.
    pub async fn resolve(&self) -> Result<Transfer, DownloadError> {
        Ok(metadata::resolve(self.transport.as_ref(), &self.config).await?)
    }

    /// Resolve the url, then download it. Partial files left by an earlier
    /// run are picked up as well.
    pub async fn download(&self) -> Result<Outcome, DownloadError> {
        self.start(false).await;
        let mut state = TransferState::default();
        let result = self.resolve_and_run(&mut state).await;
        self.finish(&mut state, result)
    }

    /// Download an already resolved transfer.
    ///
    /// Fails with [`DownloadError::AlreadyExists`] before any request is
    /// made when the output file is present.
    pub async fn download_transfer(&self, transfer: &Transfer) -> Result<Outcome, DownloadError> {
        self.start(false).await;
        let mut state = TransferState::default();
        let result = self.run(transfer, &mut state).await;
        self.finish(&mut state, result)
    }

    /// Resets the per-run state: a pause only applies to the run it was
    /// issued against.
    async fn start(&self, resume: bool) {
        self.resume_requested.store(resume, Ordering::SeqCst);
        {
            let mut token = self.pause_token.lock().await;
            if token.is_cancelled() {
                *token = CancellationToken::new();
            }
        }
        self.phase.send_replace(Phase::Created);
    }

    fn finish(
        &self,
        state: &mut TransferState,
        result: Result<Outcome, DownloadError>,
    ) -> Result<Outcome, DownloadError> {
        if let Err(e) = &result {
            warn!(url = %self.config.url, error = %e, "transfer failed");
            self.enter(state, Phase::Failed);
        }
        result
    }

    fn enter(&self, state: &mut TransferState, phase: Phase) {
        state.advance(phase);
        self.phase.send_replace(phase);
        info!(?phase, "transfer phase");
    }

    async fn resolve_and_run(&self, state: &mut TransferState) -> Result<Outcome, DownloadError> {
        self.config.validate()?;
        if let Some(name) = self.config.configured_filename()? {
            ensure_absent(&self.config.root_path.join(name)).await?;
        }

        self.enter(state, Phase::ResolvingMetadata);
        let transfer = metadata::resolve(self.transport.as_ref(), &self.config).await?;
        self.run(&transfer, state).await
    }

    async fn run(&self, transfer: &Transfer, state: &mut TransferState) -> Result<Outcome, DownloadError> {
        ensure_absent(&transfer.output_path()).await?;
        fs::create_dir_all(&transfer.root_path).await?;
        let pause = self.pause_token.lock().await.clone();

        self.enter(state, Phase::Planning);
        if transfer.is_segmentable() {
            self.segmented(transfer, state, &pause).await
        } else {
            self.simple_copy(transfer, state, &pause).await
        }
    }

    async fn segmented(
        &self,
        transfer: &Transfer,
        state: &mut TransferState,
        pause: &CancellationToken,
    ) -> Result<Outcome, DownloadError> {
        let total = transfer.total_size.unwrap_or(0);
        let mut segments = plan_segments(total, transfer.concurrency)?;
        for segment in segments.iter_mut() {
            segment.downloaded = bytes_on_disk(&transfer.part_path(segment.index), segment).await?;
        }
        let resumed: u64 = segments.iter().map(|s| s.downloaded).sum();
        if resumed > 0 {
            info!(filename = %transfer.filename, resumed, total, "resuming from partial files");
        }
        state.segments = segments.clone();
        self.enter(state, Phase::SegmentedDownload);

        // Child of the pause token: firing it on failure does not read as a pause.
        let abort = pause.child_token();
        let counters: Vec<Counter> = segments.iter().map(|s| Counter::new(s.downloaded)).collect();
        let (responses, response_rxs): (Vec<_>, Vec<_>) =
            segments.iter().map(|_| watch::channel::<Option<ResponseMeta>>(None)).unzip();
        let reporter_stop = CancellationToken::new();
        let reporter = self.progress.clone().map(|tx| {
            let mut reporter = Reporter::new(
                tx,
                transfer.total_size,
                transfer.probe.clone(),
                self.config.progress_interval,
            );
            for ((segment, counter), response) in segments.iter().zip(&counters).zip(response_rxs) {
                reporter.track_segment(segment.index, segment.len(), counter.clone(), response);
            }
            reporter.spawn(reporter_stop.clone())
        });

        let (err_tx, mut err_rx) = mpsc::channel::<SegmentFailure>(segments.len().max(1));
        let policy = self.config.failure_policy;
        let handles: Vec<JoinHandle<()>> = segments
            .iter()
            .cloned()
            .zip(counters.iter().cloned())
            .zip(responses)
            .map(|((segment, counter), response)| {
                let worker = SegmentWorker::new(
                    self.transport.clone(),
                    transfer.origin_url.clone(),
                    transfer.part_path(segment.index),
                    transfer.copy_buffer_size,
                    abort.clone(),
                )
                .with_validator(transfer.validator.clone())
                .with_counter(counter)
                .with_response(response);
                let err_tx = err_tx.clone();
                let abort = abort.clone();
                tokio::spawn(async move {
                    if let Err(source) = worker.run(&segment).await {
                        warn!(segment = segment.index, error = %source, "segment failed");
                        if policy == FailurePolicy::CancelSiblings {
                            abort.cancel();
                        }
                        let _ = err_tx
                            .send(SegmentFailure {
                                index: segment.index,
                                source,
                            })
                            .await;
                    }
                })
            })
            .collect();
        drop(err_tx);

        let mut failures = Vec::new();
        for (index, joined) in join_all(handles).await.into_iter().enumerate() {
            if let Err(e) = joined {
                failures.push(SegmentFailure {
                    index,
                    source: TransferError::Aborted(e.to_string()),
                });
            }
        }
        while let Some(failure) = err_rx.recv().await {
            failures.push(failure);
        }

        reporter_stop.cancel();
        if let Some(handle) = reporter {
            let _ = handle.await;
        }
        for (segment, counter) in segments.iter_mut().zip(&counters) {
            segment.downloaded = counter.get();
        }
        state.segments = segments.clone();

        if !failures.is_empty() {
            return Err(DownloadError::Transfer(TransferFailures::new(failures)));
        }
        if pause.is_cancelled() {
            self.enter(state, Phase::Paused);
            info!(filename = %transfer.filename, downloaded = state.downloaded(), "transfer paused");
            return Ok(Outcome::Paused(PausedTransfer {
                transfer: transfer.clone(),
                segments,
            }));
        }

        self.enter(state, Phase::Merging);
        let output = transfer.output_path();
        let parts: Vec<PathBuf> = segments.iter().map(|s| transfer.part_path(s.index)).collect();
        let size = merger::merge(&output, &parts).await?;

        self.enter(state, Phase::Complete);
        Ok(Outcome::Completed(TransferResult {
            size,
            origin_url: transfer.origin_url.clone(),
            path: output,
            filename: transfer.filename.clone(),
        }))
    }

    /// Single streamed GET for servers without range support.
    ///
    /// There is nothing to resume from afterwards, so the output is removed
    /// if the copy fails or is paused.
    async fn simple_copy(
        &self,
        transfer: &Transfer,
        state: &mut TransferState,
        pause: &CancellationToken,
    ) -> Result<Outcome, DownloadError> {
        if self.resume_requested.load(Ordering::SeqCst) {
            return Err(DownloadError::UnsupportedOperation(format!(
                "{} cannot be resumed: the server does not serve byte ranges of known length",
                transfer.origin_url
            )));
        }
        self.enter(state, Phase::SimpleCopy);

        let output = transfer.output_path();
        let counter = Counter::new(0);
        let reporter_stop = CancellationToken::new();
        let reporter = self.progress.clone().map(|tx| {
            let mut reporter = Reporter::new(
                tx,
                transfer.total_size,
                transfer.probe.clone(),
                self.config.progress_interval,
            );
            reporter.track_whole(counter.clone());
            reporter.spawn(reporter_stop.clone())
        });

        let copied = worker::copy_whole(
            self.transport.as_ref(),
            &transfer.origin_url,
            &output,
            transfer.total_size,
            transfer.copy_buffer_size,
            pause,
            &counter,
        )
        .await;

        reporter_stop.cancel();
        if let Some(handle) = reporter {
            let _ = handle.await;
        }

        match copied {
            Ok(CopyEnd::Cancelled) => {
                discard(&output).await;
                self.enter(state, Phase::Paused);
                Ok(Outcome::Paused(PausedTransfer {
                    transfer: transfer.clone(),
                    segments: Vec::new(),
                }))
            }
            Ok(_) => {
                self.enter(state, Phase::Complete);
                let size = counter.get();
                info!(output = %output.display(), size, "simple copy finished");
                Ok(Outcome::Completed(TransferResult {
                    size,
                    origin_url: transfer.origin_url.clone(),
                    path: output,
                    filename: transfer.filename.clone(),
                }))
            }
            Err(source) => {
                discard(&output).await;
                Err(DownloadError::Transfer(TransferFailures::new(vec![SegmentFailure {
                    index: 0,
                    source,
                }])))
            }
        }
    }
}

async fn ensure_absent(path: &Path) -> Result<(), DownloadError> {
    if fs::try_exists(path).await? {
        return Err(DownloadError::AlreadyExists(path.to_path_buf()));
    }
    Ok(())
}

/// Size of an existing partial file, trimmed to the segment length.
async fn bytes_on_disk(path: &Path, segment: &Segment) -> std::io::Result<u64> {
    let len = match fs::metadata(path).await {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    if len > segment.len() {
        warn!(part = %path.display(), len, planned = segment.len(), "partial file larger than its segment, truncating");
        let file = OpenOptions::new().write(true).open(path).await?;
        file.set_len(segment.len()).await?;
        return Ok(segment.len());
    }
    Ok(len)
}

async fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "could not remove unfinished output");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(index: usize) -> SegmentFailure {
        SegmentFailure {
            index,
            source: TransferError::Status(500),
        }
    }

    #[test]
    fn failures_are_sorted_and_first_is_lowest_index() {
        let failures = TransferFailures::new(vec![failure(3), failure(1), failure(2)]);
        assert_eq!(failures.len(), 3);
        assert_eq!(failures.first().unwrap().index, 1);
        assert_eq!(
            failures.iter().map(|f| f.index).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn failures_display_mentions_the_rest() {
        let failures = TransferFailures::new(vec![failure(0), failure(4)]);
        assert_eq!(
            failures.to_string(),
            "segment 0: unexpected status code 500 (and 1 more failed segments)"
        );
        let single = TransferFailures::new(vec![failure(2)]);
        assert_eq!(single.to_string(), "segment 2: unexpected status code 500");
    }

    #[tokio::test]
    async fn oversized_partial_file_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.part0");
        std::fs::write(&path, vec![0u8; 50]).unwrap();

        let len = bytes_on_disk(&path, &Segment::new(0, 0, 29)).await.unwrap();

        assert_eq!(len, 30);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 30);
    }

    #[tokio::test]
    async fn missing_partial_file_counts_as_zero() {
        let dir = tempfile::tempdir().unwrap();
        let len = bytes_on_disk(&dir.path().join("nope"), &Segment::new(0, 0, 9))
            .await
            .unwrap();
        assert_eq!(len, 0);
    }

    #[tokio::test]
    async fn existing_output_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("done.bin");
        std::fs::write(&path, b"x").unwrap();
        assert!(matches!(
            ensure_absent(&path).await,
            Err(DownloadError::AlreadyExists(p)) if p == path
        ));
        assert!(ensure_absent(&dir.path().join("other.bin")).await.is_ok());
    }
}
