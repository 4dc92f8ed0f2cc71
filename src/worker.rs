// src/worker.rs

use crate::models::Segment;
use crate::progress::Counter;
use crate::transport::{ByteStream, Request, ResponseMeta, Transport, TransportError};
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Errors that end a single segment (or a simple copy).
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected status code {0}")]
    Status(u16),
    #[error("server ignored range request starting at byte {offset} (status {status})")]
    RangeNotHonored { offset: u64, status: u16 },
    #[error("body ended after {received} of {expected} bytes")]
    Incomplete { expected: u64, received: u64 },
    #[error("worker aborted: {0}")]
    Aborted(String),
}

/// How a body copy stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyEnd {
    /// The byte limit was reached.
    Limit,
    /// The body ran out.
    Eof,
    Cancelled,
}

/// Copies `body` into `file` in pieces of at most `buffer_size` bytes.
///
/// Cancellation is checked before every piece and while waiting on the
/// network. Nothing past `limit` is ever written.
pub async fn copy_body(
    body: &mut ByteStream,
    file: &mut File,
    limit: Option<u64>,
    buffer_size: usize,
    cancel: &CancellationToken,
    counter: &Counter,
) -> Result<(u64, CopyEnd), TransferError> {
    let buffer_size = buffer_size.max(1);
    let mut written = 0u64;

    let end = 'copy: loop {
        if limit.is_some_and(|limit| written >= limit) {
            break CopyEnd::Limit;
        }
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => break 'copy CopyEnd::Cancelled,
            chunk = body.next() => chunk,
        };
        let Some(chunk) = chunk else {
            break CopyEnd::Eof;
        };
        let chunk = chunk?;

        for piece in chunk.chunks(buffer_size) {
            if cancel.is_cancelled() {
                break 'copy CopyEnd::Cancelled;
            }
            let piece = match limit {
                Some(limit) => &piece[..piece.len().min((limit - written) as usize)],
                None => piece,
            };
            file.write_all(piece).await?;
            written += piece.len() as u64;
            counter.add(piece.len() as u64);
            if limit.is_some_and(|limit| written >= limit) {
                break;
            }
        }
    };

    file.flush().await?;
    Ok((written, end))
}

/// Downloads one segment into its partial file.
pub struct SegmentWorker {
    transport: Arc<dyn Transport>,
    url: String,
    validator: Option<String>,
    path: PathBuf,
    copy_buffer_size: usize,
    cancel: CancellationToken,
    counter: Counter,
    response: Option<watch::Sender<Option<ResponseMeta>>>,
}

impl SegmentWorker {
    pub fn new(
        transport: Arc<dyn Transport>,
        url: String,
        path: PathBuf,
        copy_buffer_size: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            url,
            validator: None,
            path,
            copy_buffer_size,
            cancel,
            counter: Counter::default(),
            response: None,
        }
    }

    pub fn with_validator(mut self, validator: Option<String>) -> Self {
        self.validator = validator;
        self
    }

    /// Counter bumped after every write. It is expected to already hold
    /// the segment's on-disk byte count.
    pub fn with_counter(mut self, counter: Counter) -> Self {
        self.counter = counter;
        self
    }

    /// Publishes the response to the ranged request once it arrives.
    pub fn with_response(mut self, tx: watch::Sender<Option<ResponseMeta>>) -> Self {
        self.response = Some(tx);
        self
    }

    /// Fetches the part of `segment` that is not on disk yet.
    ///
    /// Returns `Ok(())` both when the range is complete and when the
    /// cancellation token fired; the caller tells the two apart.
    pub async fn run(&self, segment: &Segment) -> Result<(), TransferError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;

        if segment.is_complete() {
            debug!(segment = segment.index, "nothing left to fetch");
            return Ok(());
        }

        let offset = segment.next_offset();
        let request = Request::get(&self.url)
            .with_range(offset, segment.end)
            .with_if_range(self.validator.clone());

        debug!(segment = segment.index, start = offset, end = segment.end, "requesting range");
        let response = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(()),
            response = self.transport.send(request) => response?,
        };

        match response.meta.status {
            206 => {}
            200 if offset == 0 => {}
            200 => {
                return Err(TransferError::RangeNotHonored {
                    offset,
                    status: response.meta.status,
                })
            }
            status => return Err(TransferError::Status(status)),
        }
        if let Some(tx) = &self.response {
            tx.send_replace(Some(response.meta.clone()));
        }

        let expected = segment.remaining();
        let mut body = response.body;
        let (written, end) = copy_body(
            &mut body,
            &mut file,
            Some(expected),
            self.copy_buffer_size,
            &self.cancel,
            &self.counter,
        )
        .await?;

        debug!(segment = segment.index, written, ?end, "segment worker done");
        match end {
            CopyEnd::Eof => Err(TransferError::Incomplete {
                expected,
                received: written,
            }),
            CopyEnd::Limit | CopyEnd::Cancelled => Ok(()),
        }
    }
}

/// Streams the whole resource into `path` without ranges.
///
/// Returns how the copy ended; a known `expected` length turns an early end
/// of body into [`TransferError::Incomplete`].
pub async fn copy_whole(
    transport: &dyn Transport,
    url: &str,
    path: &Path,
    expected: Option<u64>,
    buffer_size: usize,
    cancel: &CancellationToken,
    counter: &Counter,
) -> Result<CopyEnd, TransferError> {
    let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Ok(CopyEnd::Cancelled),
        response = transport.send(Request::get(url)) => response?,
    };
    if !response.meta.is_success() {
        return Err(TransferError::Status(response.meta.status));
    }

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .await?;
    let mut body = response.body;
    let (written, end) = copy_body(&mut body, &mut file, None, buffer_size, cancel, counter).await?;

    match (end, expected) {
        (CopyEnd::Eof, Some(expected)) if written < expected => Err(TransferError::Incomplete {
            expected,
            received: written,
        }),
        _ => Ok(end),
    }
}
