// src/progress.rs

use crate::transport::ResponseMeta;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentProgress {
    pub index: usize,
    pub downloaded: u64,
    pub len: u64,
    /// Response to this segment's ranged request; `None` until it arrives,
    /// and for segments that were already complete on disk.
    pub response: Option<ResponseMeta>,
}

/// Snapshot of a running transfer.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub transferred: u64,
    /// `None` when the server did not announce a length.
    pub total: Option<u64>,
    /// Empty for a simple (unsegmented) copy.
    pub segments: Vec<SegmentProgress>,
    /// Response to the metadata probe.
    pub response: ResponseMeta,
    /// Set on the last event of a download attempt.
    pub finished: bool,
}

impl ProgressEvent {
    pub fn fraction(&self) -> Option<f64> {
        match self.total {
            Some(0) | None => None,
            Some(total) => Some(self.transferred as f64 / total as f64),
        }
    }
}

/// Byte counter owned by one worker. The reporter only reads it.
#[derive(Debug, Clone, Default)]
pub struct Counter(Arc<AtomicU64>);

impl Counter {
    pub fn new(initial: u64) -> Self {
        Self(Arc::new(AtomicU64::new(initial)))
    }

    pub fn add(&self, bytes: u64) {
        self.0.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

struct Tracked {
    index: usize,
    len: u64,
    counter: Counter,
    response: watch::Receiver<Option<ResponseMeta>>,
}

/// Samples counters on a timer and pushes events into a channel.
pub struct Reporter {
    tx: mpsc::Sender<ProgressEvent>,
    total: Option<u64>,
    response: ResponseMeta,
    interval: Duration,
    tracked: Vec<Tracked>,
    /// Used instead of per-segment counters for a simple copy.
    whole: Option<Counter>,
}

impl Reporter {
    pub fn new(
        tx: mpsc::Sender<ProgressEvent>,
        total: Option<u64>,
        response: ResponseMeta,
        interval: Duration,
    ) -> Self {
        Self {
            tx,
            total,
            response,
            interval,
            tracked: Vec::new(),
            whole: None,
        }
    }

    /// `response` is filled in by the segment's worker once its request is answered.
    pub fn track_segment(
        &mut self,
        index: usize,
        len: u64,
        counter: Counter,
        response: watch::Receiver<Option<ResponseMeta>>,
    ) {
        self.tracked.push(Tracked {
            index,
            len,
            counter,
            response,
        });
    }

    pub fn track_whole(&mut self, counter: Counter) {
        self.whole = Some(counter);
    }

    pub fn snapshot(&self, finished: bool) -> ProgressEvent {
        let segments: Vec<SegmentProgress> = self
            .tracked
            .iter()
            .map(|t| SegmentProgress {
                index: t.index,
                downloaded: t.counter.get(),
                len: t.len,
                response: t.response.borrow().clone(),
            })
            .collect();
        let transferred = match &self.whole {
            Some(counter) => counter.get(),
            None => segments.iter().map(|s| s.downloaded).sum(),
        };
        ProgressEvent {
            transferred,
            total: self.total,
            segments,
            response: self.response.clone(),
            finished,
        }
    }

    /// Runs until `stop` fires, then offers one last event marked `finished`.
    ///
    /// Every event, the last one included, is dropped when the channel is
    /// full, so a lagging consumer never holds up the workers or the
    /// coordinator waiting on this task.
    pub fn spawn(self, stop: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(mpsc::error::TrySendError::Closed(_)) = self.tx.try_send(self.snapshot(false)) {
                            return;
                        }
                    }
                }
            }
            if self.tx.try_send(self.snapshot(true)).is_err() {
                debug!("progress channel full or closed, final event dropped");
            }
        })
    }
}
