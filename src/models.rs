// src/models.rs

use crate::transport::ResponseMeta;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Immutable description of one download, produced by the metadata resolver.
#[derive(Debug, Clone, Serialize)]
pub struct Transfer {
    pub source_url: String,
    /// Url after redirects.
    pub origin_url: String,
    /// `None` when the server did not send a content length.
    pub total_size: Option<u64>,
    pub resumable: bool,
    pub root_path: PathBuf,
    pub filename: String,
    pub concurrency: usize,
    pub copy_buffer_size: usize,
    /// The probe response, forwarded with progress events.
    pub probe: ResponseMeta,
    /// ETag or Last-Modified, sent as `If-Range` on ranged requests.
    pub validator: Option<String>,
}

impl Transfer {
    pub fn output_path(&self) -> PathBuf {
        self.root_path.join(&self.filename)
    }

    /// e.g. for "downloads/file.zip" and index 2 this is "downloads/file.zip.part2".
    pub fn part_path(&self, index: usize) -> PathBuf {
        self.root_path.join(format!("{}.part{}", self.filename, index))
    }

    /// Whether the coordinator may split this transfer into ranges.
    pub fn is_segmentable(&self) -> bool {
        self.resumable && matches!(self.total_size, Some(size) if size > 0)
    }
}

/// One contiguous, inclusive byte range of a transfer.
///
/// Empty segments (more segments than bytes) have `start > end`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub index: usize,
    pub start: u64,
    pub end: u64,
    /// Bytes already present in the partial file.
    pub downloaded: u64,
}

impl Segment {
    pub fn new(index: usize, start: u64, end: u64) -> Self {
        Self {
            index,
            start,
            end,
            downloaded: 0,
        }
    }

    /// An empty segment that sits at `offset` without covering any byte.
    pub fn empty(index: usize, offset: u64) -> Self {
        Self::new(index, offset + 1, offset)
    }

    pub fn len(&self) -> u64 {
        if self.start > self.end {
            0
        } else {
            self.end - self.start + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn remaining(&self) -> u64 {
        self.len().saturating_sub(self.downloaded)
    }

    pub fn is_complete(&self) -> bool {
        self.remaining() == 0
    }

    /// First byte still missing.
    pub fn next_offset(&self) -> u64 {
        self.start + self.downloaded
    }
}

/// Returned once a transfer has produced its final file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferResult {
    pub size: u64,
    pub origin_url: String,
    pub path: PathBuf,
    pub filename: String,
}

/// State of a paused transfer. Its partial files are still on disk.
#[derive(Debug, Clone)]
pub struct PausedTransfer {
    pub transfer: Transfer,
    pub segments: Vec<Segment>,
}

impl PausedTransfer {
    pub fn downloaded(&self) -> u64 {
        self.segments.iter().map(|s| s.downloaded).sum()
    }
}

#[derive(Debug, Clone)]
pub enum Outcome {
    Completed(TransferResult),
    Paused(PausedTransfer),
}

impl Outcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed(_))
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, Outcome::Paused(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Created,
    ResolvingMetadata,
    Planning,
    SimpleCopy,
    SegmentedDownload,
    Merging,
    Complete,
    Paused,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Complete | Phase::Paused | Phase::Failed)
    }

    pub fn can_advance_to(self, next: Phase) -> bool {
        use Phase::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Created, ResolvingMetadata) | (Created, Planning) => true,
            (ResolvingMetadata, Planning) => true,
            (Planning, SimpleCopy) | (Planning, SegmentedDownload) => true,
            (SimpleCopy, Complete) | (SimpleCopy, Paused) => true,
            (SegmentedDownload, Merging) | (SegmentedDownload, Paused) => true,
            (Merging, Complete) => true,
            _ => false,
        }
    }
}

/// Mutable side of a transfer, moved through the coordinator's transitions.
#[derive(Debug, Clone)]
pub struct TransferState {
    phase: Phase,
    history: Vec<Phase>,
    pub segments: Vec<Segment>,
}

impl Default for TransferState {
    fn default() -> Self {
        Self {
            phase: Phase::Created,
            history: vec![Phase::Created],
            segments: Vec::new(),
        }
    }
}

impl TransferState {
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Every phase visited so far, in order.
    pub fn history(&self) -> &[Phase] {
        &self.history
    }

    pub fn advance(&mut self, next: Phase) {
        debug_assert!(
            self.phase.can_advance_to(next),
            "illegal transition {:?} -> {:?}",
            self.phase,
            next
        );
        self.phase = next;
        self.history.push(next);
    }

    pub fn downloaded(&self) -> u64 {
        self.segments.iter().map(|s| s.downloaded).sum()
    }
}
