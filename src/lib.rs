pub mod config;
pub mod coordinator;
pub mod merger;
pub mod metadata;
pub mod models;
pub mod planner;
pub mod progress;
pub mod transport;
pub mod worker;

/// Convenient type alias exposing common structs.
pub mod prelude {
    pub use crate::config::{Config, FailurePolicy, RetryConfig};
    pub use crate::coordinator::{DownloadError, Downloader, SegmentFailure, TransferFailures};
    pub use crate::models::{Outcome, PausedTransfer, Phase, Segment, Transfer, TransferResult};
    pub use crate::progress::ProgressEvent;
    pub use crate::transport::{ReqwestTransport, Transport};
}
