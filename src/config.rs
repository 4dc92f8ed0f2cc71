// src/config.rs

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("source url is empty")]
    MissingUrl,
    #[error("invalid url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("unsupported url scheme: {0}")]
    UnsupportedScheme(String),
    #[error("concurrency must be at least 1, got {0}")]
    InvalidConcurrency(usize),
    #[error("filename {0:?} must be a single path component")]
    InvalidFilename(String),
    #[error("copy buffer size must be at least 1 byte")]
    InvalidBufferSize,
    #[error("retry wait range is inverted: min {min:?} > max {max:?}")]
    InvalidRetryWindow { min: Duration, max: Duration },
    #[error("could not read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// What the coordinator does with the remaining workers once one fails.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Let every other segment run to completion.
    #[default]
    Continue,
    /// Cancel the remaining segments as soon as one fails.
    CancelSiblings,
}

/// Backoff settings for the transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub wait_min: Duration,
    pub wait_max: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            wait_min: Duration::from_secs(1),
            wait_max: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (0-based): `wait_min * 2^attempt`, capped at `wait_max`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt);
        self.wait_min.saturating_mul(factor).min(self.wait_max)
    }
}

/// Options for a single transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub url: String,
    /// Directory receiving the final file and its `.partN` files.
    pub root_path: PathBuf,
    /// Overrides the filename detected from the resolved url.
    pub filename: Option<String>,
    /// Number of segments downloaded in parallel.
    pub concurrency: usize,
    pub copy_buffer_size: usize,
    /// Extra headers sent with every request.
    pub headers: BTreeMap<String, String>,
    pub retry: RetryConfig,
    pub connect_timeout: Duration,
    pub failure_policy: FailurePolicy,
    pub progress_interval: Duration,
    pub show_progress: bool,
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            url: String::new(),
            root_path: PathBuf::from("downloads"),
            filename: None,
            concurrency: default_concurrency(),
            copy_buffer_size: 1024,
            headers: BTreeMap::new(),
            retry: RetryConfig::default(),
            connect_timeout: Duration::from_secs(30),
            failure_policy: FailurePolicy::Continue,
            progress_interval: Duration::from_secs(1),
            show_progress: true,
            debug: false,
        }
    }
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl Config {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Loads a config from a JSON file; absent fields keep their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&json).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Nests the download directory one level deeper.
    pub fn with_base_folder(mut self, folder: &str) -> Self {
        self.root_path = self.root_path.join(folder);
        self
    }

    /// Checks everything that can be checked without touching the network.
    pub fn validate(&self) -> Result<url::Url, ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::InvalidConcurrency(self.concurrency));
        }
        if self.copy_buffer_size == 0 {
            return Err(ConfigError::InvalidBufferSize);
        }
        if self.retry.wait_min > self.retry.wait_max {
            return Err(ConfigError::InvalidRetryWindow {
                min: self.retry.wait_min,
                max: self.retry.wait_max,
            });
        }
        self.configured_filename()?;
        parse_url(&self.url)
    }

    /// The trimmed `filename` override, or `None` when detection is wanted.
    ///
    /// Anything but one plain path component (absolute paths, `..`, nested
    /// directories) would place the output outside `root_path`.
    pub fn configured_filename(&self) -> Result<Option<&str>, ConfigError> {
        let Some(name) = self.filename.as_deref().map(str::trim).filter(|n| !n.is_empty()) else {
            return Ok(None);
        };
        let mut components = Path::new(name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) if !name.contains(|c: char| c == '/' || c == '\\') => Ok(Some(name)),
            _ => Err(ConfigError::InvalidFilename(name.to_string())),
        }
    }
}

pub(crate) fn parse_url(raw: &str) -> Result<url::Url, ConfigError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ConfigError::MissingUrl);
    }
    let url = url::Url::parse(raw).map_err(|source| ConfigError::InvalidUrl {
        url: raw.to_string(),
        source,
    })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ConfigError::UnsupportedScheme(other.to_string())),
    }
}
