// src/transport.rs

use crate::config::{Config, RetryConfig};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::pin::Pin;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid header {name}: {reason}")]
    InvalidHeader { name: String, reason: String },
    #[error("giving up after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },
}

/// Response body as a stream of byte chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Head,
    Get,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub url: String,
    /// Inclusive byte range sent as `Range: bytes=start-end`.
    pub range: Option<(u64, u64)>,
    /// Validator sent as `If-Range`.
    pub if_range: Option<String>,
}

impl Request {
    pub fn head(url: &str) -> Self {
        Self {
            method: Method::Head,
            url: url.to_string(),
            range: None,
            if_range: None,
        }
    }

    pub fn get(url: &str) -> Self {
        Self {
            method: Method::Get,
            ..Self::head(url)
        }
    }

    pub fn with_range(mut self, start: u64, end: u64) -> Self {
        self.range = Some((start, end));
        self
    }

    pub fn with_if_range(mut self, validator: Option<String>) -> Self {
        self.if_range = validator;
        self
    }
}

/// Headers and status of a response, detached from its body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResponseMeta {
    pub status: u16,
    /// Final url after redirects.
    pub url: String,
    pub content_length: Option<u64>,
    pub accept_ranges: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl ResponseMeta {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub struct Response {
    pub meta: ResponseMeta,
    pub body: ByteStream,
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}

impl Response {
    /// A response without a body, as returned for HEAD.
    pub fn empty(meta: ResponseMeta) -> Self {
        Self {
            meta,
            body: Box::pin(futures_util::stream::empty()),
        }
    }
}

/// The HTTP seam used by the resolver and the workers.
///
/// Implementations retry transient failures themselves; anything they
/// return is final as far as the engine is concerned.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: Request) -> Result<Response, TransportError>;
}

/// `reqwest`-backed transport with bounded exponential backoff.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
    retry: RetryConfig,
}

impl ReqwestTransport {
    pub fn new(config: &Config) -> Result<Self, TransportError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let header_name =
                HeaderName::from_bytes(name.as_bytes()).map_err(|e| TransportError::InvalidHeader {
                    name: name.clone(),
                    reason: e.to_string(),
                })?;
            let header_value =
                HeaderValue::from_str(value).map_err(|e| TransportError::InvalidHeader {
                    name: name.clone(),
                    reason: e.to_string(),
                })?;
            headers.insert(header_name, header_value);
        }

        let client = Client::builder()
            .user_agent(concat!("partfetch/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .connect_timeout(config.connect_timeout)
            .build()?;

        Ok(Self::with_client(client, config.retry.clone()))
    }

    /// Wraps an already configured client.
    pub fn with_client(client: Client, retry: RetryConfig) -> Self {
        Self { client, retry }
    }

    fn build(&self, request: &Request) -> reqwest::RequestBuilder {
        let mut builder = match request.method {
            Method::Head => self.client.head(&request.url),
            Method::Get => self.client.get(&request.url),
        };
        if let Some((start, end)) = request.range {
            builder = builder.header(header::RANGE, format!("bytes={}-{}", start, end));
        }
        if let Some(validator) = &request.if_range {
            builder = builder.header(header::IF_RANGE, validator.as_str());
        }
        builder
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: Request) -> Result<Response, TransportError> {
        let mut attempt = 0;
        loop {
            let can_retry = attempt < self.retry.max_retries;
            match self.build(&request).send().await {
                Ok(response) if can_retry && is_retryable_status(response.status()) => {
                    debug!(url = %request.url, status = %response.status(), attempt, "retrying after status");
                }
                Ok(response) => {
                    let meta = response_meta(&response);
                    let body = response
                        .bytes_stream()
                        .map(|chunk| chunk.map_err(TransportError::Request));
                    return Ok(Response {
                        meta,
                        body: Box::pin(body),
                    });
                }
                Err(e) if can_retry && is_transient(&e) => {
                    debug!(url = %request.url, error = %e, attempt, "retrying after error");
                }
                Err(e) if attempt > 0 => {
                    return Err(TransportError::Exhausted {
                        attempts: attempt + 1,
                        source: e,
                    });
                }
                Err(e) => return Err(e.into()),
            }
            tokio::time::sleep(self.retry.backoff(attempt)).await;
            attempt += 1;
        }
    }
}

fn is_transient(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect()
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || (status.is_server_error() && status != StatusCode::NOT_IMPLEMENTED)
}

fn response_meta(response: &reqwest::Response) -> ResponseMeta {
    let headers = response.headers();
    let text = |name: header::HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    };
    ResponseMeta {
        status: response.status().as_u16(),
        url: response.url().to_string(),
        content_length: text(header::CONTENT_LENGTH).and_then(|s| s.parse().ok()),
        accept_ranges: text(header::ACCEPT_RANGES),
        etag: text(header::ETAG),
        last_modified: text(header::LAST_MODIFIED),
    }
}
