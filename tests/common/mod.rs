#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use partfetch::transport::{Method, Request, Response, ResponseMeta, Transport, TransportError};
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

/// In-memory origin server.
pub struct MemoryTransport {
    pub data: Vec<u8>,
    pub accept_ranges: bool,
    pub send_length: bool,
    pub final_url: Option<String>,
    pub etag: Option<String>,
    pub chunk_size: usize,
    /// Serve at most this many bytes per request, then hang until dropped.
    pub stall_after: Mutex<Option<usize>>,
    /// Serve at most this many bytes per request, then end the body early.
    pub truncate_after: Mutex<Option<usize>>,
    /// GETs whose range starts at one of these offsets get a 500.
    pub fail_offsets: Mutex<HashSet<u64>>,
    pub requests: Mutex<Vec<Request>>,
}

impl MemoryTransport {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            accept_ranges: true,
            send_length: true,
            final_url: None,
            etag: Some("\"v1\"".to_string()),
            chunk_size: 64 * 1024,
            stall_after: Mutex::new(None),
            truncate_after: Mutex::new(None),
            fail_offsets: Mutex::new(HashSet::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn without_ranges(mut self) -> Self {
        self.accept_ranges = false;
        self
    }

    pub fn without_length(mut self) -> Self {
        self.send_length = false;
        self
    }

    pub fn redirected_to(mut self, url: &str) -> Self {
        self.final_url = Some(url.to_string());
        self
    }

    pub fn stall_after(&self, bytes: Option<usize>) {
        *self.stall_after.lock().unwrap() = bytes;
    }

    pub fn truncate_after(&self, bytes: Option<usize>) {
        *self.truncate_after.lock().unwrap() = bytes;
    }

    pub fn fail_at(&self, offset: u64) {
        self.fail_offsets.lock().unwrap().insert(offset);
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    pub fn ranged_gets(&self) -> Vec<(u64, u64)> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == Method::Get)
            .filter_map(|r| r.range)
            .collect()
    }

    pub fn clear_requests(&self) {
        self.requests.lock().unwrap().clear();
    }

    fn meta(&self, status: u16, url: &str, length: u64) -> ResponseMeta {
        ResponseMeta {
            status,
            url: self.final_url.clone().unwrap_or_else(|| url.to_string()),
            content_length: self.send_length.then_some(length),
            accept_ranges: self.accept_ranges.then(|| "bytes".to_string()),
            etag: self.etag.clone(),
            last_modified: None,
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, request: Request) -> Result<Response, TransportError> {
        self.requests.lock().unwrap().push(request.clone());

        if request.method == Method::Head {
            return Ok(Response::empty(self.meta(200, &request.url, self.data.len() as u64)));
        }

        let (status, body) = match request.range {
            Some((start, _)) if self.fail_offsets.lock().unwrap().contains(&start) => {
                return Ok(Response::empty(self.meta(500, &request.url, 0)));
            }
            Some((start, end)) if self.accept_ranges => {
                let end = end.min(self.data.len() as u64 - 1);
                (206, self.data[start as usize..=end as usize].to_vec())
            }
            _ => (200, self.data.clone()),
        };
        let meta = self.meta(status, &request.url, body.len() as u64);

        let stall = *self.stall_after.lock().unwrap();
        let truncate = *self.truncate_after.lock().unwrap();
        let served = match stall.or(truncate) {
            Some(limit) => body[..limit.min(body.len())].to_vec(),
            None => body,
        };
        let pieces: Vec<Result<Bytes, TransportError>> = served
            .chunks(self.chunk_size.max(1))
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        let stream = futures_util::stream::iter(pieces);
        let body = match stall {
            Some(_) => stream.chain(futures_util::stream::pending()).boxed(),
            None => stream.boxed(),
        };
        Ok(Response { meta, body })
    }
}

pub fn sample(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + i / 251) % 256) as u8).collect()
}

/// Polls `condition` every few milliseconds for up to five seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
