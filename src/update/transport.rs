//! Network transport used by the manifest client, downloader and health probes.
//!
//! All network I/O goes through the object-safe [`Transport`] trait so the
//! engine can run against the real [`HttpTransport`] or an in-memory backend
//! in tests.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use std::time::Duration;
use tracing::debug;

use crate::core::UpdateError;

/// Streaming response body for an artifact request.
pub struct ByteStream {
    /// The server honoured the range request and `body` starts at the
    /// requested offset. When `false` the body starts at byte 0.
    pub partial: bool,
    /// Full length of the resource, when the server reported it.
    pub total: Option<u64>,
    pub body: BoxStream<'static, Result<Bytes, UpdateError>>,
}

impl std::fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteStream")
            .field("partial", &self.partial)
            .field("total", &self.total)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch a small resource in full. 404 maps to [`UpdateError::NotFound`].
    async fn fetch(&self, url: &str) -> Result<Bytes, UpdateError>;

    /// Open `url` for streaming, asking for bytes from `offset` onwards.
    async fn open(&self, url: &str, offset: u64) -> Result<ByteStream, UpdateError>;

    /// Lightweight reachability check.
    async fn probe(&self, url: &str, timeout: Duration) -> bool;
}

/// `reqwest`-backed transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

/// Longest silence tolerated between two reads of a response body.
const READ_TIMEOUT: Duration = Duration::from_secs(30);

impl HttpTransport {
    /// Create a transport with connect and read timeouts for update traffic.
    ///
    /// A body that stalls for longer than the read timeout fails with a
    /// network error, which moves the download on to the next source.
    pub fn new() -> Result<Self, UpdateError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("pfupdate/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .read_timeout(READ_TIMEOUT)
            .build()
            .map_err(|e| UpdateError::network("<client>", e))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, url: &str) -> Result<Bytes, UpdateError> {
        debug!("GET {}", url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| UpdateError::network(url, e))?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(UpdateError::NotFound { url: url.to_string() }),
            status if status.is_success() => {
                response.bytes().await.map_err(|e| UpdateError::network(url, e))
            }
            status => Err(UpdateError::network(url, format!("HTTP {status}"))),
        }
    }

    async fn open(&self, url: &str, offset: u64) -> Result<ByteStream, UpdateError> {
        let mut request = self.client.get(url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }

        let response = request.send().await.map_err(|e| UpdateError::network(url, e))?;
        let status = response.status();

        let (partial, total) = match status {
            StatusCode::PARTIAL_CONTENT if offset > 0 => {
                let total = response
                    .headers()
                    .get(CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_content_range_total);
                (true, total)
            }
            StatusCode::NOT_FOUND => {
                return Err(UpdateError::NotFound { url: url.to_string() });
            }
            status if status.is_success() => {
                let total = response
                    .headers()
                    .get(CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok());
                (false, total)
            }
            status => return Err(UpdateError::network(url, format!("HTTP {status}"))),
        };
        debug!(url, offset, partial, ?total, "Opened artifact stream");

        let owned_url = url.to_string();
        let body = response
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| UpdateError::network(&owned_url, e)))
            .boxed();

        Ok(ByteStream { partial, total, body })
    }

    async fn probe(&self, url: &str, timeout: Duration) -> bool {
        match self.client.head(url).timeout(timeout).send().await {
            Ok(response) => {
                let healthy = !response.status().is_server_error();
                debug!(url, status = %response.status(), healthy, "Health probe");
                healthy
            }
            Err(e) => {
                debug!(url, "Health probe failed: {}", e);
                false
            }
        }
    }
}

/// Total length from a `Content-Range: bytes 600-999/1000` header.
fn parse_content_range_total(value: &str) -> Option<u64> {
    value.rsplit_once('/').and_then(|(_, total)| total.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_content_range_total() {
        assert_eq!(parse_content_range_total("bytes 600-999/1000"), Some(1000));
        assert_eq!(parse_content_range_total("bytes 0-9/*"), None);
        assert_eq!(parse_content_range_total("garbage"), None);
    }
}
