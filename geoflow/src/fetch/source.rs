//! Byte-range capable artifact sources.

use super::FetchError;
use async_trait::async_trait;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::StatusCode;
use std::time::Duration;
use tracing::debug;

/// A stream of body chunks.
#[async_trait]
pub trait ByteStream: Send {
    /// Returns the next chunk, or `None` at end of body.
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, FetchError>;
}

/// An opened transfer.
pub struct SourceResponse {
    /// Offset of the first body byte. Either the requested offset (resumed)
    /// or zero (the source restarted from the beginning).
    pub start: u64,
    /// Total length of the remote object, if advertised.
    pub total_len: Option<u64>,
    /// The body.
    pub body: Box<dyn ByteStream>,
}

impl std::fmt::Debug for SourceResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceResponse")
            .field("start", &self.start)
            .field("total_len", &self.total_len)
            .finish_non_exhaustive()
    }
}

/// Where artifact bytes come from.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// Opens `url`, asking for the bytes from `offset` onwards.
    async fn open(&self, url: &str, offset: u64) -> Result<SourceResponse, FetchError>;

    /// Reads a small text resource, such as a checksum file.
    async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        let mut response = self.open(url, 0).await?;
        let mut bytes = Vec::new();
        while let Some(chunk) = response.body.next_chunk().await? {
            bytes.extend_from_slice(&chunk);
        }
        String::from_utf8(bytes).map_err(|e| FetchError::Checksum {
            url: url.to_string(),
            message: e.to_string(),
        })
    }
}

/// HTTP(S) source backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpSource {
    client: reqwest::Client,
}

impl HttpSource {
    /// Creates a source with the given connect timeout.
    ///
    /// There is no overall request timeout: large extracts take hours. Stalls
    /// are detected per chunk by the fetcher.
    pub fn new(connect_timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(concat!("geoflow/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Transient {
                url: String::new(),
                message: format!("failed to create HTTP client: {e}"),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ArtifactSource for HttpSource {
    async fn open(&self, url: &str, offset: u64) -> Result<SourceResponse, FetchError> {
        let mut request = self.client.get(url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }

        let response = request.send().await.map_err(|e| transient(url, &e))?;
        let status = response.status();
        debug!(url, offset, status = status.as_u16(), "opened transfer");

        match status {
            StatusCode::PARTIAL_CONTENT => {
                let range = response
                    .headers()
                    .get(CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_content_range)
                    .ok_or_else(|| FetchError::Transient {
                        url: url.to_string(),
                        message: "206 response without a valid Content-Range".to_string(),
                    })?;
                Ok(SourceResponse {
                    start: range.0,
                    total_len: range.1,
                    body: Box::new(ReqwestBody { url: url.to_string(), response }),
                })
            }
            StatusCode::RANGE_NOT_SATISFIABLE if offset > 0 => {
                let total = response
                    .headers()
                    .get(CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_unsatisfied_range);
                if total == Some(offset) {
                    debug!(url, offset, "partial download already complete");
                    return Ok(SourceResponse {
                        start: offset,
                        total_len: total,
                        body: Box::new(EmptyBody),
                    });
                }
                debug!(url, offset, ?total, "range not satisfiable; restarting from zero");
                self.open(url, 0).await
            }
            s if s.is_success() => Ok(SourceResponse {
                start: 0,
                total_len: response.content_length(),
                body: Box::new(ReqwestBody { url: url.to_string(), response }),
            }),
            s => Err(FetchError::Http {
                url: url.to_string(),
                status: s.as_u16(),
            }),
        }
    }
}

struct ReqwestBody {
    url: String,
    response: reqwest::Response,
}

#[async_trait]
impl ByteStream for ReqwestBody {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, FetchError> {
        match self.response.chunk().await {
            Ok(chunk) => Ok(chunk.map(|bytes| bytes.to_vec())),
            Err(e) => Err(transient(&self.url, &e)),
        }
    }
}

struct EmptyBody;

#[async_trait]
impl ByteStream for EmptyBody {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, FetchError> {
        Ok(None)
    }
}

fn transient(url: &str, err: &reqwest::Error) -> FetchError {
    FetchError::Transient {
        url: url.to_string(),
        message: err.to_string(),
    }
}

/// Parses `bytes <start>-<end>/<total>` into the start offset and total
/// length (`None` when the total is `*`).
#[must_use]
pub fn parse_content_range(value: &str) -> Option<(u64, Option<u64>)> {
    let rest = value.trim().strip_prefix("bytes ")?;
    let (range, total) = rest.split_once('/')?;
    let (start, _end) = range.split_once('-')?;
    let start = start.trim().parse().ok()?;
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    Some((start, total))
}

/// Parses the `bytes */<total>` form sent with a 416.
#[must_use]
pub fn parse_unsatisfied_range(value: &str) -> Option<u64> {
    value.trim().strip_prefix("bytes */")?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{HttpTestServer, TestResponse};

    #[test]
    fn test_parse_content_range() {
        assert_eq!(parse_content_range("bytes 100-999/1000"), Some((100, Some(1000))));
        assert_eq!(parse_content_range("bytes 0-9/*"), Some((0, None)));
        assert_eq!(parse_content_range("items 0-9/10"), None);
        assert_eq!(parse_content_range("bytes x-9/10"), None);
        assert_eq!(parse_unsatisfied_range("bytes */50000"), Some(50_000));
        assert_eq!(parse_unsatisfied_range("bytes 0-9/10"), None);
    }

    #[tokio::test]
    async fn test_http_source_resumes_with_range() {
        let body: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        let server = HttpTestServer::start(TestResponse::file(body.clone())).await.unwrap();
        let source = HttpSource::new(Duration::from_secs(5)).unwrap();

        let mut response = source.open(&server.url("/raw.pbf"), 4_000).await.unwrap();
        assert_eq!(response.start, 4_000);
        assert_eq!(response.total_len, Some(10_000));

        let mut received = Vec::new();
        while let Some(chunk) = response.body.next_chunk().await.unwrap() {
            received.extend_from_slice(&chunk);
        }
        assert_eq!(received, body[4_000..]);
        assert_eq!(server.requests()[0].range.as_deref(), Some("bytes=4000-"));
    }

    #[tokio::test]
    async fn test_http_source_ignoring_range_restarts() {
        let server = HttpTestServer::start(TestResponse::file(b"hello".to_vec()).without_ranges()).await.unwrap();
        let source = HttpSource::new(Duration::from_secs(5)).unwrap();

        let response = source.open(&server.url("/f"), 3).await.unwrap();
        assert_eq!(response.start, 0);
        assert_eq!(response.total_len, Some(5));
    }

    #[tokio::test]
    async fn test_http_source_416_restarts_from_zero() {
        let server = HttpTestServer::start(TestResponse::file(b"hello".to_vec())).await.unwrap();
        let source = HttpSource::new(Duration::from_secs(5)).unwrap();

        let response = source.open(&server.url("/f"), 50).await.unwrap();
        assert_eq!(response.start, 0);
        let requests = server.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[1].range.is_none());
    }

    #[tokio::test]
    async fn test_http_source_complete_part_is_not_downloaded_again() {
        let body = vec![7u8; 50_000];
        let server = HttpTestServer::start(TestResponse::file(body)).await.unwrap();
        let source = HttpSource::new(Duration::from_secs(5)).unwrap();

        let mut response = source.open(&server.url("/planet.pbf"), 50_000).await.unwrap();
        assert_eq!(response.start, 50_000);
        assert_eq!(response.total_len, Some(50_000));
        assert!(response.body.next_chunk().await.unwrap().is_none());
        assert_eq!(server.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_http_source_status_errors() {
        let server = HttpTestServer::start(TestResponse::status(503)).await.unwrap();
        let source = HttpSource::new(Duration::from_secs(5)).unwrap();
        let err = source.open(&server.url("/f"), 0).await.unwrap_err();
        assert!(matches!(err, FetchError::Http { status: 503, .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_fetch_text() {
        let server = HttpTestServer::start(TestResponse::file(
            b"900150983cd24fb0d6963f7d28e17f72  monaco.osm.pbf\n".to_vec(),
        ))
        .await
        .unwrap();
        let source = HttpSource::new(Duration::from_secs(5)).unwrap();
        let text = source.fetch_text(&server.url("/f.md5")).await.unwrap();
        assert!(text.starts_with("900150983cd24fb0"));
    }
}
