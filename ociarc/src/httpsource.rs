use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use log::{debug, trace, warn};
use reqwest::{
    Response, StatusCode,
    header::{self, HeaderMap},
};

use crate::digest::sha256_hex;
use crate::error::Error;

/// Random-access reads over some remote byte store. Implementations are
/// immutable after construction and safe to share across tasks.
///
/// Offsets and lengths are unsigned, so the negative-input failure mode is
/// unrepresentable by construction.
#[async_trait]
pub trait ByteSource: Send + Sync {
    /// Total size in bytes, fixed at construction.
    fn size(&self) -> u64;

    /// Stable fingerprint for this content, usable as a cache key
    /// component. No other meaning.
    fn source_id(&self) -> &str;

    /// Reads into `buf` at `offset`. Reads past the end truncate; a read
    /// at or beyond the end returns 0.
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, Error>;

    /// Streams `length` bytes starting at `offset`, truncated to the end
    /// of the source.
    async fn read_range(
        &self,
        offset: u64,
        length: u64,
    ) -> Result<BoxStream<'static, Result<Bytes, Error>>, Error>;
}

/// Per-request header provider for a [`HttpSource`]. `invalidate` is
/// called once after a 401 before the single retry.
pub trait HeaderSource: Send + Sync {
    fn headers(&self) -> Result<HeaderMap, Error>;
    fn invalidate(&self) {}
}

/// Fixed header set, captured once.
pub struct StaticHeaders(pub HeaderMap);

impl HeaderSource for StaticHeaders {
    fn headers(&self) -> Result<HeaderMap, Error> {
        Ok(self.0.clone())
    }
}

/// No headers at all, for unauthenticated endpoints.
pub struct NoHeaders;

impl HeaderSource for NoHeaders {
    fn headers(&self) -> Result<HeaderMap, Error> {
        Ok(HeaderMap::new())
    }
}

/// A [`ByteSource`] over HTTP range requests.
///
/// Construction probes the remote for range support and captures the
/// content validators (`ETag`, `Last-Modified`). Every later request pins
/// those validators with `If-Match`/`If-Unmodified-Since`, so a server
/// holding modified content fails the request (412) instead of serving
/// silently changed bytes. Such a failure poisons the source for the rest
/// of its lifetime.
pub struct HttpSource {
    http: reqwest::Client,
    url: String,
    size: u64,
    etag: Option<String>,
    last_modified: Option<String>,
    headers: Arc<dyn HeaderSource>,
    source_id: String,
    poisoned: AtomicBool,
}

impl std::fmt::Debug for HttpSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSource")
            .field("url", &self.url)
            .field("size", &self.size)
            .field("etag", &self.etag)
            .field("last_modified", &self.last_modified)
            .field("source_id", &self.source_id)
            .field("poisoned", &self.poisoned)
            .finish()
    }
}

impl HttpSource {
    /// Probes `url` and builds the source. `source_id` should be the
    /// content digest when the caller knows it; otherwise an identifier is
    /// derived from the URL.
    pub async fn connect(
        http: reqwest::Client,
        url: String,
        headers: Arc<dyn HeaderSource>,
        source_id: Option<String>,
    ) -> Result<Self, Error> {
        let res = send_with_retry(&http, reqwest::Method::HEAD, &url, &headers, |req| req)
            .await?;
        if !res.status().is_success() {
            return Err(Error::from_status(res.status()));
        }
        let etag = header_string(res.headers(), header::ETAG);
        let last_modified = header_string(res.headers(), header::LAST_MODIFIED);
        let head_size = header_string(res.headers(), header::CONTENT_LENGTH)
            .and_then(|s| s.parse::<u64>().ok());
        drop(res);

        // 1-byte probe; the Content-Range total is the authoritative size
        let res = send_with_retry(&http, reqwest::Method::GET, &url, &headers, |req| {
            req.header(header::RANGE, "bytes=0-0")
        })
        .await?;
        let size = match res.status() {
            StatusCode::PARTIAL_CONTENT => {
                let total = content_range_total(res.headers()).ok_or_else(|| {
                    warn!("unparseable content-range from {url}");
                    Error::RangeNotSupported
                })?;
                let _ = res.bytes().await;
                total
            }
            StatusCode::OK => return Err(Error::RangeNotSupported),
            status => return Err(Error::from_status(status)),
        };
        if let Some(head_size) = head_size {
            if head_size != size {
                return Err(Error::SizeMismatch {
                    expected: head_size,
                    actual: size,
                });
            }
        }

        let source_id =
            source_id.unwrap_or_else(|| format!("url-sha256:{}", sha256_hex(&url)));
        debug!("range source {source_id} size={size} etag={etag:?}");
        Ok(HttpSource {
            http,
            url,
            size,
            etag,
            last_modified,
            headers,
            source_id,
            poisoned: AtomicBool::new(false),
        })
    }

    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    fn poison(&self) -> Error {
        self.poisoned.store(true, Ordering::Relaxed);
        Error::ContentChanged
    }

    // Ok(None) means the server reported the range as past the end
    async fn range_request(&self, start: u64, end: u64) -> Result<Option<Response>, Error> {
        if self.poisoned.load(Ordering::Relaxed) {
            return Err(Error::ContentChanged);
        }
        let res = send_with_retry(
            &self.http,
            reqwest::Method::GET,
            &self.url,
            &self.headers,
            |req| {
                let mut req = req.header(header::RANGE, format!("bytes={start}-{end}"));
                if let Some(etag) = &self.etag {
                    req = req.header(header::IF_MATCH, etag);
                }
                if let Some(lm) = &self.last_modified {
                    req = req.header(header::IF_UNMODIFIED_SINCE, lm);
                }
                req
            },
        )
        .await?;
        match res.status() {
            StatusCode::PARTIAL_CONTENT => {
                // a response carrying a different validator must never
                // contribute bytes
                if let (Some(pinned), Some(seen)) =
                    (&self.etag, header_string(res.headers(), header::ETAG))
                {
                    if *pinned != seen {
                        let _ = res.bytes().await;
                        return Err(self.poison());
                    }
                }
                Ok(Some(res))
            }
            StatusCode::PRECONDITION_FAILED => {
                let _ = res.bytes().await;
                Err(self.poison())
            }
            StatusCode::RANGE_NOT_SATISFIABLE => {
                let _ = res.bytes().await;
                Ok(None)
            }
            // the server ignored the range header; aborting beats reading
            // an arbitrarily large body
            StatusCode::OK => Err(Error::RangeNotSupported),
            status => Err(Error::from_status(status)),
        }
    }
}

#[async_trait]
impl ByteSource for HttpSource {
    fn size(&self) -> u64 {
        self.size
    }

    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, Error> {
        if offset >= self.size || buf.is_empty() {
            return Ok(0);
        }
        let end = (offset + buf.len() as u64).min(self.size);
        let want = (end - offset) as usize;
        trace!("read_at {} {offset}..{end}", self.source_id);
        let Some(mut res) = self.range_request(offset, end - 1).await? else {
            return Ok(0);
        };
        let mut filled = 0usize;
        while let Some(chunk) = res.chunk().await? {
            if filled + chunk.len() > want {
                return Err(Error::SizeMismatch {
                    expected: want as u64,
                    actual: (filled + chunk.len()) as u64,
                });
            }
            buf[filled..filled + chunk.len()].copy_from_slice(&chunk);
            filled += chunk.len();
        }
        if filled != want {
            return Err(Error::SizeMismatch {
                expected: want as u64,
                actual: filled as u64,
            });
        }
        Ok(filled)
    }

    async fn read_range(
        &self,
        offset: u64,
        length: u64,
    ) -> Result<BoxStream<'static, Result<Bytes, Error>>, Error> {
        if offset >= self.size || length == 0 {
            return Ok(futures::stream::empty().boxed());
        }
        let end = (offset + length).min(self.size);
        let Some(res) = self.range_request(offset, end - 1).await? else {
            return Ok(futures::stream::empty().boxed());
        };
        Ok(res.bytes_stream().map_err(Error::from).boxed())
    }
}

async fn send_with_retry(
    http: &reqwest::Client,
    method: reqwest::Method,
    url: &str,
    headers: &Arc<dyn HeaderSource>,
    decorate: impl Fn(reqwest::RequestBuilder) -> reqwest::RequestBuilder,
) -> Result<Response, Error> {
    let req = decorate(http.request(method.clone(), url).headers(headers.headers()?));
    let res = req.send().await?;
    if res.status() != StatusCode::UNAUTHORIZED {
        return Ok(res);
    }
    let _ = res.bytes().await;
    headers.invalidate();
    let req = decorate(http.request(method, url).headers(headers.headers()?));
    let res = req.send().await?;
    if res.status() == StatusCode::UNAUTHORIZED {
        return Err(Error::Unauthorized);
    }
    Ok(res)
}

fn header_string(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

// Content-Range: bytes <start>-<end>/<total>
fn content_range_total(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(header::CONTENT_RANGE)?.to_str().ok()?;
    let rest = value.strip_prefix("bytes ")?;
    let (_, total) = rest.split_once('/')?;
    total.parse().ok()
}
