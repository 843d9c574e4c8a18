//! Range GETs against a resolved blob URL.

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use reqwest::header::{HeaderValue, ACCEPT_ENCODING, CONTENT_RANGE, CONTENT_TYPE, RANGE};
use reqwest::{Method, Request, Response, StatusCode, Url};
use seekpull_core::config::FetchConfig;
use seekpull_core::{Region, SeekpullError, SeekpullResult};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::multipart::{boundary, parse_content_range, MultipartParts, Part};
use crate::redact::redact_url;
use crate::retry::{with_retries, RetryPolicy};

/// Sends requests on behalf of a fetcher. Authentication and redirect
/// handling belong to the transport.
pub trait Transport: Send + Sync {
    fn round_trip(&self, request: Request) -> BoxFuture<'_, reqwest::Result<Response>>;
}

impl Transport for reqwest::Client {
    fn round_trip(&self, request: Request) -> BoxFuture<'_, reqwest::Result<Response>> {
        Box::pin(self.execute(request))
    }
}

fn range_request(url: &Url, range: &str) -> SeekpullResult<Request> {
    let mut req = Request::new(Method::GET, url.clone());
    let value = HeaderValue::from_str(range)
        .map_err(|e| SeekpullError::protocol(format!("invalid Range header {range:?}: {e}")))?;
    req.headers_mut().insert(RANGE, value);
    // byte offsets must refer to the stored representation
    req.headers_mut()
        .insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
    Ok(req)
}

fn transport_error(url: &Url, err: reqwest::Error) -> SeekpullError {
    SeekpullError::Transport {
        url: redact_url(url),
        status: err.status().map(|s| s.as_u16()),
        message: err.without_url().to_string(),
    }
}

fn status_error(url: &Url, status: StatusCode) -> SeekpullError {
    SeekpullError::Transport {
        url: redact_url(url),
        status: Some(status.as_u16()),
        message: format!("unexpected HTTP status {status}"),
    }
}

fn header<'a>(resp: &'a Response, name: &reqwest::header::HeaderName) -> Option<&'a str> {
    resp.headers().get(name).and_then(|v| v.to_str().ok())
}

/// Fetches byte ranges of one blob.
///
/// Immutable once built: re-resolving the URL produces a new fetcher.
pub struct HttpFetcher {
    transport: Arc<dyn Transport>,
    ref_url: Url,
    url: Url,
    size: u64,
    policy: RetryPolicy,
    config: FetchConfig,
}

impl fmt::Debug for HttpFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpFetcher")
            .field("url", &redact_url(&self.url))
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl HttpFetcher {
    /// Follow redirects from `ref_url` to the blob's storage URL and learn its size.
    pub async fn resolve(
        transport: Arc<dyn Transport>,
        ref_url: Url,
        config: FetchConfig,
        cancel: &CancellationToken,
    ) -> SeekpullResult<Self> {
        config.validate()?;
        let policy = RetryPolicy::from(&config);
        let (url, size) = {
            let t = transport.as_ref();
            let r = &ref_url;
            with_retries(&policy, cancel, r, "resolve", || resolve_once(t, r)).await?
        };
        debug!(
            reference = %redact_url(&ref_url),
            url = %redact_url(&url),
            size,
            "resolved blob"
        );
        Ok(HttpFetcher {
            transport,
            ref_url,
            url,
            size,
            policy,
            config,
        })
    }

    /// Resolve the reference URL again, e.g. after a pre-signed URL expired.
    pub async fn reresolve(&self, cancel: &CancellationToken) -> SeekpullResult<Self> {
        Self::resolve(
            self.transport.clone(),
            self.ref_url.clone(),
            self.config.clone(),
            cancel,
        )
        .await
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// One range request for all of `regions`, retried on transient failure.
    ///
    /// Parts may arrive in any shape the server chooses (whole object,
    /// single range, or multipart); callers locate their bytes by region.
    pub async fn fetch(
        &self,
        regions: &[Region],
        cancel: &CancellationToken,
    ) -> SeekpullResult<Vec<Part>> {
        if regions.is_empty() {
            return Err(SeekpullError::protocol("no regions requested"));
        }
        let range = format!(
            "bytes={}",
            regions
                .iter()
                .map(Region::range_spec)
                .collect::<Vec<_>>()
                .join(",")
        );
        let parts = with_retries(&self.policy, cancel, &self.url, "fetch", || {
            self.fetch_once(&range)
        })
        .await?;
        debug!(
            url = %redact_url(&self.url),
            regions = regions.len(),
            parts = parts.len(),
            bytes = parts.iter().map(|p| p.data.len()).sum::<usize>(),
            "fetched"
        );
        Ok(parts)
    }

    async fn fetch_once(&self, range: &str) -> SeekpullResult<Vec<Part>> {
        let resp = self
            .transport
            .round_trip(range_request(&self.url, range)?)
            .await
            .map_err(|e| transport_error(&self.url, e))?;

        match resp.status() {
            StatusCode::OK => {
                // range ignored: the whole object
                let body = resp
                    .bytes()
                    .await
                    .map_err(|e| transport_error(&self.url, e))?;
                if body.len() as u64 != self.size {
                    return Err(SeekpullError::ShortRead {
                        expected: self.size,
                        actual: body.len() as u64,
                    });
                }
                if self.size == 0 {
                    return Ok(Vec::new());
                }
                Ok(vec![Part {
                    region: Region::new(0, self.size - 1),
                    data: body,
                }])
            }
            StatusCode::PARTIAL_CONTENT => {
                let content_type = header(&resp, &CONTENT_TYPE).unwrap_or_default().to_string();
                if content_type.to_ascii_lowercase().starts_with("multipart/") {
                    let boundary = boundary(&content_type).ok_or_else(|| {
                        SeekpullError::protocol(format!("no boundary in {content_type}"))
                    })?;
                    let body = resp
                        .bytes()
                        .await
                        .map_err(|e| transport_error(&self.url, e))?;
                    return MultipartParts::new(body, &boundary, self.size).collect();
                }

                let content_range = header(&resp, &CONTENT_RANGE)
                    .ok_or_else(|| SeekpullError::protocol("206 without Content-Range"))?
                    .to_string();
                let (region, total) = parse_content_range(&content_range)?;
                if total.is_some_and(|t| t != self.size) || region.end >= self.size {
                    return Err(SeekpullError::protocol(format!(
                        "{content_range} does not fit object of {} bytes",
                        self.size
                    )));
                }
                let body = resp
                    .bytes()
                    .await
                    .map_err(|e| transport_error(&self.url, e))?;
                if body.len() as u64 != region.size() {
                    return Err(SeekpullError::ShortRead {
                        expected: region.size(),
                        actual: body.len() as u64,
                    });
                }
                Ok(vec![Part { region, data: body }])
            }
            status => Err(status_error(&self.url, status)),
        }
    }

    /// Cheap liveness check: a 2-byte range request.
    pub async fn probe(&self, cancel: &CancellationToken) -> SeekpullResult<()> {
        with_retries(&self.policy, cancel, &self.url, "probe", || async {
            let resp = self
                .transport
                .round_trip(range_request(&self.url, "bytes=0-1")?)
                .await
                .map_err(|e| transport_error(&self.url, e))?;
            match resp.status() {
                StatusCode::OK | StatusCode::PARTIAL_CONTENT => Ok(()),
                status => Err(status_error(&self.url, status)),
            }
        })
        .await
    }
}

async fn resolve_once(transport: &dyn Transport, ref_url: &Url) -> SeekpullResult<(Url, u64)> {
    let resp = transport
        .round_trip(range_request(ref_url, "bytes=0-1")?)
        .await
        .map_err(|e| transport_error(ref_url, e))?;
    let size = match resp.status() {
        StatusCode::OK => resp
            .content_length()
            .ok_or_else(|| SeekpullError::protocol("200 response without Content-Length"))?,
        StatusCode::PARTIAL_CONTENT => {
            let content_range = header(&resp, &CONTENT_RANGE)
                .ok_or_else(|| SeekpullError::protocol("206 without Content-Range"))?;
            parse_content_range(content_range)?
                .1
                .ok_or_else(|| SeekpullError::protocol("Content-Range without total size"))?
        }
        status => return Err(status_error(ref_url, status)),
    };
    Ok((resp.url().clone(), size))
}
