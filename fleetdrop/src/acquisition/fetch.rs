//! Bounded HTTP fetcher.
//!
//! GET requests with manual redirect following (bounded hop count), an idle
//! timeout on connecting and on every socket read, and two output modes:
//! - buffered into memory, for small JSON documents
//! - streamed into a file, for artifact downloads
//!
//! The timeout bounds how long the connection may stall, not how long a
//! transfer may take, so a slow but steady download always completes.
//!
//! The [`Fetcher`] trait exists so the acquisition engine can be exercised
//! against a scripted fetcher in tests.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, LOCATION, USER_AGENT};
use reqwest::{Client, Response, Url};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, warn};

use super::error::{AcquisitionError, AcquisitionResult};

/// Default connect and read idle timeout (seconds).
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Maximum number of redirect hops before the request fails closed.
pub const MAX_REDIRECTS: usize = 4;

/// Identifying header sent with every request.
pub const DEFAULT_USER_AGENT: &str =
    concat!("fleetdrop-payload-updater/", env!("CARGO_PKG_VERSION"));

/// Caller-supplied request headers (name -> value).
pub type RequestHeaders = BTreeMap<String, String>;

/// A fully buffered response body.
#[derive(Debug, Clone)]
pub struct FetchedBody {
    /// URL that produced the body, after redirects.
    pub final_url: String,
    /// Final HTTP status.
    pub status: u16,
    /// Response bytes.
    pub body: Vec<u8>,
}

/// GET operations used by the acquisition engine.
pub trait Fetcher: Send + Sync {
    /// Fetch `url` and buffer the whole body in memory.
    fn fetch_bytes<'a>(
        &'a self,
        url: &'a str,
        headers: &'a RequestHeaders,
    ) -> BoxFuture<'a, AcquisitionResult<FetchedBody>>;

    /// Fetch `url` and stream the body into `dest`, returning the byte count.
    ///
    /// `dest` is created (or truncated). The file handle is closed before the
    /// future resolves. On error the partially written file is left for the
    /// caller to remove.
    fn fetch_to_file<'a>(
        &'a self,
        url: &'a str,
        headers: &'a RequestHeaders,
        dest: &'a Path,
    ) -> BoxFuture<'a, AcquisitionResult<u64>>;
}

/// reqwest-backed [`Fetcher`].
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    pub(crate) timeout: Duration,
    pub(crate) max_redirects: usize,
}

impl HttpFetcher {
    /// Create a fetcher with the default timeout and redirect limit.
    pub fn new() -> AcquisitionResult<Self> {
        Self::with_timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    /// Create a fetcher with a custom connect and read idle timeout.
    pub fn with_timeout(timeout: Duration) -> AcquisitionResult<Self> {
        // Redirects are followed by hand so the hop limit and relative
        // Location resolution stay under our control.
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()
            .map_err(|e| AcquisitionError::Network {
                url: String::new(),
                reason: format!("failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            timeout,
            max_redirects: MAX_REDIRECTS,
        })
    }

    /// Override the redirect hop limit.
    pub fn with_max_redirects(mut self, max_redirects: usize) -> Self {
        self.max_redirects = max_redirects;
        self
    }

    fn map_request_error(&self, url: &str, e: reqwest::Error) -> AcquisitionError {
        if e.is_timeout() {
            AcquisitionError::Timeout {
                url: url.to_string(),
                timeout_secs: self.timeout.as_secs(),
            }
        } else {
            AcquisitionError::Network {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    }

    /// Issue GETs until a non-redirect response arrives.
    ///
    /// Returns the successful response and the URL that produced it.
    async fn get_following_redirects(
        &self,
        url: &str,
        headers: &HeaderMap,
    ) -> AcquisitionResult<(Response, Url)> {
        let mut current =
            Url::parse(url).map_err(|_| AcquisitionError::InvalidUrl(url.to_string()))?;
        let mut hops = 0usize;

        loop {
            let response = self
                .client
                .get(current.clone())
                .headers(headers.clone())
                .send()
                .await
                .map_err(|e| self.map_request_error(current.as_str(), e))?;

            let status = response.status();
            let location = status
                .is_redirection()
                .then(|| response.headers().get(LOCATION))
                .flatten()
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);

            if let Some(location) = location {
                if hops >= self.max_redirects {
                    return Err(AcquisitionError::TooManyRedirects {
                        url: url.to_string(),
                        max_redirects: self.max_redirects,
                    });
                }
                let next = current
                    .join(&location)
                    .map_err(|_| AcquisitionError::InvalidUrl(location.clone()))?;
                debug!(from = %current, to = %next, hop = hops + 1, "Following redirect");
                hops += 1;
                current = next;
                continue;
            }

            if !status.is_success() {
                return Err(AcquisitionError::HttpStatus {
                    url: current.to_string(),
                    status: status.as_u16(),
                });
            }

            return Ok((response, current));
        }
    }

    async fn buffered(
        &self,
        url: &str,
        headers: &RequestHeaders,
    ) -> AcquisitionResult<FetchedBody> {
        let header_map = build_header_map(headers);
        let (response, final_url) = self.get_following_redirects(url, &header_map).await?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| self.map_request_error(final_url.as_str(), e))?;

        Ok(FetchedBody {
            final_url: final_url.to_string(),
            status,
            body: body.to_vec(),
        })
    }

    async fn streamed(
        &self,
        url: &str,
        headers: &RequestHeaders,
        dest: &Path,
    ) -> AcquisitionResult<u64> {
        let header_map = build_header_map(headers);
        let (mut response, final_url) = self.get_following_redirects(url, &header_map).await?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                AcquisitionError::CreateDirFailed {
                    path: parent.to_path_buf(),
                    source: e,
                }
            })?;
        }

        let file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| AcquisitionError::WriteFailed {
                path: dest.to_path_buf(),
                source: e,
            })?;
        let mut writer = BufWriter::new(file);
        let mut written = 0u64;

        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| self.map_request_error(final_url.as_str(), e))?
        {
            writer
                .write_all(&chunk)
                .await
                .map_err(|e| AcquisitionError::WriteFailed {
                    path: dest.to_path_buf(),
                    source: e,
                })?;
            written += chunk.len() as u64;
        }

        writer
            .flush()
            .await
            .map_err(|e| AcquisitionError::WriteFailed {
                path: dest.to_path_buf(),
                source: e,
            })?;
        let file = writer.into_inner();
        file.sync_all()
            .await
            .map_err(|e| AcquisitionError::WriteFailed {
                path: dest.to_path_buf(),
                source: e,
            })?;
        drop(file);

        debug!(url = %final_url, bytes = written, dest = %dest.display(), "Download complete");
        Ok(written)
    }
}

impl Fetcher for HttpFetcher {
    fn fetch_bytes<'a>(
        &'a self,
        url: &'a str,
        headers: &'a RequestHeaders,
    ) -> BoxFuture<'a, AcquisitionResult<FetchedBody>> {
        self.buffered(url, headers).boxed()
    }

    fn fetch_to_file<'a>(
        &'a self,
        url: &'a str,
        headers: &'a RequestHeaders,
        dest: &'a Path,
    ) -> BoxFuture<'a, AcquisitionResult<u64>> {
        self.streamed(url, headers, dest).boxed()
    }
}

/// Merge caller headers over the default identifying header.
///
/// Headers with invalid names or values are skipped with a warning.
pub fn build_header_map(headers: &RequestHeaders) -> HeaderMap {
    let mut map = HeaderMap::new();
    map.insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));

    for (name, value) in headers {
        let parsed = HeaderName::from_bytes(name.as_bytes())
            .ok()
            .zip(HeaderValue::from_str(value).ok());
        match parsed {
            Some((name, value)) => {
                map.insert(name, value);
            }
            None => warn!(header = %name, "Skipping invalid request header"),
        }
    }

    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::AUTHORIZATION;

    #[test]
    fn test_http_fetcher_defaults() {
        let fetcher = HttpFetcher::new().unwrap();
        assert_eq!(fetcher.timeout.as_secs(), DEFAULT_TIMEOUT_SECS);
        assert_eq!(fetcher.max_redirects, MAX_REDIRECTS);
    }

    #[test]
    fn test_http_fetcher_custom_limits() {
        let fetcher = HttpFetcher::with_timeout(Duration::from_secs(5))
            .unwrap()
            .with_max_redirects(1);
        assert_eq!(fetcher.timeout.as_secs(), 5);
        assert_eq!(fetcher.max_redirects, 1);
    }

    #[test]
    fn test_header_map_includes_user_agent() {
        let map = build_header_map(&RequestHeaders::new());
        assert_eq!(map.get(USER_AGENT).unwrap(), DEFAULT_USER_AGENT);
    }

    #[test]
    fn test_header_map_caller_headers_override_defaults() {
        let mut headers = RequestHeaders::new();
        headers.insert("User-Agent".to_string(), "custom/1.0".to_string());
        headers.insert("Authorization".to_string(), "token abc".to_string());

        let map = build_header_map(&headers);
        assert_eq!(map.get(USER_AGENT).unwrap(), "custom/1.0");
        assert_eq!(map.get(AUTHORIZATION).unwrap(), "token abc");
    }

    #[test]
    fn test_header_map_skips_invalid_headers() {
        let mut headers = RequestHeaders::new();
        headers.insert("bad header".to_string(), "x".to_string());
        headers.insert("X-Ok".to_string(), "fine".to_string());

        let map = build_header_map(&headers);
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("x-ok").unwrap(), "fine");
    }

    #[tokio::test]
    async fn test_invalid_url_is_rejected() {
        let fetcher = HttpFetcher::new().unwrap();
        let result = fetcher.fetch_bytes("not a url", &RequestHeaders::new()).await;
        assert!(matches!(result, Err(AcquisitionError::InvalidUrl(_))));
    }
}
