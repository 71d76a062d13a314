//! HTTP(S) range-request source.
//!
//! Tiles are fetched with `Range: bytes=start-end` requests unless the
//! server answers `HEAD` with `Accept-Ranges: none`. A server that answers a
//! range request with `200 OK` does not support ranges; that body is kept
//! and sliced for every later read.
//! Timeouts and 5xx responses are retried with exponential backoff before
//! surfacing as [`StoreError::Io`].

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use super::source::RangeSource;
use super::StoreError;
use crate::executor::RetryPolicy;

/// Default request timeout.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default number of attempts per range request.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;

/// Configuration for remote sources.
#[derive(Debug, Clone)]
pub struct HttpSourceConfig {
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub user_agent: String,
}

impl Default for HttpSourceConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            retry: RetryPolicy::exponential(DEFAULT_MAX_ATTEMPTS),
            user_agent: format!("geolayer/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl HttpSourceConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Outcome of one request attempt.
enum Attempt {
    Done(Bytes),
    /// Worth retrying (timeout, connection failure, 5xx).
    Transient(String),
    Fatal(String),
}

/// A remote resource read through range requests.
pub struct HttpRangeSource {
    client: Client,
    url: String,
    len: u64,
    supports_ranges: bool,
    full_body: OnceCell<Bytes>,
    retry: RetryPolicy,
}

impl fmt::Debug for HttpRangeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpRangeSource")
            .field("url", &self.url)
            .field("len", &self.len)
            .field("supports_ranges", &self.supports_ranges)
            .finish()
    }
}

impl HttpRangeSource {
    /// Probes the resource for its length and range support.
    pub async fn connect(url: &str, config: HttpSourceConfig) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| StoreError::Io(format!("failed to build HTTP client: {}", e)))?;

        let mut source = Self {
            client,
            url: url.to_string(),
            len: 0,
            supports_ranges: true,
            full_body: OnceCell::new(),
            retry: config.retry,
        };

        let head = source
            .client
            .head(url)
            .send()
            .await
            .map_err(|e| StoreError::Io(format!("HEAD {} failed: {}", url, e)))?;
        if !head.status().is_success() {
            return Err(StoreError::Io(format!(
                "HEAD {} returned {}",
                url,
                head.status()
            )));
        }

        let header_len = head
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        // Many servers honour ranges without advertising them, so only an
        // explicit refusal skips straight to full-body reads.
        source.supports_ranges = !head
            .headers()
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("none"));

        source.len = match header_len {
            Some(len) => len,
            None => source.probe_length().await?,
        };

        debug!(
            url,
            len = source.len,
            supports_ranges = source.supports_ranges,
            "Connected to remote raster"
        );
        Ok(source)
    }

    /// Learns the length from a one-byte range request.
    async fn probe_length(&mut self) -> Result<u64, StoreError> {
        let resp = self
            .client
            .get(&self.url)
            .header(RANGE, "bytes=0-0")
            .send()
            .await
            .map_err(|e| StoreError::Io(format!("GET {} failed: {}", self.url, e)))?;

        if resp.status() == StatusCode::PARTIAL_CONTENT {
            self.supports_ranges = true;
            resp.headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range_total)
                .ok_or_else(|| StoreError::Io(format!("{} sent no usable Content-Range", self.url)))
        } else if resp.status().is_success() {
            let body = resp
                .bytes()
                .await
                .map_err(|e| StoreError::Io(format!("GET {} failed: {}", self.url, e)))?;
            let len = body.len() as u64;
            let _ = self.full_body.set(body);
            Ok(len)
        } else {
            Err(StoreError::Io(format!("GET {} returned {}", self.url, resp.status())))
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn supports_ranges(&self) -> bool {
        self.supports_ranges
    }

    async fn fetch_full(&self) -> Result<Bytes, StoreError> {
        self.full_body
            .get_or_try_init(|| async {
                warn!(url = %self.url, "Server does not support ranges; fetching full body");
                self.with_retry(|| async {
                    match self.client.get(&self.url).send().await {
                        Ok(resp) if resp.status().is_success() => match resp.bytes().await {
                            Ok(b) => Attempt::Done(b),
                            Err(e) => Attempt::Transient(e.to_string()),
                        },
                        Ok(resp) => classify_status(resp.status()),
                        Err(e) => classify_error(e),
                    }
                })
                .await
            })
            .await
            .cloned()
    }

    async fn fetch_range(&self, offset: u64, length: u64) -> Result<Bytes, StoreError> {
        let end = offset + length - 1;
        let range = format!("bytes={}-{}", offset, end);

        let body = self
            .with_retry(|| async {
                match self
                    .client
                    .get(&self.url)
                    .header(RANGE, range.as_str())
                    .send()
                    .await
                {
                    Ok(resp) if resp.status() == StatusCode::PARTIAL_CONTENT => {
                        match resp.bytes().await {
                            Ok(b) => Attempt::Done(b),
                            Err(e) => Attempt::Transient(e.to_string()),
                        }
                    }
                    Ok(resp) if resp.status() == StatusCode::OK => {
                        // Range ignored: the body is the whole resource.
                        match resp.bytes().await {
                            Ok(b) => {
                                let _ = self.full_body.set(b.clone());
                                Attempt::Done(b)
                            }
                            Err(e) => Attempt::Transient(e.to_string()),
                        }
                    }
                    Ok(resp) => classify_status(resp.status()),
                    Err(e) => classify_error(e),
                }
            })
            .await?;

        if body.len() as u64 == length {
            Ok(body)
        } else if body.len() as u64 == self.len && length != self.len {
            Ok(body.slice(offset as usize..(offset + length) as usize))
        } else {
            Err(StoreError::Io(format!(
                "{} returned {} bytes for range {}",
                self.url,
                body.len(),
                range
            )))
        }
    }

    async fn with_retry<F, Fut>(&self, mut attempt_fn: F) -> Result<Bytes, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Attempt>,
    {
        let mut attempt = 1;
        loop {
            match attempt_fn().await {
                Attempt::Done(bytes) => return Ok(bytes),
                Attempt::Fatal(msg) => return Err(StoreError::Io(msg)),
                Attempt::Transient(msg) => match self.retry.delay_for_attempt(attempt) {
                    Some(delay) => {
                        debug!(url = %self.url, attempt, error = %msg, "Retrying range request");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => {
                        return Err(StoreError::Io(format!(
                            "{} failed after {} attempts: {}",
                            self.url, attempt, msg
                        )))
                    }
                },
            }
        }
    }
}

fn classify_status(status: StatusCode) -> Attempt {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Attempt::Transient(format!("status {}", status))
    } else {
        Attempt::Fatal(format!("status {}", status))
    }
}

fn classify_error(e: reqwest::Error) -> Attempt {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        Attempt::Transient(e.to_string())
    } else {
        Attempt::Fatal(e.to_string())
    }
}

/// Extracts the total from `bytes start-end/total`.
fn parse_content_range_total(value: &str) -> Option<u64> {
    value.rsplit_once('/')?.1.trim().parse().ok()
}

impl RangeSource for HttpRangeSource {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_range(&self, offset: u64, length: u64) -> BoxFuture<'_, Result<Bytes, StoreError>> {
        Box::pin(async move {
            match offset.checked_add(length) {
                Some(end) if end <= self.len => {}
                _ => {
                    return Err(StoreError::Io(format!(
                        "read of {} bytes at {} exceeds length {}",
                        length, offset, self.len
                    )))
                }
            }
            if length == 0 {
                return Ok(Bytes::new());
            }
            if let Some(full) = self.full_body.get() {
                return Ok(full.slice(offset as usize..(offset + length) as usize));
            }
            if !self.supports_ranges {
                let full = self.fetch_full().await?;
                return Ok(full.slice(offset as usize..(offset + length) as usize));
            }
            self.fetch_range(offset, length).await
        })
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::store::open_source;

    // =========================================================================
    // Loopback Server
    // =========================================================================

    /// How the test server treats `Range` headers.
    #[derive(Debug, Clone, Copy)]
    enum RangeMode {
        /// `Accept-Ranges: bytes` on HEAD, 206 for ranges.
        Advertised,
        /// No `Accept-Ranges` header, 206 for ranges.
        Unadvertised,
        /// No `Accept-Ranges` header, always the full body with 200.
        Ignored,
        /// `Accept-Ranges: none`, always the full body with 200.
        Refused,
    }

    #[derive(Debug, Default)]
    struct Served {
        partial: AtomicUsize,
        full: AtomicUsize,
    }

    impl Served {
        fn counts(&self) -> (usize, usize) {
            (
                self.partial.load(Ordering::SeqCst),
                self.full.load(Ordering::SeqCst),
            )
        }
    }

    fn raster_bytes() -> Arc<Vec<u8>> {
        Arc::new((0..64 * 1024).map(|i| (i % 251) as u8).collect())
    }

    /// Serves `body` on 127.0.0.1, one request per connection.
    fn serve(body: Arc<Vec<u8>>, mode: RangeMode) -> (String, Arc<Served>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/ortho.tif", listener.local_addr().unwrap());
        let served = Arc::new(Served::default());
        let counters = Arc::clone(&served);
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let body = Arc::clone(&body);
                let counters = Arc::clone(&counters);
                std::thread::spawn(move || respond(stream, &body, mode, &counters));
            }
        });
        (url, served)
    }

    fn respond(stream: TcpStream, body: &[u8], mode: RangeMode, served: &Served) {
        let Ok(read_half) = stream.try_clone() else { return };
        let mut reader = BufReader::new(read_half);
        let mut request_line = String::new();
        if reader.read_line(&mut request_line).unwrap_or(0) == 0 {
            return;
        }
        let mut range = None;
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).unwrap_or(0) == 0 {
                return;
            }
            let line = line.trim_end();
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                if name.eq_ignore_ascii_case("range") {
                    range = value
                        .trim()
                        .strip_prefix("bytes=")
                        .and_then(|r| r.split_once('-'))
                        .and_then(|(a, b)| Some((a.parse::<usize>().ok()?, b.parse::<usize>().ok()?)));
                }
            }
        }

        let is_head = request_line.starts_with("HEAD");
        let accept = match mode {
            RangeMode::Advertised => "Accept-Ranges: bytes\r\n",
            RangeMode::Refused => "Accept-Ranges: none\r\n",
            RangeMode::Unadvertised | RangeMode::Ignored => "",
        };
        let honours_ranges = matches!(mode, RangeMode::Advertised | RangeMode::Unadvertised);
        let (status, content_range, payload) = match range {
            Some((start, end)) if honours_ranges && !is_head => {
                served.partial.fetch_add(1, Ordering::SeqCst);
                (
                    "206 Partial Content",
                    format!("Content-Range: bytes {}-{}/{}\r\n", start, end, body.len()),
                    &body[start..=end],
                )
            }
            _ => {
                if !is_head {
                    served.full.fetch_add(1, Ordering::SeqCst);
                }
                ("200 OK", String::new(), body)
            }
        };

        let mut out = stream;
        let header = format!(
            "HTTP/1.1 {}\r\nContent-Length: {}\r\n{}{}Connection: close\r\n\r\n",
            status,
            payload.len(),
            accept,
            content_range
        );
        let _ = out.write_all(header.as_bytes());
        if !is_head {
            let _ = out.write_all(payload);
        }
        let _ = out.flush();
    }

    async fn connect(url: &str) -> HttpRangeSource {
        let config = HttpSourceConfig::default().with_retry(RetryPolicy::none());
        HttpRangeSource::connect(url, config).await.unwrap()
    }

    // =========================================================================
    // Range Behaviour
    // =========================================================================

    #[tokio::test]
    async fn test_advertised_ranges_use_partial_reads() {
        let data = raster_bytes();
        let (url, served) = serve(Arc::clone(&data), RangeMode::Advertised);
        let source = connect(&url).await;

        assert!(source.supports_ranges());
        assert_eq!(source.len(), data.len() as u64);
        assert_eq!(&source.read_range(100, 16).await.unwrap()[..], &data[100..116]);
        assert_eq!(&source.read_range(40_000, 512).await.unwrap()[..], &data[40_000..40_512]);
        assert_eq!(served.counts(), (2, 0));
    }

    #[tokio::test]
    async fn test_unadvertised_ranges_are_still_requested() {
        let data = raster_bytes();
        let (url, served) = serve(Arc::clone(&data), RangeMode::Unadvertised);
        let source = open_source(&url, &HttpSourceConfig::default()).await.unwrap();

        assert_eq!(source.describe(), url);
        assert_eq!(&source.read_range(100, 16).await.unwrap()[..], &data[100..116]);
        assert_eq!(served.counts(), (1, 0));
    }

    #[tokio::test]
    async fn test_ignored_range_falls_back_to_one_full_body() {
        let data = raster_bytes();
        let (url, served) = serve(Arc::clone(&data), RangeMode::Ignored);
        let source = connect(&url).await;

        assert_eq!(&source.read_range(100, 16).await.unwrap()[..], &data[100..116]);
        assert_eq!(&source.read_range(60_000, 64).await.unwrap()[..], &data[60_000..60_064]);
        assert_eq!(served.counts(), (0, 1));
    }

    #[tokio::test]
    async fn test_refused_ranges_fetch_full_body_once() {
        let data = raster_bytes();
        let (url, served) = serve(Arc::clone(&data), RangeMode::Refused);
        let source = connect(&url).await;

        assert!(!source.supports_ranges());
        assert_eq!(&source.read_range(8, 8).await.unwrap()[..], &data[8..16]);
        assert_eq!(&source.read_range(1024, 8).await.unwrap()[..], &data[1024..1032]);
        assert_eq!(served.counts(), (0, 1));
    }

    #[tokio::test]
    async fn test_read_past_end_is_rejected_without_request() {
        let data = raster_bytes();
        let (url, served) = serve(Arc::clone(&data), RangeMode::Advertised);
        let source = connect(&url).await;

        let err = source.read_range(data.len() as u64 - 4, 8).await.unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
        assert_eq!(served.counts(), (0, 0));
    }

    #[test]
    fn test_parse_content_range() {
        assert_eq!(parse_content_range_total("bytes 0-0/12345"), Some(12345));
        assert_eq!(parse_content_range_total("bytes 0-0/*"), None);
        assert_eq!(parse_content_range_total("garbage"), None);
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            Attempt::Transient(_)
        ));
        assert!(matches!(classify_status(StatusCode::NOT_FOUND), Attempt::Fatal(_)));
    }

    #[test]
    fn test_default_config() {
        let config = HttpSourceConfig::default();
        assert_eq!(config.retry.max_attempts(), DEFAULT_MAX_ATTEMPTS);
        assert_eq!(config.timeout, Duration::from_secs(DEFAULT_TIMEOUT_SECS));
    }
}
