//! HTTP transport for downloading files from a file server.
//!
//! One `FileClient` is built per target server and reused across all
//! downloads against it; connection pooling inside the hyper client is what
//! makes sustained throughput measurements meaningful.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::header::{HeaderMap, TE};
use http::{Method, Request, StatusCode, Uri};
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::checksum::{ChecksumAlgorithm, ChecksumMode};
use crate::server::{HEADER_CHECKSUM_ALGORITHM, TRAILER_CHECKSUM_VALUE, TRAILER_CONTENT_LENGTH};
use crate::tls::{self, ConfigError};

/// Idle connections kept per server; pooling dominates sustained throughput
const MAX_IDLE_PER_HOST: usize = 100;

/* ------------------------------ Errors ------------------------------ */

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("error building request: {0}")]
    BadRequest(String),

    #[error("request failed: {0}")]
    Transport(String),

    #[error("error downloading file: {0:?}")]
    Status(String),

    #[error("error writing to sink: {0}")]
    Sink(#[from] std::io::Error),

    #[error("unexpected server algorithm {0:?}")]
    AlgorithmMismatch(String),

    #[error("missing {0:?} trailer")]
    MissingTrailer(&'static str),

    #[error("response body length {received} does not match X-Content-Length value {reported}")]
    LengthMismatch { reported: u64, received: u64 },

    #[error("computed checksum ({computed}) and received checksum ({received}) do not match")]
    ChecksumMismatch { computed: String, received: String },
}

/* ------------------------------ Report ------------------------------ */

/// Outcome of a single download operation.
#[derive(Debug)]
pub struct DownloadReport {
    /// Start and end times of the download operation
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,

    /// Time from emitting the GET until the response headers arrived
    pub time_to_first_byte: Duration,

    /// Checksum of the downloaded file in `algo:hex` form, when one was
    /// computed by either end
    pub checksum: Option<String>,

    /// Error, if the download failed
    pub err: Option<DownloadError>,
}

/* ------------------------------ Client ------------------------------ */

/// Options for building a `FileClient`.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Use HTTP/1.1 instead of the default HTTP/2
    pub use_http1: bool,
    /// Plain HTTP (no TLS); certificate material is not loaded in this mode
    pub plain_http: bool,
    /// CA bundle used to verify the server
    pub ca: PathBuf,
    /// Client certificate and key; both or neither
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
}

enum InnerClient {
    Tls(Client<HttpsConnector<HttpConnector>, Empty<Bytes>>),
    Plain(Client<HttpConnector, Empty<Bytes>>),
}

/// HTTP client bound to one file server protocol configuration.
pub struct FileClient {
    inner: InnerClient,
    scheme: &'static str,
}

impl FileClient {
    pub fn new(options: &ClientOptions) -> Result<Self, ConfigError> {
        let mut builder = Client::builder(TokioExecutor::new());
        builder
            .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
            .pool_timer(TokioTimer::new())
            .timer(TokioTimer::new());
        if !options.use_http1 {
            // HTTP/2 is an explicit opt-in; over plain TCP this means
            // prior-knowledge h2c
            builder.http2_only(true);
        }

        if options.plain_http {
            let mut connector = HttpConnector::new();
            connector.set_nodelay(true);
            return Ok(Self {
                inner: InnerClient::Plain(builder.build(connector)),
                scheme: "http",
            });
        }

        let tls = tls::client_config(
            options.cert.as_deref(),
            options.key.as_deref(),
            &options.ca,
        )?;
        let https = HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_or_http();
        let https = if options.use_http1 {
            https.enable_http1().build()
        } else {
            https.enable_http2().build()
        };
        Ok(Self {
            inner: InnerClient::Tls(builder.build(https)),
            scheme: "https",
        })
    }

    async fn request(
        &self,
        req: Request<Empty<Bytes>>,
    ) -> Result<http::Response<Incoming>, hyper_util::client::legacy::Error> {
        match &self.inner {
            InnerClient::Tls(client) => client.request(req).await,
            InnerClient::Plain(client) => client.request(req).await,
        }
    }

    /// Download the file identified by `file_id` of `size` bytes from
    /// `server_addr`, copying the body into `dst`. `mode` selects where the
    /// checksum (with algorithm `algorithm`) is computed, if anywhere.
    pub async fn download_file<W>(
        &self,
        server_addr: &str,
        file_id: &str,
        size: u64,
        mode: ChecksumMode,
        algorithm: ChecksumAlgorithm,
        dst: &mut W,
    ) -> DownloadReport
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut report = DownloadReport {
            start: Utc::now(),
            end: Utc::now(),
            time_to_first_byte: Duration::ZERO,
            checksum: None,
            err: None,
        };
        if let Err(e) = self
            .download_into(server_addr, file_id, size, mode, algorithm, dst, &mut report)
            .await
        {
            report.err = Some(e);
        }
        report
    }

    async fn download_into<W>(
        &self,
        server_addr: &str,
        file_id: &str,
        size: u64,
        mode: ChecksumMode,
        algorithm: ChecksumAlgorithm,
        dst: &mut W,
        report: &mut DownloadReport,
    ) -> Result<(), DownloadError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        // The server computes the checksum only when asked to via the query
        let request_checksum =
            mode == ChecksumMode::ServerOnly || mode == ChecksumMode::Both;

        let query_string = {
            let mut query = url::form_urlencoded::Serializer::new(String::new());
            query.append_pair("id", file_id);
            query.append_pair("size", &size.to_string());
            if request_checksum {
                query.append_pair("checksum", algorithm.name());
            }
            query.finish().clone()
        };
        let uri: Uri = format!(
            "{}://{}/file?{}",
            self.scheme,
            server_addr,
            query_string
        )
        .parse()
        .map_err(|e: http::uri::InvalidUri| DownloadError::BadRequest(e.to_string()))?;

        let req = Request::builder()
            .method(Method::GET)
            .uri(uri)
            // Advertise that we can read trailers
            .header(TE, "trailers")
            .body(Empty::new())
            .map_err(|e| DownloadError::BadRequest(e.to_string()))?;

        report.start = Utc::now();
        let started = Instant::now();
        let response = self
            .request(req)
            .await
            .map_err(|e| DownloadError::Transport(e.to_string()))?;
        report.time_to_first_byte = started.elapsed();

        // A non-200 body carries the server's error message
        if response.status() != StatusCode::OK {
            let message = match response.into_body().collect().await {
                Ok(collected) => String::from_utf8_lossy(&collected.to_bytes()).into_owned(),
                Err(_) => String::new(),
            };
            return Err(DownloadError::Status(message));
        }

        let mut hasher = match mode {
            ChecksumMode::ClientOnly => Some(algorithm.new_hasher()),
            ChecksumMode::Both => {
                // The server must be hashing with the algorithm we asked for
                let server_algorithm = response
                    .headers()
                    .get(HEADER_CHECKSUM_ALGORITHM)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("");
                if !server_algorithm.eq_ignore_ascii_case(algorithm.name()) {
                    return Err(DownloadError::AlgorithmMismatch(
                        server_algorithm.to_string(),
                    ));
                }
                Some(algorithm.new_hasher())
            }
            ChecksumMode::None | ChecksumMode::ServerOnly => None,
        };

        // Receive the body, teeing into the hasher when one is active
        let mut body = response.into_body();
        let mut received: u64 = 0;
        let mut trailers: Option<HeaderMap> = None;
        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(|e| DownloadError::Transport(e.to_string()))?;
            match frame.into_data() {
                Ok(data) => {
                    if let Some(hasher) = hasher.as_mut() {
                        hasher.update(&data);
                    }
                    dst.write_all(&data).await?;
                    received += data.len() as u64;
                }
                Err(frame) => {
                    if let Ok(map) = frame.into_trailers() {
                        trailers = Some(map);
                    }
                }
            }
        }
        report.end = Utc::now();
        let computed = hasher.map(|h| h.finish_hex());

        // The X-Content-Length trailer must match what we actually read
        let trailers = trailers.unwrap_or_default();
        let reported = trailers
            .get(TRAILER_CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .ok_or(DownloadError::MissingTrailer("X-Content-Length"))?;
        let reported: u64 = reported
            .parse()
            .map_err(|_| DownloadError::MissingTrailer("X-Content-Length"))?;
        if reported != received {
            return Err(DownloadError::LengthMismatch { reported, received });
        }

        let server_checksum = trailers
            .get(TRAILER_CHECKSUM_VALUE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_lowercase());
        if mode == ChecksumMode::Both {
            let received_checksum = server_checksum
                .clone()
                .ok_or(DownloadError::MissingTrailer("X-Checksum-Value"))?;
            let computed_checksum = computed.clone().unwrap_or_default();
            if !computed_checksum.eq_ignore_ascii_case(&received_checksum) {
                return Err(DownloadError::ChecksumMismatch {
                    computed: computed_checksum,
                    received: received_checksum,
                });
            }
        }

        // Report the checksum, preferring the server's value when present
        if mode != ChecksumMode::None {
            let value = server_checksum.or(computed).unwrap_or_default();
            report.checksum = Some(format!("{}:{}", algorithm.name(), value));
        }
        Ok(())
    }
}
