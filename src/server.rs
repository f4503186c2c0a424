//! File server: answers `GET /file?id=…&size=…[&checksum=…]` by streaming
//! a synthetic payload of the requested length, reporting the body length
//! (and, when asked, the checksum) through HTTP trailers.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, Request, Response, StatusCode};
use http_body::{Body, Frame, SizeHint};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Duration;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use x509_parser::prelude::*;

use crate::checksum::{ChecksumAlgorithm, Hasher};
use crate::payload::payload;
use crate::tls::{self, ConfigError};
use crate::util::parse_size;

pub type ResponseBody = BoxBody<Bytes, Infallible>;

pub const TRAILER_CONTENT_LENGTH: HeaderName = HeaderName::from_static("x-content-length");
pub const TRAILER_CHECKSUM_VALUE: HeaderName = HeaderName::from_static("x-checksum-value");
pub const HEADER_CHECKSUM_ALGORITHM: HeaderName = HeaderName::from_static("x-checksum-algorithm");

/* ------------------------------ Server ------------------------------ */

/// A file server which responds to HTTP GET requests for synthetic files.
pub struct FileServer {
    addr: String,
    tls: Option<Arc<rustls::ServerConfig>>,
}

impl FileServer {
    /// Create a file server that terminates TLS on `addr`, presenting the
    /// certificate in `cert`/`key` and authenticating clients with
    /// certificates issued by the authorities in `ca` (when presented).
    pub fn new(addr: &str, cert: &Path, key: &Path, ca: &Path) -> Result<Self, ConfigError> {
        Ok(Self {
            addr: addr.to_string(),
            tls: Some(Arc::new(tls::server_config(cert, key, ca)?)),
        })
    }

    /// Create a file server speaking plain HTTP on `addr`.
    pub fn new_plain(addr: &str) -> Self {
        Self {
            addr: addr.to_string(),
            tls: None,
        }
    }

    pub async fn serve(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.addr).await?;
        self.serve_with(listener).await
    }

    /// Serve connections accepted from an already-bound listener. Used by
    /// `serve` and by tests that bind to an ephemeral port themselves.
    pub async fn serve_with(&self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(
            "file server listening on {} (tls: {})",
            local_addr,
            self.tls.is_some()
        );
        let acceptor = self.tls.clone().map(TlsAcceptor::from);

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let acceptor = acceptor.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, acceptor).await {
                            debug!("connection from {} ended: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    error!("failed to accept connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: Option<TlsAcceptor>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    match acceptor {
        Some(acceptor) => {
            let stream = acceptor.accept(stream).await?;
            let identity = match stream
                .get_ref()
                .1
                .peer_certificates()
                .and_then(|certs| certs.first())
            {
                Some(der) => ClientIdentity::from_der(der),
                None => ClientIdentity::anonymous(),
            };
            serve_http(TokioIo::new(stream), peer, identity).await
        }
        None => serve_http(TokioIo::new(stream), peer, ClientIdentity::anonymous()).await,
    }
}

async fn serve_http<I>(
    io: TokioIo<I>,
    peer: SocketAddr,
    identity: ClientIdentity,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req| handle_request(req, peer, identity.clone()));
    auto::Builder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
}

/* ------------------------------ Identity ------------------------------ */

/// The caller as seen through its TLS client certificate, if any.
/// Both fields are empty for anonymous (certificate-less) callers.
#[derive(Debug, Clone, Default)]
pub struct ClientIdentity {
    pub subject: String,
    pub issuer: String,
}

impl ClientIdentity {
    pub fn anonymous() -> Self {
        Self::default()
    }

    fn from_der(der: &rustls_pki_types::CertificateDer<'_>) -> Self {
        match parse_x509_certificate(der.as_ref()) {
            Ok((_, cert)) => Self {
                subject: format_dn(cert.subject()),
                issuer: format_dn(cert.issuer()),
            },
            Err(e) => {
                warn!("could not parse client certificate: {}", e);
                Self::anonymous()
            }
        }
    }
}

/// Format a distinguished name as
/// `/C=XX/ST=Province/L=Locality/O=Org/OU=Unit/CN=Common Name`,
/// including only the fields present on the certificate.
fn format_dn(name: &X509Name<'_>) -> String {
    fn append<'a>(
        out: &mut String,
        tag: &str,
        values: impl Iterator<Item = &'a AttributeTypeAndValue<'a>>,
    ) {
        for value in values {
            if let Ok(s) = value.as_str() {
                out.push('/');
                out.push_str(tag);
                out.push('=');
                out.push_str(s);
            }
        }
    }
    let mut out = String::new();
    append(&mut out, "C", name.iter_country());
    append(&mut out, "ST", name.iter_state_or_province());
    append(&mut out, "L", name.iter_locality());
    append(&mut out, "O", name.iter_organization());
    append(&mut out, "OU", name.iter_organizational_unit());
    append(&mut out, "CN", name.iter_common_name());
    out
}

/// Decide whether `subject` (issued by `issuer`) may download the file
/// `file_id` of `size` bytes. Anonymous callers have empty subject/issuer.
/// Currently admits everyone; the signature is stable so a real policy can
/// plug in without protocol changes.
fn is_authorized(_file_id: &str, _size: u64, subject: &str, issuer: &str) -> bool {
    if subject.is_empty() || issuer.is_empty() {
        // Anonymous caller
        return true;
    }
    true
}

/* ------------------------------ Handler ------------------------------ */

pub(crate) async fn handle_request<B>(
    req: Request<B>,
    peer: SocketAddr,
    identity: ClientIdentity,
) -> Result<Response<ResponseBody>, Infallible> {
    let started = Instant::now();
    let method = req.method().clone();
    let uri = req.uri().clone();

    let response = route(&req, &identity);

    info!(
        "{} {} {} -> {} in {:?}",
        peer,
        method,
        uri,
        response.status().as_u16(),
        started.elapsed()
    );
    Ok(response)
}

fn route<B>(req: &Request<B>, identity: &ClientIdentity) -> Response<ResponseBody> {
    if req.uri().path() != "/file" {
        return text_response(StatusCode::NOT_FOUND, "404 page not found");
    }
    if req.method() != Method::GET {
        return text_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
    }

    let query = req.uri().query().unwrap_or("");
    let mut ids: Vec<String> = Vec::new();
    let mut sizes: Vec<String> = Vec::new();
    let mut checksums: Vec<String> = Vec::new();
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "id" => ids.push(value.into_owned()),
            "size" => sizes.push(value.into_owned()),
            "checksum" => checksums.push(value.into_owned()),
            _ => {}
        }
    }

    // Each parameter must appear exactly once (checksum at most once)
    if ids.len() != 1 {
        return text_response(StatusCode::BAD_REQUEST, "Bad Request: no id in query");
    }
    if sizes.len() != 1 {
        return text_response(
            StatusCode::BAD_REQUEST,
            "Bad Request: no file size in query",
        );
    }
    let size = match parse_size(&sizes[0]) {
        Ok(size) => size,
        Err(_) => {
            return text_response(
                StatusCode::BAD_REQUEST,
                format!("Bad Request: invalid size value {:?}", sizes[0]),
            );
        }
    };
    let algorithm = match checksums.len() {
        0 => None,
        1 => match ChecksumAlgorithm::from_name(&checksums[0]) {
            Some(algorithm) => Some(algorithm),
            None => {
                return text_response(
                    StatusCode::BAD_REQUEST,
                    format!("Bad Request: invalid requested checksum {:?}", checksums[0]),
                );
            }
        },
        _ => {
            return text_response(
                StatusCode::BAD_REQUEST,
                "Bad Request: invalid requested checksum",
            );
        }
    };

    if !is_authorized(&ids[0], size, &identity.subject, &identity.issuer) {
        return text_response(
            StatusCode::FORBIDDEN,
            "Forbidden: you are not authorized to retrieve the requested file",
        );
    }

    serve_file(size, algorithm)
}

/// Build the streaming 200 response: payload body of exactly `size` bytes
/// with the length (and checksum, when requested) delivered as trailers.
fn serve_file(size: u64, algorithm: Option<ChecksumAlgorithm>) -> Response<ResponseBody> {
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::TRAILER, "X-Content-Length");
    if let Some(algorithm) = algorithm {
        builder = builder
            .header(header::TRAILER, "X-Checksum-Value")
            .header(HEADER_CHECKSUM_ALGORITHM, algorithm.name());
    }
    let body = PayloadBody::new(size, algorithm.map(|a| a.new_hasher()));
    match builder.body(body.boxed()) {
        Ok(response) => response,
        Err(e) => {
            error!("failed to build file response: {}", e);
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
        }
    }
}

fn text_response(status: StatusCode, message: impl Into<String>) -> Response<ResponseBody> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(message.into())).boxed())
        .expect("static response parts are valid")
}

/* ------------------------------ Body ------------------------------ */

/// Response body that streams `size` bytes out of the shared payload
/// buffer, wrapping at the buffer end, then emits the integrity trailers.
/// Chunks are zero-copy slices of the process-wide buffer.
struct PayloadBody {
    payload: Bytes,
    pos: usize,
    remaining: u64,
    size: u64,
    hasher: Option<Hasher>,
    trailers_sent: bool,
}

impl PayloadBody {
    fn new(size: u64, hasher: Option<Hasher>) -> Self {
        Self {
            payload: payload().clone(),
            pos: 0,
            remaining: size,
            size,
            hasher,
            trailers_sent: false,
        }
    }
}

impl Body for PayloadBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if this.remaining > 0 {
            if this.pos >= this.payload.len() {
                this.pos = 0;
            }
            let available = this.payload.len() - this.pos;
            let count = (this.remaining).min(available as u64) as usize;
            let chunk = this.payload.slice(this.pos..this.pos + count);
            this.pos += count;
            this.remaining -= count as u64;
            if let Some(hasher) = this.hasher.as_mut() {
                hasher.update(&chunk);
            }
            return Poll::Ready(Some(Ok(Frame::data(chunk))));
        }
        if !this.trailers_sent {
            this.trailers_sent = true;
            let mut trailers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(&this.size.to_string()) {
                trailers.insert(TRAILER_CONTENT_LENGTH, value);
            }
            if let Some(hasher) = this.hasher.take() {
                if let Ok(value) = HeaderValue::from_str(&hasher.finish_hex()) {
                    trailers.insert(TRAILER_CHECKSUM_VALUE, value);
                }
            }
            return Poll::Ready(Some(Ok(Frame::trailers(trailers))));
        }
        Poll::Ready(None)
    }

    fn is_end_stream(&self) -> bool {
        self.trailers_sent
    }

    // The default size hint (unknown length) is deliberate: HTTP/1.1
    // must use chunked framing or the trailers are lost.
    fn size_hint(&self) -> SizeHint {
        SizeHint::default()
    }
}
