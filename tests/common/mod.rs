//! Shared helpers for integration tests: a throwaway PKI (CA, server and
//! client certificates) and in-process server/agent spawners.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use http::header::{HeaderMap, TE};
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Empty};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use rcgen::{BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair};
use tokio::net::TcpListener;

use xferbench::engine::TransportCredentials;
use xferbench::{Agent, FileServer};

/// PEM material for one test run: a CA plus server and client certificates
/// issued by it, written to a temporary directory.
pub struct TestPki {
    _dir: tempfile::TempDir,
    pub ca: PathBuf,
    pub server_cert: PathBuf,
    pub server_key: PathBuf,
    pub client_cert: PathBuf,
    pub client_key: PathBuf,
}

pub fn test_pki() -> TestPki {
    let dir = tempfile::tempdir().unwrap();

    let ca_key = KeyPair::generate().unwrap();
    let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "xferbench tests");
    dn.push(DnType::CommonName, "xferbench test CA");
    ca_params.distinguished_name = dn;
    let ca_cert = ca_params.self_signed(&ca_key).unwrap();

    let server_key = KeyPair::generate().unwrap();
    let mut server_params =
        CertificateParams::new(vec!["localhost".to_string(), "127.0.0.1".to_string()]).unwrap();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "xferbench test server");
    server_params.distinguished_name = dn;
    let server_cert = server_params.signed_by(&server_key, &ca_cert, &ca_key).unwrap();

    let client_key = KeyPair::generate().unwrap();
    let mut client_params = CertificateParams::new(Vec::<String>::new()).unwrap();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "xferbench tests");
    dn.push(DnType::CommonName, "xferbench test client");
    client_params.distinguished_name = dn;
    let client_cert = client_params.signed_by(&client_key, &ca_cert, &ca_key).unwrap();

    let write = |name: &str, contents: String| -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    };
    let ca = write("ca.pem", ca_cert.pem());
    let server_cert_path = write("server-cert.pem", server_cert.pem());
    let server_key_path = write("server-key.pem", server_key.serialize_pem());
    let client_cert_path = write("client-cert.pem", client_cert.pem());
    let client_key_path = write("client-key.pem", client_key.serialize_pem());

    TestPki {
        ca,
        server_cert: server_cert_path,
        server_key: server_key_path,
        client_cert: client_cert_path,
        client_key: client_key_path,
        _dir: dir,
    }
}

/// Start a TLS file server on an ephemeral port, returning its address.
pub async fn spawn_tls_server(pki: &TestPki) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = FileServer::new(
        &addr.to_string(),
        &pki.server_cert,
        &pki.server_key,
        &pki.ca,
    )
    .unwrap();
    tokio::spawn(async move {
        let _ = server.serve_with(listener).await;
    });
    addr
}

/// Start a plaintext file server on an ephemeral port.
pub async fn spawn_plain_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = FileServer::new_plain(&addr.to_string());
    tokio::spawn(async move {
        let _ = server.serve_with(listener).await;
    });
    addr
}

/// Start a client agent on an ephemeral port. The returned handle resolves
/// once the agent has shut down (after `POST /stop`).
pub async fn spawn_agent(
    credentials: TransportCredentials,
) -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let agent = Agent::new(&addr.to_string(), credentials);
    let handle = tokio::spawn(async move {
        let _ = agent.run_with(listener).await;
    });
    (addr, handle)
}

pub fn plain_credentials() -> TransportCredentials {
    TransportCredentials {
        ca: PathBuf::from("unused.pem"),
        cert: None,
        key: None,
    }
}

/// A bare HTTPS client trusting the test CA, used to probe the server's
/// wire behavior independently of `FileClient`.
pub fn raw_https_client(
    ca: &Path,
    http1: bool,
) -> Client<HttpsConnector<HttpConnector>, Empty<Bytes>> {
    let tls = xferbench::tls::client_config(None, None, ca).unwrap();
    let builder = HttpsConnectorBuilder::new()
        .with_tls_config(tls)
        .https_or_http();
    let connector = if http1 {
        builder.enable_http1().build()
    } else {
        builder.enable_http2().build()
    };
    let mut client = Client::builder(TokioExecutor::new());
    if !http1 {
        client.http2_only(true);
    }
    client.build(connector)
}

/// One observed exchange: status, response headers, full body, trailers.
pub struct Exchange {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub trailers: Option<HeaderMap>,
}

pub async fn fetch(
    client: &Client<HttpsConnector<HttpConnector>, Empty<Bytes>>,
    url: &str,
) -> Exchange {
    let request = Request::builder()
        .method(Method::GET)
        .uri(url)
        .header(TE, "trailers")
        .body(Empty::<Bytes>::new())
        .unwrap();
    let response = client.request(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let collected = response.into_body().collect().await.unwrap();
    let trailers = collected.trailers().cloned();
    let body = collected.to_bytes();
    Exchange {
        status,
        headers,
        body,
        trailers,
    }
}
