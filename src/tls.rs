//! TLS configuration material for the data plane.
//!
//! The server terminates TLS 1.2+ restricted to AES-GCM cipher suites with
//! ECDHE key exchange on P-256, and verifies a client certificate when one
//! is presented (optional mTLS). The client trusts the CA bundle it is
//! given and may present its own certificate/key pair.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::crypto::{aws_lc_rs, CryptoProvider};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cert and key files must both be provided or both be omitted")]
    CertKeyMismatch,

    #[error("error reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),

    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("no usable CA certificates in {0}")]
    EmptyCaBundle(PathBuf),

    #[error("TLS configuration: {0}")]
    Tls(#[from] rustls::Error),

    #[error("client certificate verifier: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),
}

/// Crypto provider restricted to the suites the transfer protocol allows:
/// AES-GCM only, ECDHE key exchange, P-256.
fn restricted_provider() -> CryptoProvider {
    CryptoProvider {
        cipher_suites: vec![
            aws_lc_rs::cipher_suite::TLS13_AES_256_GCM_SHA384,
            aws_lc_rs::cipher_suite::TLS13_AES_128_GCM_SHA256,
            aws_lc_rs::cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
            aws_lc_rs::cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
            aws_lc_rs::cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
            aws_lc_rs::cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
        ],
        kx_groups: vec![aws_lc_rs::kx_group::SECP256R1],
        ..aws_lc_rs::default_provider()
    }
}

pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let file = File::open(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<_, _>>()
        .map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(ConfigError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ConfigError> {
    let file = File::open(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| ConfigError::NoPrivateKey(path.to_path_buf()))
}

pub fn load_root_store(path: &Path) -> Result<RootCertStore, ConfigError> {
    let mut store = RootCertStore::empty();
    for cert in load_certs(path)? {
        if store.add(cert).is_err() {
            // Skip unparseable entries; the emptiness check below catches
            // a bundle with nothing usable in it.
            continue;
        }
    }
    if store.is_empty() {
        return Err(ConfigError::EmptyCaBundle(path.to_path_buf()));
    }
    Ok(store)
}

/// Build the file server's TLS configuration. Clients with certificates
/// issued by one of the authorities in `ca` are authenticated; clients
/// without a certificate are admitted as anonymous.
pub fn server_config(cert: &Path, key: &Path, ca: &Path) -> Result<ServerConfig, ConfigError> {
    let provider = Arc::new(restricted_provider());
    let roots = Arc::new(load_root_store(ca)?);
    let verifier = WebPkiClientVerifier::builder_with_provider(roots, provider.clone())
        .allow_unauthenticated()
        .build()?;
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(rustls::DEFAULT_VERSIONS)?
        .with_client_cert_verifier(verifier)
        .with_single_cert(load_certs(cert)?, load_private_key(key)?)?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}

/// Build the download client's TLS configuration. `cert` and `key` must be
/// both present (mTLS) or both absent (anonymous client).
pub fn client_config(
    cert: Option<&Path>,
    key: Option<&Path>,
    ca: &Path,
) -> Result<ClientConfig, ConfigError> {
    let provider = Arc::new(aws_lc_rs::default_provider());
    let builder = ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(rustls::DEFAULT_VERSIONS)?
        .with_root_certificates(load_root_store(ca)?);
    match (cert, key) {
        (Some(cert), Some(key)) => {
            Ok(builder.with_client_auth_cert(load_certs(cert)?, load_private_key(key)?)?)
        }
        (None, None) => Ok(builder.with_no_client_auth()),
        _ => Err(ConfigError::CertKeyMismatch),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn self_signed() -> (String, String) {
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = rcgen::CertificateParams::new(vec!["localhost".to_string()])
            .unwrap()
            .self_signed(&key)
            .unwrap();
        (cert.pem(), key.serialize_pem())
    }

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn client_config_rejects_cert_without_key() {
        let (cert_pem, _) = self_signed();
        let ca = write_temp(&cert_pem);
        let cert = write_temp(&cert_pem);
        let err = client_config(Some(cert.path()), None, ca.path()).unwrap_err();
        assert!(matches!(err, ConfigError::CertKeyMismatch));
    }

    #[test]
    fn client_config_without_client_cert() {
        let (cert_pem, _) = self_signed();
        let ca = write_temp(&cert_pem);
        assert!(client_config(None, None, ca.path()).is_ok());
    }

    #[test]
    fn server_config_loads_material() {
        let (cert_pem, key_pem) = self_signed();
        let ca = write_temp(&cert_pem);
        let cert = write_temp(&cert_pem);
        let key = write_temp(&key_pem);
        let config = server_config(cert.path(), key.path(), ca.path()).unwrap();
        assert!(config.alpn_protocols.contains(&b"h2".to_vec()));
    }

    #[test]
    fn missing_ca_file_is_an_error() {
        let err = client_config(None, None, Path::new("/nonexistent/ca.pem")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn empty_ca_bundle_is_an_error() {
        let ca = write_temp("");
        let err = client_config(None, None, ca.path()).unwrap_err();
        assert!(matches!(err, ConfigError::NoCertificates(_)));
    }
}
