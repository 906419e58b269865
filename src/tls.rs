//! Certificate provisioning for the TLS and QUIC listeners.
//!
//! Certificates come either from PEM files named on the command line or from
//! a cache directory, where a self-signed pair is generated on first use.
//! Alongside the rustls configurations this module computes SPKI pins, the
//! base64 SHA-256 of each certificate's SubjectPublicKeyInfo, published at
//! `/api/spki` so browser clients can trust the self-signed certificate.

use crate::{Error, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use log::info;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{BufReader, Write};
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use x509_parser::prelude::{FromDer, X509Certificate};

pub const CERT_FILE: &str = "cert.pem";
pub const KEY_FILE: &str = "key.pem";

/// Names the generated certificate is valid for.
pub const GENERATED_NAMES: &[&str] = &["localhost", "127.0.0.1", "::1"];

/// A certificate chain with its private key.
#[derive(Debug)]
pub struct CertificateMaterial {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
    /// SPKI pins of every certificate in the chain, leaf first
    pub spki: Vec<String>,
}

/// Base64 SHA-256 digest of a DER `SubjectPublicKeyInfo`.
///
/// # Examples
///
/// ```
/// let pin = tcpscope::tls::spki_fingerprint(b"");
/// assert_eq!(pin, "47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU=");
/// ```
pub fn spki_fingerprint(spki_der: &[u8]) -> String {
    STANDARD.encode(Sha256::digest(spki_der))
}

/// SPKI pins of every certificate in `chain`, in chain order.
///
/// # Errors
///
/// Fails if a certificate is not valid X.509 DER.
pub fn spki_pins(chain: &[CertificateDer<'_>]) -> Result<Vec<String>> {
    chain
        .iter()
        .map(|der| {
            let (_, cert) = X509Certificate::from_der(der.as_ref())
                .map_err(|e| Error::Tls(format!("parsing certificate: {}", e)))?;
            Ok(spki_fingerprint(cert.public_key().raw))
        })
        .collect()
}

/// Loads a PEM certificate chain and private key.
pub fn load_pem(cert_path: &Path, key_path: &Path) -> Result<CertificateMaterial> {
    let cert_pem = fs::read(cert_path)
        .map_err(|e| Error::Tls(format!("reading {}: {}", cert_path.display(), e)))?;
    let key_pem = fs::read(key_path)
        .map_err(|e| Error::Tls(format!("reading {}: {}", key_path.display(), e)))?;

    let cert_chain = rustls_pemfile::certs(&mut BufReader::new(cert_pem.as_slice()))
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| Error::Tls(format!("parsing {}: {}", cert_path.display(), e)))?;
    if cert_chain.is_empty() {
        return Err(Error::Tls(format!(
            "no certificate found in {}",
            cert_path.display()
        )));
    }

    let key = rustls_pemfile::private_key(&mut BufReader::new(key_pem.as_slice()))
        .map_err(|e| Error::Tls(format!("parsing {}: {}", key_path.display(), e)))?
        .ok_or_else(|| Error::Tls(format!("no private key found in {}", key_path.display())))?;

    let spki = spki_pins(&cert_chain)?;
    Ok(CertificateMaterial {
        cert_chain,
        key,
        spki,
    })
}

/// Loads `cert.pem` and `key.pem` from `cache_dir`, generating a self-signed
/// pair first if either is missing.
pub fn load_or_generate(cache_dir: &Path) -> Result<CertificateMaterial> {
    let cert_path = cache_dir.join(CERT_FILE);
    let key_path = cache_dir.join(KEY_FILE);

    if cert_path.exists() && key_path.exists() {
        info!("Using cached certificate in {}", cache_dir.display());
        return load_pem(&cert_path, &key_path);
    }

    let names: Vec<String> = GENERATED_NAMES.iter().map(|s| s.to_string()).collect();
    let generated = rcgen::generate_simple_self_signed(names)?;

    fs::create_dir_all(cache_dir)?;
    write_file(&cert_path, generated.cert.pem().as_bytes(), false)?;
    write_file(&key_path, generated.key_pair.serialize_pem().as_bytes(), true)?;
    info!(
        "Generated self-signed certificate in {}",
        cache_dir.display()
    );

    load_pem(&cert_path, &key_path)
}

fn write_file(path: &Path, contents: &[u8], private: bool) -> Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);

    #[cfg(unix)]
    if private {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    #[cfg(not(unix))]
    let _ = private;

    let mut file = options.open(path)?;
    file.write_all(contents)?;
    Ok(())
}

/// Builds a TLS acceptor serving `material` over HTTP/1.1.
pub fn acceptor(material: &CertificateMaterial) -> Result<TlsAcceptor> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(material.cert_chain.clone(), material.key.clone_key())?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Builds a QUIC endpoint configuration serving `material` over HTTP/3.
pub fn quic_server_config(material: &CertificateMaterial) -> Result<quinn::ServerConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_no_client_auth()
        .with_single_cert(material.cert_chain.clone(), material.key.clone_key())?;
    config.alpn_protocols = vec![b"h3".to_vec()];

    let crypto = quinn::crypto::rustls::QuicServerConfig::try_from(config)
        .map_err(|e| Error::Quic(format!("QUIC TLS configuration: {}", e)))?;
    Ok(quinn::ServerConfig::with_crypto(Arc::new(crypto)))
}
