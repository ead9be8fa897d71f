// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TLS transport for the MQTT client (feature `tls`).
//!
//! - `ca_cert` set: trust exactly the CAs in that PEM bundle
//! - `ca_cert` unset: trust the bundled Mozilla roots (`webpki-roots`)
//! - `client_cert` + `client_key`: present a client certificate (mTLS)
//! - `insecure`: accept any server certificate (testing only)

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::ClientConfig;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::broker::BrokerError;
use crate::config::TlsConfig;

fn config_error(what: &str, e: impl std::fmt::Display) -> BrokerError {
    BrokerError::Config(format!("{}: {}", what, e))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, BrokerError> {
    let pem = std::fs::read(path).map_err(|e| config_error(&path.display().to_string(), e))?;
    let certs = CertificateDer::pem_slice_iter(&pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| config_error(&path.display().to_string(), e))?;
    if certs.is_empty() {
        return Err(BrokerError::Config(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, BrokerError> {
    let pem = std::fs::read(path).map_err(|e| config_error(&path.display().to_string(), e))?;
    PrivateKeyDer::from_pem_slice(&pem).map_err(|e| config_error(&path.display().to_string(), e))
}

/// Build a connector from the configured TLS material.
pub fn connector(tls: &TlsConfig) -> Result<TlsConnector, BrokerError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| config_error("TLS protocol versions", e))?;

    let builder = if tls.insecure {
        tracing::warn!("mqtt: TLS certificate verification disabled");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
    } else {
        let mut roots = rustls::RootCertStore::empty();
        match &tls.ca_cert {
            Some(path) => {
                for cert in load_certs(path)? {
                    roots
                        .add(cert)
                        .map_err(|e| config_error(&path.display().to_string(), e))?;
                }
            }
            None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
        }
        builder.with_root_certificates(roots)
    };

    let config = match (&tls.client_cert, &tls.client_key) {
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(load_certs(cert)?, load_key(key)?)
            .map_err(|e| config_error("client certificate", e))?,
        _ => builder.with_no_client_auth(),
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Run the TLS handshake over an established TCP stream.
pub async fn handshake(
    connector: &TlsConnector,
    host: &str,
    tcp: TcpStream,
) -> Result<TlsStream<TcpStream>, BrokerError> {
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| config_error(&format!("server name {}", host), e))?;
    connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| BrokerError::Refused(format!("TLS handshake with {} failed: {}", host, e)))
}

#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
