//! TLS credential wrappers and endpoint options.
//!
//! Thin shims over rustls + quinn-proto crypto config: the library never
//! inspects certificates itself, it only plumbs pre-built configurations
//! into the QUIC engine.

use std::sync::Arc;

use quinn_proto::crypto::rustls::QuicClientConfig;
use rustls::RootCertStore;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::error::Error;

/// Server-side TLS credentials for [`Endpoint::listen`](crate::Endpoint::listen).
#[derive(Clone)]
pub struct ServerTls {
    pub(crate) config: Arc<quinn_proto::ServerConfig>,
}

impl ServerTls {
    /// Build from a certificate chain and private key.
    pub fn from_single_cert(
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Self, Error> {
        let config = quinn_proto::ServerConfig::with_single_cert(certs, key)
            .map_err(|e| Error::Tls(e.to_string()))?;
        Ok(ServerTls {
            config: Arc::new(config),
        })
    }

    /// Use a pre-built quinn server config (custom transport parameters,
    /// client certificate verification, etc.).
    pub fn from_config(config: Arc<quinn_proto::ServerConfig>) -> Self {
        ServerTls { config }
    }
}

/// Client-side TLS credentials for [`Endpoint::connect`](crate::Endpoint::connect).
#[derive(Clone)]
pub struct ClientTls {
    pub(crate) config: quinn_proto::ClientConfig,
}

impl ClientTls {
    /// Trust the given root certificates.
    pub fn with_roots(roots: RootCertStore) -> Result<Self, Error> {
        let crypto = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let crypto = QuicClientConfig::try_from(crypto).map_err(|e| Error::Tls(e.to_string()))?;
        Ok(ClientTls {
            config: quinn_proto::ClientConfig::new(Arc::new(crypto)),
        })
    }

    /// Trust exactly the given certificates (e.g. a self-signed peer).
    pub fn trusting(certs: &[CertificateDer<'static>]) -> Result<Self, Error> {
        let mut roots = RootCertStore::empty();
        for cert in certs {
            roots
                .add(cert.clone())
                .map_err(|e| Error::Tls(e.to_string()))?;
        }
        Self::with_roots(roots)
    }

    /// Use a pre-built quinn client config.
    pub fn from_config(config: quinn_proto::ClientConfig) -> Self {
        ClientTls { config }
    }
}

/// Options for [`Network::endpoint`](crate::Network::endpoint).
#[derive(Clone)]
pub struct EndpointOptions {
    /// Maximum queued outgoing packets before dropping. Default: 4096.
    pub send_queue_capacity: usize,
    /// Allow path MTU discovery. Default: true.
    pub allow_mtud: bool,
    /// Deterministic RNG seed for testing. Default: `None` (random).
    pub rng_seed: Option<[u8; 32]>,
}

impl Default for EndpointOptions {
    fn default() -> Self {
        EndpointOptions {
            send_queue_capacity: 4096,
            allow_mtud: true,
            rng_seed: None,
        }
    }
}
