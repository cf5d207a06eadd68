//! Transport configuration.
//!
//! Timeouts are carried opaquely from the caller down to the connection
//! engines; the pool itself never interprets them.

use std::sync::Arc;
use std::time::Duration;

use rustls::{ClientConfig, RootCertStore};

use crate::error::{self, Result};

/// Which connection variant newly created connections should speak.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProtocolPreference {
    /// One request/response exchange at a time per connection.
    #[default]
    Http1,
    /// Multiplexed exchanges over a single transport.
    Http2,
}

/// Named timeouts handed through to the connection engines.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeoutConfig {
    /// Connection establishment (socket + TLS handshake).
    pub connect: Option<Duration>,
    /// Reading response data.
    pub read: Option<Duration>,
    /// Writing request data.
    pub write: Option<Duration>,
}

impl TimeoutConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connection establishment timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect = Some(timeout);
        self
    }

    /// Set the response read timeout.
    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read = Some(timeout);
        self
    }

    /// Set the request write timeout.
    #[must_use]
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write = Some(timeout);
        self
    }
}

/// Build the default TLS client configuration.
///
/// System certificates are preferred; the bundled webpki roots back them up
/// when the system store cannot be read or turns out empty.
pub fn default_tls_config() -> Result<Arc<ClientConfig>> {
    let mut root_store = RootCertStore::empty();

    let loaded = rustls_native_certs::load_native_certs();
    for cert in loaded.certs {
        if let Err(err) = root_store.add(cert) {
            tracing::warn!(
                target: "wirepool::config",
                error = %err,
                "failed to add system certificate"
            );
        }
    }
    for err in &loaded.errors {
        tracing::warn!(
            target: "wirepool::config",
            error = %err,
            "certificate load error"
        );
    }
    if root_store.is_empty() {
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }
    tracing::debug!(
        target: "wirepool::config",
        roots = root_store.len(),
        "TLS root store initialized"
    );

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(error::builder)?
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(Arc::new(config))
}
