//! The connection abstraction the pool manages.
//!
//! A connection is an opaque, stateful engine bound to one origin. The pool
//! only ever talks to the [`Connection`] trait; the single-stream and
//! multiplexed variants implement the same surface and are chosen once, at
//! creation time, by the [`ConnectionFactory`].

pub mod http1;
pub mod http2;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Version};
use url::Url;

use crate::body::{ByteStream, RequestBody};
use crate::config::{ProtocolPreference, TimeoutConfig};
use crate::error::Result;
use crate::origin::Origin;

/// Lock a mutex, recovering the guard from a poisoned lock.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Lifecycle state of a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not serving a request; eligible for reuse.
    Idle,
    /// Serving a request, or its response body is still open.
    Active,
    /// Terminally unusable. Never reused; pruned from the pool mapping.
    Closed,
}

/// A single outgoing exchange, as handed to a connection.
#[derive(Debug)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: RequestBody,
    pub timeout: TimeoutConfig,
}

/// Everything about a response except its body.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub version: Version,
    /// Reason phrase as sent by the peer. Multiplexed connections carry none.
    pub reason: Option<Bytes>,
    pub headers: HeaderMap,
}

/// Capability surface the pool requires of a connection variant.
pub trait Connection: Send + Sync {
    /// The origin this connection is bound to; fixed for its lifetime.
    fn origin(&self) -> &Origin;

    /// Current lifecycle state.
    fn state(&self) -> ConnectionState;

    /// Overwrite the lifecycle state.
    ///
    /// The pool owns the Idle→Active transition on acquisition; the engine
    /// owns the post-response Active→Idle / Active→Closed decision.
    fn set_state(&self, state: ConnectionState);

    /// Non-blocking probe: has the peer torn this connection down while it
    /// sat idle?
    fn is_dropped(&self) -> bool;

    /// Issue a request, returning the response head and its raw body stream.
    fn request(self: Arc<Self>, request: Request) -> Result<(ResponseHead, Box<dyn ByteStream>)>;

    /// Release the underlying transport resources. Idempotent.
    fn close(&self) -> Result<()>;
}

/// Creates connections bound to an origin.
pub trait ConnectionFactory: Send + Sync {
    /// Establish a new connection to `origin`.
    ///
    /// The connection is returned in the Active state so it cannot be handed
    /// to a concurrent acquirer before its creator has used it.
    fn connect(&self, origin: &Origin, timeout: &TimeoutConfig) -> Result<Arc<dyn Connection>>;
}

/// Production factory: real sockets, TLS from the pool configuration, and the
/// connection variant chosen by protocol preference.
pub struct TransportFactory {
    tls: Arc<rustls::ClientConfig>,
    preference: ProtocolPreference,
}

impl TransportFactory {
    #[must_use]
    pub fn new(tls: Arc<rustls::ClientConfig>, preference: ProtocolPreference) -> Self {
        // ALPN follows the variant the factory will produce.
        let tls = match preference {
            ProtocolPreference::Http1 => tls,
            ProtocolPreference::Http2 => {
                let mut config = (*tls).clone();
                config.alpn_protocols = vec![b"h2".to_vec()];
                Arc::new(config)
            }
        };
        Self { tls, preference }
    }
}

impl ConnectionFactory for TransportFactory {
    fn connect(&self, origin: &Origin, timeout: &TimeoutConfig) -> Result<Arc<dyn Connection>> {
        let connection: Arc<dyn Connection> = match self.preference {
            ProtocolPreference::Http1 => {
                http1::Http1Connection::connect(origin.clone(), self.tls.clone(), timeout)?
            }
            ProtocolPreference::Http2 => {
                http2::Http2Connection::connect(origin.clone(), self.tls.clone(), timeout)?
            }
        };
        Ok(connection)
    }
}
