//! The connection pool core and the response-stream wrapper.
//!
//! The pool owns an origin→connections mapping behind a single mutex. Every
//! mutation of the mapping, and every pool-driven state transition of a
//! member, happens under that lock. Anything that can block on the network
//! (connection creation, the exchange itself, closing a connection) happens
//! outside it.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, Method, StatusCode, Version};
use url::Url;

use crate::body::{ByteStream, RequestBody};
use crate::config::{default_tls_config, ProtocolPreference, TimeoutConfig};
use crate::connection::{
    lock, Connection, ConnectionFactory, ConnectionState, Request, ResponseHead, TransportFactory,
};
use crate::error::Result;
use crate::origin::Origin;

/// A connection pool for issuing HTTP requests.
///
/// Connections are pooled per origin and reused once their previous response
/// body has been closed. Idle connections whose peer has silently gone away
/// are detected and discarded on the next acquisition for their origin.
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

struct PoolShared {
    factory: Arc<dyn ConnectionFactory>,
    /// Guards the mapping and every pool-driven state transition.
    connections: Mutex<HashMap<Origin, Vec<Arc<dyn Connection>>>>,
}

impl ConnectionPool {
    /// A pool with native TLS roots and the single-stream connection variant.
    pub fn new() -> Result<Self> {
        Ok(Self::with_config(
            default_tls_config()?,
            ProtocolPreference::default(),
        ))
    }

    /// A pool with an explicit TLS configuration and protocol preference.
    #[must_use]
    pub fn with_config(tls: Arc<rustls::ClientConfig>, preference: ProtocolPreference) -> Self {
        Self::with_factory(Arc::new(TransportFactory::new(tls, preference)))
    }

    /// A pool over a caller-provided connection factory.
    #[must_use]
    pub fn with_factory(factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                factory,
                connections: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Issue a request, reusing an idle pooled connection for the URL's
    /// origin when one exists and creating one when none does.
    ///
    /// Failures from connection creation or from the exchange itself
    /// propagate unmodified; the pool performs no retries.
    pub fn request(
        &self,
        method: Method,
        url: Url,
        headers: HeaderMap,
        body: RequestBody,
        timeout: TimeoutConfig,
    ) -> Result<Response> {
        let origin = Origin::from_url(&url)?;

        let connection = match self.shared.acquire(&origin) {
            Some(connection) => {
                tracing::debug!(target: "wirepool::pool", origin = %origin, "reusing pooled connection");
                connection
            }
            None => {
                // Creation happens outside the lock. The factory returns the
                // connection already Active, so it is never up for grabs in
                // the window between insertion and the exchange below.
                let connection = self.shared.factory.connect(&origin, &timeout)?;
                let mut map = lock(&self.shared.connections);
                map.entry(origin.clone()).or_default().push(connection.clone());
                drop(map);
                tracing::debug!(target: "wirepool::pool", origin = %origin, "created connection");
                connection
            }
        };

        let request = Request {
            method,
            url,
            headers,
            body,
            timeout,
        };
        let (head, stream) = connection.clone().request(request)?;
        let body = ResponseBody {
            stream,
            connection,
            pool: Arc::downgrade(&self.shared),
            closed: false,
        };
        Ok(Response { head, body })
    }

    /// Close every pooled connection and empty the mapping.
    ///
    /// Intended for full shutdown. Calling it twice is safe: the second call
    /// finds an empty mapping and closes nothing.
    pub fn close(&self) {
        self.shared.close();
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let map = lock(&self.shared.connections);
        f.debug_struct("ConnectionPool")
            .field("origins", &map.len())
            .finish()
    }
}

impl PoolShared {
    /// Acquire an idle, live connection for `origin`, or `None`.
    ///
    /// One pass over the origin's set under the lock: dead idle members are
    /// unlinked for closing, Closed leftovers are pruned, Active members are
    /// untouched. Among the surviving idle members the last one encountered
    /// (the most recently inserted) becomes the candidate, and is flipped to
    /// Active before the lock drops so no concurrent acquirer can take it.
    fn acquire(&self, origin: &Origin) -> Option<Arc<dyn Connection>> {
        let mut reuse = None;
        let mut dead = Vec::new();
        {
            let mut map = lock(&self.connections);
            if let Some(members) = map.get_mut(origin) {
                members.retain(|connection| match connection.state() {
                    ConnectionState::Idle => {
                        if connection.is_dropped() {
                            dead.push(connection.clone());
                            false
                        } else {
                            reuse = Some(connection.clone());
                            true
                        }
                    }
                    ConnectionState::Active => true,
                    ConnectionState::Closed => false,
                });
                if members.is_empty() {
                    map.remove(origin);
                }
            }
            if let Some(connection) = &reuse {
                connection.set_state(ConnectionState::Active);
            }
        }

        // Tear dead connections down outside the lock; best effort, the
        // caller was never handed any of these.
        for connection in dead {
            tracing::debug!(target: "wirepool::pool", origin = %origin, "discarding dropped connection");
            if let Err(err) = connection.close() {
                tracing::debug!(
                    target: "wirepool::pool",
                    origin = %origin,
                    error = %err,
                    "error closing dropped connection"
                );
            }
        }

        reuse
    }

    /// The response stream for `connection` has been closed by the caller.
    ///
    /// A connection the engine left Closed is unlinked here; one returned to
    /// Idle stays put, eligible for the next acquisition.
    fn response_closed(&self, connection: &Arc<dyn Connection>) {
        let mut map = lock(&self.connections);
        if connection.state() != ConnectionState::Closed {
            return;
        }
        let origin = connection.origin().clone();
        if let Some(members) = map.get_mut(&origin) {
            members.retain(|member| !Arc::ptr_eq(member, connection));
            if members.is_empty() {
                map.remove(&origin);
            }
        }
    }

    fn close(&self) {
        let drained: Vec<Arc<dyn Connection>> = {
            let mut map = lock(&self.connections);
            map.drain().flat_map(|(_, members)| members).collect()
        };
        for connection in &drained {
            if let Err(err) = connection.close() {
                tracing::debug!(
                    target: "wirepool::pool",
                    origin = %connection.origin(),
                    error = %err,
                    "error closing pooled connection"
                );
            }
        }
        if !drained.is_empty() {
            tracing::debug!(target: "wirepool::pool", count = drained.len(), "pool closed");
        }
    }
}

/// A complete response: head plus the pooled body stream.
pub struct Response {
    head: ResponseHead,
    body: ResponseBody,
}

impl Response {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.head.status
    }

    #[must_use]
    pub fn version(&self) -> Version {
        self.head.version
    }

    /// Reason phrase as sent by the peer, when the protocol carries one.
    #[must_use]
    pub fn reason(&self) -> Option<&[u8]> {
        self.head.reason.as_deref()
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    pub fn body_mut(&mut self) -> &mut ResponseBody {
        &mut self.body
    }

    #[must_use]
    pub fn into_body(self) -> ResponseBody {
        self.body
    }

    #[must_use]
    pub fn into_parts(self) -> (ResponseHead, ResponseBody) {
        (self.head, self.body)
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.head.status)
            .field("version", &self.head.version)
            .finish()
    }
}

/// The response stream handed to callers.
///
/// Wraps the engine-level stream so that closing it first finalizes the
/// protocol exchange (the engine's hook to decide whether the connection
/// survives) and then reports back to the pool. The close is one-shot: the
/// second and later calls are no-ops.
pub struct ResponseBody {
    stream: Box<dyn ByteStream>,
    connection: Arc<dyn Connection>,
    pool: Weak<PoolShared>,
    closed: bool,
}

impl ResponseBody {
    /// Pull the next chunk, forwarded unchanged from the engine stream.
    pub fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        if self.closed {
            return Ok(None);
        }
        self.stream.next_chunk()
    }

    /// Close the underlying stream, then hand the connection back to the
    /// pool.
    ///
    /// The pool is informed even when the underlying close fails; that
    /// failure is returned afterwards.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let result = self.stream.close();
        if let Some(pool) = self.pool.upgrade() {
            pool.response_closed(&self.connection);
        }
        result
    }

    /// Drain the remaining chunks, close the stream, and return everything
    /// read.
    pub fn bytes(&mut self) -> Result<Bytes> {
        let mut collected = BytesMut::new();
        loop {
            match self.next_chunk() {
                Ok(Some(chunk)) => collected.extend_from_slice(&chunk),
                Ok(None) => break,
                Err(err) => {
                    let _ = self.close();
                    return Err(err);
                }
            }
        }
        self.close()?;
        Ok(collected.freeze())
    }
}

impl ByteStream for ResponseBody {
    fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        ResponseBody::next_chunk(self)
    }

    fn close(&mut self) -> Result<()> {
        ResponseBody::close(self)
    }
}

impl Iterator for ResponseBody {
    type Item = Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        ResponseBody::next_chunk(self).transpose()
    }
}

impl Drop for ResponseBody {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(err) = self.close() {
                tracing::debug!(
                    target: "wirepool::pool",
                    error = %err,
                    "error closing abandoned response stream"
                );
            }
        }
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseBody")
            .field("closed", &self.closed)
            .finish()
    }
}
