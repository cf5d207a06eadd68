//! Multiplexed HTTP/2 connection engine.
//!
//! A synchronous facade over `h2::client`. Each connection owns a
//! single-worker tokio runtime; the h2 connection task runs on it and records
//! its termination in an atomic flag, which doubles as the liveness probe.
//! Callers block on the runtime for the handshake, each exchange, and each
//! body chunk.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::poll_fn;
use h2::client::SendRequest;
use http::header::{CONNECTION, HOST, TRANSFER_ENCODING};
use http::Version;
use rustls::ClientConfig;
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;

use super::{lock, Connection, ConnectionState, Request, ResponseHead};
use crate::body::{ByteStream, RequestBody};
use crate::config::TimeoutConfig;
use crate::error::{self, Result};
use crate::origin::Origin;

/// A multiplexed HTTP/2 connection.
pub struct Http2Connection {
    origin: Origin,
    state: Mutex<ConnectionState>,
    send: Mutex<SendRequest<Bytes>>,
    runtime: Runtime,
    driver: Mutex<Option<JoinHandle<()>>>,
    /// Set once the connection task finishes, for whatever reason.
    broken: Arc<AtomicBool>,
    /// Streams whose response bodies are still open.
    open_streams: AtomicUsize,
}

impl Http2Connection {
    /// Open a connection to `origin` and perform the h2 handshake.
    ///
    /// https origins negotiate `h2` over ALPN; plain-text origins use prior
    /// knowledge.
    pub fn connect(
        origin: Origin,
        tls: Arc<ClientConfig>,
        timeout: &TimeoutConfig,
    ) -> Result<Arc<Self>> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("wirepool-h2")
            .enable_io()
            .enable_time()
            .build()
            .map_err(error::connect)?;
        let broken = Arc::new(AtomicBool::new(false));

        let (send, driver) =
            runtime.block_on(handshake(&origin, tls, timeout.connect, broken.clone()))?;

        tracing::debug!(target: "wirepool::http2", origin = %origin, "connection established");
        Ok(Arc::new(Self {
            origin,
            state: Mutex::new(ConnectionState::Active),
            send: Mutex::new(send),
            runtime,
            driver: Mutex::new(Some(driver)),
            broken,
            open_streams: AtomicUsize::new(0),
        }))
    }

    /// One response body has been closed; decide whether the connection goes
    /// back to the idle pool.
    fn response_closed(&self) -> Result<()> {
        let remaining = self
            .open_streams
            .fetch_sub(1, Ordering::SeqCst)
            .saturating_sub(1);
        if self.broken.load(Ordering::SeqCst) {
            self.close()
        } else if remaining == 0 {
            self.set_state(ConnectionState::Idle);
            Ok(())
        } else {
            Ok(())
        }
    }
}

impl Connection for Http2Connection {
    fn origin(&self) -> &Origin {
        &self.origin
    }

    fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    fn set_state(&self, state: ConnectionState) {
        *lock(&self.state) = state;
    }

    fn is_dropped(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    fn request(self: Arc<Self>, request: Request) -> Result<(ResponseHead, Box<dyn ByteStream>)> {
        let send = lock(&self.send).clone();
        let read_timeout = request.timeout.read;
        match self.runtime.block_on(exchange(send, request)) {
            Ok((head, recv)) => {
                self.open_streams.fetch_add(1, Ordering::SeqCst);
                let body = Http2Body {
                    conn: self.clone(),
                    recv,
                    read_timeout,
                    closed: false,
                };
                Ok((head, Box::new(body)))
            }
            Err(err) => {
                // Stream-level failures leave the connection usable; only a
                // dead transport takes it down.
                if self.broken.load(Ordering::SeqCst) {
                    if let Err(close_err) = self.close() {
                        tracing::debug!(
                            target: "wirepool::http2",
                            origin = %self.origin,
                            error = %close_err,
                            "error closing broken connection"
                        );
                    }
                }
                Err(err)
            }
        }
    }

    fn close(&self) -> Result<()> {
        self.set_state(ConnectionState::Closed);
        self.broken.store(true, Ordering::SeqCst);
        if let Some(driver) = lock(&self.driver).take() {
            driver.abort();
            tracing::debug!(target: "wirepool::http2", origin = %self.origin, "connection closed");
        }
        Ok(())
    }
}

async fn handshake(
    origin: &Origin,
    tls: Arc<ClientConfig>,
    connect_timeout: Option<Duration>,
    broken: Arc<AtomicBool>,
) -> Result<(SendRequest<Bytes>, JoinHandle<()>)> {
    let attempt = async {
        let tcp = tokio::net::TcpStream::connect((origin.host(), origin.port()))
            .await
            .map_err(error::connect)?;
        let _ = tcp.set_nodelay(true);

        if origin.scheme().is_https() {
            let name = rustls::pki_types::ServerName::try_from(origin.host().to_string())
                .map_err(error::connect)?;
            let connector = tokio_rustls::TlsConnector::from(tls);
            let io = connector.connect(name, tcp).await.map_err(error::connect)?;
            let (send, connection) = h2::client::handshake(io).await.map_err(error::connect)?;
            Ok((send, tokio::spawn(drive(connection, broken.clone()))))
        } else {
            let (send, connection) = h2::client::handshake(tcp).await.map_err(error::connect)?;
            Ok((send, tokio::spawn(drive(connection, broken.clone()))))
        }
    };

    match connect_timeout {
        Some(limit) => tokio::time::timeout(limit, attempt)
            .await
            .map_err(error::connect)?,
        None => attempt.await,
    }
}

async fn drive<T>(connection: h2::client::Connection<T, Bytes>, broken: Arc<AtomicBool>)
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    if let Err(err) = connection.await {
        tracing::debug!(target: "wirepool::http2", error = %err, "connection task failed");
    }
    broken.store(true, Ordering::SeqCst);
}

async fn exchange(
    send: SendRequest<Bytes>,
    request: Request,
) -> Result<(ResponseHead, h2::RecvStream)> {
    let mut send = send.ready().await.map_err(error::request)?;

    let uri: http::Uri = request.url.as_str().parse().map_err(error::request)?;
    let mut req = http::Request::new(());
    *req.method_mut() = request.method;
    *req.uri_mut() = uri;
    *req.version_mut() = Version::HTTP_2;
    *req.headers_mut() = request.headers;
    // Connection-level headers have no place on a multiplexed stream.
    req.headers_mut().remove(HOST);
    req.headers_mut().remove(CONNECTION);
    req.headers_mut().remove(TRANSFER_ENCODING);

    let read_timeout = request.timeout.read;
    let end_of_stream = request.body.is_empty();
    let (response, mut outbound) = send.send_request(req, end_of_stream).map_err(error::request)?;

    match request.body {
        RequestBody::Empty => {}
        RequestBody::Full(bytes) => {
            outbound.reserve_capacity(bytes.len());
            outbound.send_data(bytes, true).map_err(error::request)?;
        }
        RequestBody::Stream(mut stream) => {
            while let Some(chunk) = stream.next_chunk()? {
                if chunk.is_empty() {
                    continue;
                }
                outbound.reserve_capacity(chunk.len());
                outbound.send_data(chunk, false).map_err(error::request)?;
            }
            outbound
                .send_data(Bytes::new(), true)
                .map_err(error::request)?;
            stream.close()?;
        }
    }

    let response = match read_timeout {
        Some(limit) => tokio::time::timeout(limit, response)
            .await
            .map_err(error::request)?
            .map_err(error::request)?,
        None => response.await.map_err(error::request)?,
    };
    let (parts, recv) = response.into_parts();
    Ok((
        ResponseHead {
            status: parts.status,
            version: Version::HTTP_2,
            reason: None,
            headers: parts.headers,
        },
        recv,
    ))
}

/// The raw response body stream for one multiplexed exchange.
struct Http2Body {
    conn: Arc<Http2Connection>,
    recv: h2::RecvStream,
    read_timeout: Option<Duration>,
    closed: bool,
}

impl ByteStream for Http2Body {
    fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        if self.closed {
            return Ok(None);
        }
        let read_timeout = self.read_timeout;
        let recv = &mut self.recv;
        let next: Result<Option<Bytes>> = self.conn.runtime.block_on(async {
            let data = poll_fn(|cx| recv.poll_data(cx));
            let next = match read_timeout {
                Some(limit) => tokio::time::timeout(limit, data)
                    .await
                    .map_err(error::body)?,
                None => data.await,
            };
            match next {
                Some(Ok(bytes)) => Ok(Some(bytes)),
                Some(Err(err)) => Err(error::body(err)),
                None => Ok(None),
            }
        });
        let next = next?;
        if let Some(ref bytes) = next {
            let _ = self.recv.flow_control().release_capacity(bytes.len());
        }
        Ok(next)
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        // Dropping the receive half resets an unfinished stream; the
        // connection itself stays healthy either way.
        self.conn.response_closed()
    }
}
