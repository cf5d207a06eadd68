//! Single-stream HTTP/1.1 connection engine.
//!
//! Blocking I/O over a TCP socket, TLS via rustls. One request/response
//! exchange at a time; keep-alive is decided from the response head, and the
//! response body stream reports back whether the connection can return to the
//! idle pool.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, Method, StatusCode, Version};
use rustls::{ClientConfig, ClientConnection, StreamOwned};

use super::{lock, Connection, ConnectionState, Request, ResponseHead};
use crate::body::{ByteStream, RequestBody};
use crate::config::TimeoutConfig;
use crate::error::{self, Result};
use crate::origin::Origin;

const READ_CHUNK: usize = 8 * 1024;
const MAX_HEADERS: usize = 100;
const MAX_HEAD_SIZE: usize = 64 * 1024;
const MAX_CHUNK_LINE: usize = 1024;

enum Transport {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
    Gone,
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(stream) => stream.read(buf),
            Transport::Tls(stream) => stream.read(buf),
            Transport::Gone => Err(closed_io_error()),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(stream) => stream.write(buf),
            Transport::Tls(stream) => stream.write(buf),
            Transport::Gone => Err(closed_io_error()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Plain(stream) => stream.flush(),
            Transport::Tls(stream) => stream.flush(),
            Transport::Gone => Err(closed_io_error()),
        }
    }
}

fn closed_io_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection closed")
}

/// A single-stream HTTP/1.1 connection.
pub struct Http1Connection {
    origin: Origin,
    state: Mutex<ConnectionState>,
    io: Mutex<Transport>,
    /// Cloned socket handle used for the non-blocking liveness probe and for
    /// per-request timeout updates; shares the descriptor with the transport.
    probe: TcpStream,
}

impl Http1Connection {
    /// Open a connection to `origin`, performing the TLS handshake lazily on
    /// first use for https origins.
    pub fn connect(
        origin: Origin,
        tls: Arc<ClientConfig>,
        timeout: &TimeoutConfig,
    ) -> Result<Arc<Self>> {
        let stream = connect_tcp(&origin, timeout)?;
        let _ = stream.set_nodelay(true);
        let probe = stream.try_clone().map_err(error::connect)?;

        let transport = if origin.scheme().is_https() {
            let name = rustls::pki_types::ServerName::try_from(origin.host().to_string())
                .map_err(error::connect)?;
            let session = ClientConnection::new(tls, name).map_err(error::connect)?;
            Transport::Tls(Box::new(StreamOwned::new(session, stream)))
        } else {
            Transport::Plain(stream)
        };

        tracing::debug!(target: "wirepool::http1", origin = %origin, "connection established");
        Ok(Arc::new(Self {
            origin,
            state: Mutex::new(ConnectionState::Active),
            io: Mutex::new(transport),
            probe,
        }))
    }

    fn apply_timeouts(&self, timeout: &TimeoutConfig) -> Result<()> {
        self.probe
            .set_read_timeout(timeout.read)
            .map_err(error::request)?;
        self.probe
            .set_write_timeout(timeout.write)
            .map_err(error::request)?;
        Ok(())
    }

    fn read_io(&self, buf: &mut [u8]) -> Result<usize> {
        let mut io = lock(&self.io);
        io.read(buf).map_err(error::body)
    }

    fn read_response_head(&self) -> Result<(ResponseHead, BytesMut)> {
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        let mut io = lock(&self.io);
        loop {
            let mut parsed_head = None;
            {
                let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
                let mut response = httparse::Response::new(&mut headers);
                match response.parse(&buf[..]) {
                    Ok(httparse::Status::Complete(len)) => {
                        parsed_head = Some((build_head(&response)?, len));
                    }
                    Ok(httparse::Status::Partial) => {}
                    Err(err) => return Err(error::request(err)),
                }
            }
            if let Some((head, len)) = parsed_head {
                let leftover = buf.split_off(len);
                return Ok((head, leftover));
            }
            if buf.len() > MAX_HEAD_SIZE {
                return Err(error::request("response head too large"));
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = io.read(&mut chunk).map_err(error::request)?;
            if n == 0 {
                return Err(error::request("connection closed before response head"));
            }
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn exchange(conn: &Arc<Self>, request: Request) -> Result<(ResponseHead, Box<dyn ByteStream>)> {
        conn.apply_timeouts(&request.timeout)?;
        let head_bytes = encode_request_head(&request, &conn.origin)?;
        {
            let mut io = lock(&conn.io);
            io.write_all(&head_bytes).map_err(error::request)?;
            write_body(&mut io, request.body)?;
            io.flush().map_err(error::request)?;
        }

        let (head, leftover) = conn.read_response_head()?;
        let kind = BodyKind::from_head(&request.method, &head)?;
        let reusable = allows_reuse(&head) && !matches!(kind, BodyKind::Eof);
        let body = Http1Body::new(conn.clone(), kind, leftover, reusable);
        Ok((head, Box::new(body)))
    }
}

impl Connection for Http1Connection {
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
        if matches!(*lock(&self.io), Transport::Gone) {
            return true;
        }
        // An idle connection should have nothing to say. Readable here means
        // either EOF or stray bytes; both make the connection unusable.
        if self.probe.set_nonblocking(true).is_err() {
            return true;
        }
        let mut buf = [0u8; 1];
        let dropped = match self.probe.peek(&mut buf) {
            Ok(_) => true,
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => false,
            Err(_) => true,
        };
        let _ = self.probe.set_nonblocking(false);
        dropped
    }

    fn request(self: Arc<Self>, request: Request) -> Result<(ResponseHead, Box<dyn ByteStream>)> {
        let result = Self::exchange(&self, request);
        if result.is_err() {
            // A failed exchange leaves the stream in an unknown position.
            if let Err(err) = self.close() {
                tracing::debug!(
                    target: "wirepool::http1",
                    origin = %self.origin,
                    error = %err,
                    "error closing connection after failed exchange"
                );
            }
        }
        result
    }

    fn close(&self) -> Result<()> {
        self.set_state(ConnectionState::Closed);
        let mut io = lock(&self.io);
        let transport = std::mem::replace(&mut *io, Transport::Gone);
        let stream = match transport {
            Transport::Plain(stream) => stream,
            Transport::Tls(stream) => stream.sock,
            Transport::Gone => return Ok(()),
        };
        tracing::debug!(target: "wirepool::http1", origin = %self.origin, "connection closed");
        match stream.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(ref err) if err.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(err) => Err(error::close(err)),
        }
    }
}

fn connect_tcp(origin: &Origin, timeout: &TimeoutConfig) -> Result<TcpStream> {
    let addrs = (origin.host(), origin.port())
        .to_socket_addrs()
        .map_err(error::connect)?;
    let mut last_err = None;
    for addr in addrs {
        let attempt = match timeout.connect {
            Some(limit) => TcpStream::connect_timeout(&addr, limit),
            None => TcpStream::connect(addr),
        };
        match attempt {
            Ok(stream) => {
                stream.set_read_timeout(timeout.read).map_err(error::connect)?;
                stream
                    .set_write_timeout(timeout.write)
                    .map_err(error::connect)?;
                return Ok(stream);
            }
            Err(err) => last_err = Some(err),
        }
    }
    Err(match last_err {
        Some(err) => error::connect(err),
        None => error::connect(format!("no addresses resolved for {}", origin.authority())),
    })
}

fn encode_request_head(request: &Request, origin: &Origin) -> Result<Vec<u8>> {
    let url = &request.url;
    let mut target = String::from(url.path());
    if target.is_empty() {
        target.push('/');
    }
    if let Some(query) = url.query() {
        target.push('?');
        target.push_str(query);
    }

    let mut head = Vec::with_capacity(256);
    head.extend_from_slice(request.method.as_str().as_bytes());
    head.push(b' ');
    head.extend_from_slice(target.as_bytes());
    head.extend_from_slice(b" HTTP/1.1\r\n");

    if !request.headers.contains_key(HOST) {
        head.extend_from_slice(b"host: ");
        head.extend_from_slice(origin.host().as_bytes());
        if origin.port() != origin.scheme().default_port() {
            head.extend_from_slice(format!(":{}", origin.port()).as_bytes());
        }
        head.extend_from_slice(b"\r\n");
    }

    for (name, value) in request.headers.iter() {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }

    let has_framing = request.headers.contains_key(CONTENT_LENGTH)
        || request.headers.contains_key(TRANSFER_ENCODING);
    if !has_framing {
        match &request.body {
            RequestBody::Empty => {}
            RequestBody::Full(bytes) => {
                head.extend_from_slice(format!("content-length: {}\r\n", bytes.len()).as_bytes());
            }
            RequestBody::Stream(_) => {
                head.extend_from_slice(b"transfer-encoding: chunked\r\n");
            }
        }
    }

    head.extend_from_slice(b"\r\n");
    Ok(head)
}

fn write_body(io: &mut Transport, body: RequestBody) -> Result<()> {
    match body {
        RequestBody::Empty => Ok(()),
        RequestBody::Full(bytes) => io.write_all(&bytes).map_err(error::request),
        RequestBody::Stream(mut stream) => {
            loop {
                match stream.next_chunk()? {
                    Some(chunk) => {
                        // A zero-length chunk would terminate the encoding.
                        if chunk.is_empty() {
                            continue;
                        }
                        io.write_all(format!("{:x}\r\n", chunk.len()).as_bytes())
                            .map_err(error::request)?;
                        io.write_all(&chunk).map_err(error::request)?;
                        io.write_all(b"\r\n").map_err(error::request)?;
                    }
                    None => break,
                }
            }
            io.write_all(b"0\r\n\r\n").map_err(error::request)?;
            stream.close()
        }
    }
}

fn build_head(response: &httparse::Response<'_, '_>) -> Result<ResponseHead> {
    let code = response
        .code
        .ok_or_else(|| error::request("malformed status line"))?;
    let status = StatusCode::from_u16(code).map_err(error::request)?;
    let version = match response.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };
    let reason = response
        .reason
        .filter(|reason| !reason.is_empty())
        .map(|reason| Bytes::copy_from_slice(reason.as_bytes()));

    let mut headers = HeaderMap::with_capacity(response.headers.len());
    for header in response.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes()).map_err(error::request)?;
        let value = HeaderValue::from_bytes(header.value).map_err(error::request)?;
        headers.append(name, value);
    }

    Ok(ResponseHead {
        status,
        version,
        reason,
        headers,
    })
}

fn connection_has(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|candidate| candidate.trim().eq_ignore_ascii_case(token))
}

fn allows_reuse(head: &ResponseHead) -> bool {
    let connection = head
        .headers
        .get(CONNECTION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    if head.version == Version::HTTP_11 {
        !connection_has(connection, "close")
    } else if head.version == Version::HTTP_10 {
        connection_has(connection, "keep-alive")
    } else {
        false
    }
}

fn parse_chunk_size(line: &[u8]) -> Option<u64> {
    let digits = match line.iter().position(|&b| b == b';') {
        Some(at) => &line[..at],
        None => line,
    };
    let text = std::str::from_utf8(digits).ok()?.trim();
    if text.is_empty() {
        return None;
    }
    u64::from_str_radix(text, 16).ok()
}

/// How the remaining response body is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyKind {
    /// No body bytes follow the head.
    Empty,
    /// Exactly `remaining` more bytes follow.
    Length { remaining: u64 },
    /// Chunked transfer coding.
    Chunked(ChunkState),
    /// Body runs until the peer closes the connection.
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data { remaining: u64 },
    DataEnd,
    Trailers,
    Done,
}

impl BodyKind {
    fn from_head(method: &Method, head: &ResponseHead) -> Result<BodyKind> {
        if *method == Method::HEAD
            || head.status == StatusCode::NO_CONTENT
            || head.status == StatusCode::NOT_MODIFIED
            || head.status.is_informational()
        {
            return Ok(BodyKind::Empty);
        }
        if let Some(value) = head.headers.get(TRANSFER_ENCODING) {
            let text = value.to_str().unwrap_or("");
            if connection_has(text, "chunked") {
                return Ok(BodyKind::Chunked(ChunkState::Size));
            }
            return Ok(BodyKind::Eof);
        }
        if let Some(value) = head.headers.get(CONTENT_LENGTH) {
            let remaining = value
                .to_str()
                .ok()
                .and_then(|text| text.trim().parse::<u64>().ok())
                .ok_or_else(|| error::request("invalid Content-Length"))?;
            return Ok(BodyKind::Length { remaining });
        }
        Ok(BodyKind::Eof)
    }
}

/// The raw response body stream for a single-stream connection.
struct Http1Body {
    conn: Arc<Http1Connection>,
    kind: BodyKind,
    /// Bytes already pulled off the socket past the previous parse point.
    buffer: BytesMut,
    reusable: bool,
    complete: bool,
    closed: bool,
}

impl Http1Body {
    fn new(conn: Arc<Http1Connection>, kind: BodyKind, buffer: BytesMut, reusable: bool) -> Self {
        let complete = matches!(kind, BodyKind::Empty | BodyKind::Length { remaining: 0 });
        Self {
            conn,
            kind,
            buffer,
            reusable,
            complete,
            closed: false,
        }
    }

    fn fill_buffer(&mut self) -> Result<()> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = self.conn.read_io(&mut chunk)?;
        if n == 0 {
            return Err(error::body("connection closed mid-body"));
        }
        self.buffer.extend_from_slice(&chunk[..n]);
        Ok(())
    }

    fn read_line(&mut self) -> Result<Bytes> {
        loop {
            if let Some(at) = self.buffer.iter().position(|&b| b == b'\n') {
                let mut line = self.buffer.split_to(at + 1);
                line.truncate(at);
                if line.last() == Some(&b'\r') {
                    let len = line.len();
                    line.truncate(len - 1);
                }
                return Ok(line.freeze());
            }
            if self.buffer.len() > MAX_CHUNK_LINE {
                return Err(error::body("chunk header too long"));
            }
            self.fill_buffer()?;
        }
    }
}

impl ByteStream for Http1Body {
    fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        if self.closed || self.complete {
            return Ok(None);
        }
        loop {
            match self.kind {
                BodyKind::Empty | BodyKind::Length { remaining: 0 } => {
                    self.complete = true;
                    return Ok(None);
                }
                BodyKind::Length { remaining } => {
                    if self.buffer.is_empty() {
                        self.fill_buffer()?;
                    }
                    let take = self
                        .buffer
                        .len()
                        .min(usize::try_from(remaining).unwrap_or(usize::MAX));
                    let data = self.buffer.split_to(take).freeze();
                    let remaining = remaining - take as u64;
                    self.kind = BodyKind::Length { remaining };
                    if remaining == 0 {
                        self.complete = true;
                    }
                    return Ok(Some(data));
                }
                BodyKind::Chunked(ChunkState::Size) => {
                    let line = self.read_line()?;
                    let size =
                        parse_chunk_size(&line).ok_or_else(|| error::body("invalid chunk size"))?;
                    self.kind = BodyKind::Chunked(if size == 0 {
                        ChunkState::Trailers
                    } else {
                        ChunkState::Data { remaining: size }
                    });
                }
                BodyKind::Chunked(ChunkState::Data { remaining }) => {
                    if self.buffer.is_empty() {
                        self.fill_buffer()?;
                    }
                    let take = self
                        .buffer
                        .len()
                        .min(usize::try_from(remaining).unwrap_or(usize::MAX));
                    let data = self.buffer.split_to(take).freeze();
                    let remaining = remaining - take as u64;
                    self.kind = BodyKind::Chunked(if remaining == 0 {
                        ChunkState::DataEnd
                    } else {
                        ChunkState::Data { remaining }
                    });
                    return Ok(Some(data));
                }
                BodyKind::Chunked(ChunkState::DataEnd) => {
                    let line = self.read_line()?;
                    if !line.is_empty() {
                        return Err(error::body("missing chunk terminator"));
                    }
                    self.kind = BodyKind::Chunked(ChunkState::Size);
                }
                BodyKind::Chunked(ChunkState::Trailers) => {
                    // Trailers are read off the wire and discarded.
                    let line = self.read_line()?;
                    if line.is_empty() {
                        self.kind = BodyKind::Chunked(ChunkState::Done);
                    }
                }
                BodyKind::Chunked(ChunkState::Done) => {
                    self.complete = true;
                    return Ok(None);
                }
                BodyKind::Eof => {
                    if !self.buffer.is_empty() {
                        let len = self.buffer.len();
                        return Ok(Some(self.buffer.split_to(len).freeze()));
                    }
                    let mut chunk = [0u8; READ_CHUNK];
                    let n = self.conn.read_io(&mut chunk)?;
                    if n == 0 {
                        self.complete = true;
                        return Ok(None);
                    }
                    return Ok(Some(Bytes::copy_from_slice(&chunk[..n])));
                }
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        // The engine decides the post-response state: a fully drained body on
        // a keep-alive exchange returns the connection to the idle pool;
        // anything else tears the connection down.
        if self.complete && self.reusable {
            self.conn.set_state(ConnectionState::Idle);
            Ok(())
        } else {
            self.conn.close()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn head_with(version: Version, headers: &[(&str, &str)]) -> ResponseHead {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.append(
                HeaderName::from_bytes(name.as_bytes()).expect("test header name"),
                HeaderValue::from_str(value).expect("test header value"),
            );
        }
        ResponseHead {
            status: StatusCode::OK,
            version,
            reason: None,
            headers: map,
        }
    }

    #[test]
    fn chunk_size_parsing() {
        assert_eq!(parse_chunk_size(b"0"), Some(0));
        assert_eq!(parse_chunk_size(b"1a"), Some(26));
        assert_eq!(parse_chunk_size(b"FF"), Some(255));
        assert_eq!(parse_chunk_size(b"5;ext=1"), Some(5));
        assert_eq!(parse_chunk_size(b""), None);
        assert_eq!(parse_chunk_size(b"zz"), None);
    }

    #[test]
    fn connection_token_matching() {
        assert!(connection_has("close", "close"));
        assert!(connection_has("keep-alive, Upgrade", "upgrade"));
        assert!(!connection_has("keepalive", "keep-alive"));
    }

    #[test]
    fn keep_alive_follows_version_and_header() {
        assert!(allows_reuse(&head_with(Version::HTTP_11, &[])));
        assert!(!allows_reuse(&head_with(
            Version::HTTP_11,
            &[("connection", "close")]
        )));
        assert!(!allows_reuse(&head_with(Version::HTTP_10, &[])));
        assert!(allows_reuse(&head_with(
            Version::HTTP_10,
            &[("connection", "keep-alive")]
        )));
    }

    #[test]
    fn body_kind_from_head() {
        let head = head_with(Version::HTTP_11, &[("content-length", "12")]);
        assert_eq!(
            BodyKind::from_head(&Method::GET, &head).expect("framing"),
            BodyKind::Length { remaining: 12 }
        );
        assert_eq!(
            BodyKind::from_head(&Method::HEAD, &head).expect("framing"),
            BodyKind::Empty
        );

        let head = head_with(Version::HTTP_11, &[("transfer-encoding", "chunked")]);
        assert_eq!(
            BodyKind::from_head(&Method::GET, &head).expect("framing"),
            BodyKind::Chunked(ChunkState::Size)
        );

        let head = head_with(Version::HTTP_11, &[]);
        assert_eq!(
            BodyKind::from_head(&Method::GET, &head).expect("framing"),
            BodyKind::Eof
        );

        let head = head_with(Version::HTTP_11, &[("content-length", "nope")]);
        assert!(BodyKind::from_head(&Method::GET, &head).is_err());
    }

    #[test]
    fn request_head_encoding() {
        let url = Url::parse("http://example.org:8080/search?q=pool").expect("test url");
        let origin = Origin::from_url(&url).expect("origin");
        let request = Request {
            method: Method::GET,
            url,
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
            timeout: TimeoutConfig::default(),
        };
        let head = encode_request_head(&request, &origin).expect("encoded head");
        let text = String::from_utf8(head).expect("ascii head");
        assert!(text.starts_with("GET /search?q=pool HTTP/1.1\r\n"));
        assert!(text.contains("host: example.org:8080\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn request_head_adds_content_length_for_full_bodies() {
        let url = Url::parse("http://example.org/upload").expect("test url");
        let origin = Origin::from_url(&url).expect("origin");
        let request = Request {
            method: Method::POST,
            url,
            headers: HeaderMap::new(),
            body: RequestBody::from("payload"),
            timeout: TimeoutConfig::default(),
        };
        let head = encode_request_head(&request, &origin).expect("encoded head");
        let text = String::from_utf8(head).expect("ascii head");
        assert!(text.contains("content-length: 7\r\n"));
        assert!(text.contains("host: example.org\r\n"));
    }
}
