//! Request and response body streams.

use std::fmt;

use bytes::Bytes;

use crate::error::Result;

/// A finite, single-pass sequence of body chunks.
///
/// Iterating drains the underlying response body from the connection that
/// produced it; streams are not restartable. `close` finalizes the exchange
/// and releases whatever transport state backs the stream.
pub trait ByteStream: Send {
    /// Pull the next chunk, or `None` once the stream is exhausted.
    fn next_chunk(&mut self) -> Result<Option<Bytes>>;

    /// Finalize the stream.
    fn close(&mut self) -> Result<()>;
}

/// A stream with no chunks.
#[derive(Debug, Default)]
pub struct EmptyStream;

impl ByteStream for EmptyStream {
    fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        Ok(None)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Outgoing request body.
pub enum RequestBody {
    /// No body.
    Empty,
    /// A body whose size is known up front.
    Full(Bytes),
    /// A streaming body of unknown length; sent chunked on HTTP/1.1.
    Stream(Box<dyn ByteStream>),
}

impl RequestBody {
    /// Length in bytes, when known.
    #[must_use]
    pub fn len(&self) -> Option<u64> {
        match self {
            RequestBody::Empty => Some(0),
            RequestBody::Full(bytes) => Some(bytes.len() as u64),
            RequestBody::Stream(_) => None,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, RequestBody::Empty)
    }
}

impl Default for RequestBody {
    fn default() -> Self {
        RequestBody::Empty
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestBody::Empty => f.debug_tuple("Empty").finish(),
            RequestBody::Full(bytes) => f
                .debug_tuple("Full")
                .field(&format!("{} bytes", bytes.len()))
                .finish(),
            RequestBody::Stream(_) => f.debug_tuple("Stream").field(&"<ByteStream>").finish(),
        }
    }
}

impl From<Bytes> for RequestBody {
    fn from(bytes: Bytes) -> Self {
        RequestBody::Full(bytes)
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(bytes: Vec<u8>) -> Self {
        RequestBody::Full(Bytes::from(bytes))
    }
}

impl From<String> for RequestBody {
    fn from(text: String) -> Self {
        RequestBody::Full(Bytes::from(text))
    }
}

impl From<&'static str> for RequestBody {
    fn from(text: &'static str) -> Self {
        RequestBody::Full(Bytes::from_static(text.as_bytes()))
    }
}
