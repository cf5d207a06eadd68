//! # Wirepool
//!
//! Origin-keyed connection pooling for HTTP client transports.
//!
//! `wirepool` hands out reusable network connections keyed by origin
//! (scheme, host, port), transparently creates new ones when none are
//! reusable, detects and discards connections whose socket has silently
//! died, and reclaims connections into the pool once their response body has
//! been fully consumed and closed.
//!
//! ## Features
//!
//! - **Per-origin keep-alive** with a single lock over all pool bookkeeping
//! - **Dead-connection detection** via a non-blocking liveness probe
//! - **Single-stream HTTP/1.1 and multiplexed HTTP/2** connection variants
//!   behind one trait, chosen by protocol preference at creation time
//! - **Rustls TLS** with native root certificates and webpki fallback
//! - **Response-stream bookkeeping**: closing (or dropping) a response body
//!   hands its connection back to the pool exactly once
//!
//! ## Usage
//!
//! ```no_run
//! use http::{HeaderMap, Method};
//! use url::Url;
//! use wirepool::{ConnectionPool, RequestBody, TimeoutConfig};
//!
//! fn main() -> wirepool::Result<()> {
//!     let pool = ConnectionPool::new()?;
//!     let url = Url::parse("https://example.org/").unwrap();
//!     let mut response = pool.request(
//!         Method::GET,
//!         url,
//!         HeaderMap::new(),
//!         RequestBody::Empty,
//!         TimeoutConfig::default(),
//!     )?;
//!     let body = response.body_mut().bytes()?;
//!     println!("{} ({} bytes)", response.status(), body.len());
//!     pool.close();
//!     Ok(())
//! }
//! ```

pub mod body;
pub mod config;
pub mod connection;
pub mod error;
pub mod origin;
pub mod pool;

pub use crate::body::{ByteStream, EmptyStream, RequestBody};
pub use crate::config::{default_tls_config, ProtocolPreference, TimeoutConfig};
pub use crate::connection::{
    Connection, ConnectionFactory, ConnectionState, Request, ResponseHead, TransportFactory,
};
pub use crate::error::{Error, Result};
pub use crate::origin::{Origin, Scheme};
pub use crate::pool::{ConnectionPool, Response, ResponseBody};
