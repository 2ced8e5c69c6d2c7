//! Hyperpipe
//!
//! Duplex byte-stream tunnels carried over HTTP request/response exchanges.
//!
//! A [`Dialer`] issues a streamed request over HTTP/1.1, HTTP/2 or HTTP/3 (or performs a
//! WebSocket upgrade) and hands back a [`DuplexStream`]: writes feed the request body as it
//! streams, reads drain the response body as it arrives.
//!
//! ```no_run
//! # use hyperpipe::{Dialer, Protocol, TunnelRequest};
//! # use tokio::io::AsyncWriteExt as _;
//! # async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let dialer = Dialer::builder().with_default_transports().build();
//! let request = TunnelRequest::new(Protocol::Http2, "http://relay.example/p/5001".parse()?);
//!
//! let mut tunnel = dialer.dial(request).await?;
//! tunnel.write_all(b"GET ADDR\r\n").await?;
//! tunnel.ready().await?;
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

use std::fmt;

pub mod body;
pub use body::Body;
mod capture;
pub mod config;
pub use config::TunnelConfig;
pub mod dial;
pub use dial::{Dialer, TunnelRequest};
mod error;
pub use error::{Error, UpgradeError};
mod handoff;
pub mod pipe;
mod protocol;
pub use protocol::Protocol;
pub mod stream;
pub use stream::DuplexStream;
pub mod transport;

/// Boxed error type used by transports.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub(crate) type BoxFuture<'a, T> = futures_util::future::BoxFuture<'a, T>;

pub(crate) struct DebugLiteral<T: fmt::Display>(T);

impl<T: fmt::Display> fmt::Debug for DebugLiteral<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
