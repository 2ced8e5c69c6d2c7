use std::io;

use thiserror::Error;

use crate::protocol::Protocol;
use crate::BoxError;

/// Tunnel error type.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The requested protocol identifier is not one of the supported carriers.
    #[error("unsupported protocol: {0:?}")]
    UnsupportedProtocol(String),

    /// The protocol is supported, but this dialer was built without a transport for it.
    #[error("no transport configured for {0}")]
    TransportUnavailable(Protocol),

    /// The WebSocket handshake did not switch protocols.
    #[error("upgrade failed: {0}")]
    UpgradeFailed(#[source] UpgradeError),

    /// Building or submitting the request failed before a stream was returned.
    #[error("dial: {0}")]
    Dial(#[source] BoxError),

    /// The response never arrived within the configured number of read attempts.
    #[error("no progress: response not ready after {attempts} reads")]
    NoProgress {
        /// Number of consecutive reads which found no response.
        attempts: usize,
    },

    /// Write attempted on a closed stream.
    #[error("write after close")]
    WriteAfterClose,

    /// Read attempted on a closed stream.
    #[error("read after close")]
    ReadAfterClose,

    /// The operation is not modeled by tunnel streams.
    #[error("{0} is not supported on tunnel streams")]
    Unsupported(&'static str),
}

impl Error {
    /// Recover a tunnel error from an I/O error produced by a [`DuplexStream`](crate::DuplexStream).
    pub fn from_io(error: &io::Error) -> Option<&Error> {
        error.get_ref().and_then(|inner| inner.downcast_ref::<Error>())
    }

    /// Is this the bounded-patience failure?
    pub fn is_no_progress(&self) -> bool {
        matches!(self, Error::NoProgress { .. })
    }

    fn kind(&self) -> io::ErrorKind {
        match self {
            Error::NoProgress { .. } => io::ErrorKind::TimedOut,
            Error::WriteAfterClose | Error::ReadAfterClose => io::ErrorKind::NotConnected,
            Error::Unsupported(_) => io::ErrorKind::Unsupported,
            Error::UnsupportedProtocol(_) => io::ErrorKind::InvalidInput,
            _ => io::ErrorKind::Other,
        }
    }
}

impl From<Error> for io::Error {
    fn from(error: Error) -> Self {
        io::Error::new(error.kind(), error)
    }
}

/// Why a WebSocket upgrade did not produce a stream.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum UpgradeError {
    /// The server answered with something other than `101 Switching Protocols`.
    #[error("unexpected status {0}")]
    Status(http::StatusCode),

    /// The transport failed during the handshake.
    #[error("transport: {0}")]
    Transport(#[source] BoxError),
}
