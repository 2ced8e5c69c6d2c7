//! Transports which carry tunnels.
//!
//! A transport is a [`tower::Service`]. Request/response carriers (HTTP/1.1, HTTP/2,
//! HTTP/3) take an [`http::Request<Body>`] whose body streams from a pipe, and
//! resolve to the response once its headers arrive. Upgrade carriers (WebSocket)
//! take an [`UpgradeRequest`] and resolve to a [`Handshake`].
//!
//! Any service with the right shape can be plugged into a [`Dialer`](crate::Dialer).
//! [`exchange::HyperTransport`] and `websocket::WebSocketTransport` are provided on
//! top of hyper, and there is no built-in HTTP/3 carrier.

use std::fmt;

use http::{HeaderMap, StatusCode, Uri};
use tokio::io::{AsyncRead, AsyncWrite};
use tower::util::BoxCloneSyncService;

use crate::body::Body;
use crate::BoxError;

pub mod connect;
pub mod exchange;
#[cfg(feature = "websocket")]
pub mod websocket;

/// A bidirectional byte stream.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// A boxed bidirectional byte stream.
pub type BoxIo = Box<dyn Io>;

/// A type-erased request/response carrier.
pub type HttpTransport = BoxCloneSyncService<http::Request<Body>, http::Response<Body>, BoxError>;

/// A type-erased upgrade carrier.
pub type UpgradeTransport = BoxCloneSyncService<UpgradeRequest, Handshake, BoxError>;

/// Box a request/response carrier.
pub fn http_transport<S>(service: S) -> HttpTransport
where
    S: tower::Service<http::Request<Body>, Response = http::Response<Body>>
        + Clone
        + Send
        + Sync
        + 'static,
    S::Error: Into<BoxError>,
    S::Future: Send + 'static,
{
    BoxCloneSyncService::new(tower::ServiceExt::map_err(service, Into::<BoxError>::into))
}

/// Box an upgrade carrier.
pub fn upgrade_transport<S>(service: S) -> UpgradeTransport
where
    S: tower::Service<UpgradeRequest, Response = Handshake> + Clone + Send + Sync + 'static,
    S::Error: Into<BoxError>,
    S::Future: Send + 'static,
{
    BoxCloneSyncService::new(tower::ServiceExt::map_err(service, Into::<BoxError>::into))
}

/// Request to upgrade a connection to a native duplex stream.
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    uri: Uri,
    headers: HeaderMap,
}

impl UpgradeRequest {
    /// Create an upgrade request for the given target and extra headers.
    pub fn new(uri: Uri, headers: HeaderMap) -> Self {
        Self { uri, headers }
    }

    /// The target of the upgrade.
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Extra headers sent with the handshake.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Split into target and headers.
    pub fn into_parts(self) -> (Uri, HeaderMap) {
        (self.uri, self.headers)
    }
}

/// The outcome of an upgrade handshake.
///
/// A handshake which completed at the transport level still carries the status the
/// server answered with; only `101 Switching Protocols` comes with a stream.
pub struct Handshake {
    status: StatusCode,
    io: Option<BoxIo>,
}

impl Handshake {
    /// The server switched protocols and handed over `io`.
    pub fn switched<IO: Io>(io: IO) -> Self {
        Self {
            status: StatusCode::SWITCHING_PROTOCOLS,
            io: Some(Box::new(io)),
        }
    }

    /// The server answered with `status` and did not switch protocols.
    pub fn rejected(status: StatusCode) -> Self {
        Self { status, io: None }
    }

    /// The status the server answered with.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Take the upgraded stream, if the server switched protocols.
    pub fn into_io(self) -> Option<BoxIo> {
        if self.status == StatusCode::SWITCHING_PROTOCOLS {
            self.io
        } else {
            None
        }
    }
}

impl fmt::Debug for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handshake")
            .field("status", &self.status)
            .field("upgraded", &self.io.is_some())
            .finish()
    }
}

/// Host and port for a target, with scheme default ports.
pub(crate) fn host_and_port(uri: &Uri) -> Result<(&str, u16), BoxError> {
    let host = uri
        .host()
        .ok_or_else(|| format!("missing host in {uri}"))?
        .trim_start_matches('[')
        .trim_end_matches(']');

    let port = match (uri.port_u16(), uri.scheme_str()) {
        (Some(port), _) => port,
        (None, Some("https" | "wss")) => 443,
        (None, Some("http" | "ws")) => 80,
        (None, scheme) => return Err(format!("unknown scheme {scheme:?} in {uri}").into()),
    };

    Ok((host, port))
}

/// Whether the target requires TLS.
pub(crate) fn is_secure(uri: &Uri) -> bool {
    matches!(uri.scheme_str(), Some("https" | "wss"))
}
