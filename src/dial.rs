//! Dialing tunnels.
//!
//! A [`Dialer`] holds one carrier per protocol and turns a [`TunnelRequest`] into a
//! [`DuplexStream`]. Carriers are plugged in through the [`Builder`]; any
//! [`tower::Service`] with the right request and response types will do.

use std::fmt;

use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Uri};
use tower::ServiceExt as _;
use tracing::debug;

use crate::body::{Body, Request, Response};
use crate::capture;
use crate::config::TunnelConfig;
use crate::error::{Error, UpgradeError};
use crate::pipe::pipe;
use crate::protocol::Protocol;
use crate::stream::{DuplexStream, TunnelInfo};
use crate::transport::{
    http_transport, upgrade_transport, Handshake, HttpTransport, UpgradeRequest, UpgradeTransport,
};
use crate::BoxError;

/// Header carrying the dial URL, used by relays to route the tunnel.
pub const ROUTING_CLAIM: HeaderName = HeaderName::from_static("x-nile-pip-claim");

/// What to dial: a protocol, a target URL and any extra headers.
#[derive(Debug, Clone)]
pub struct TunnelRequest {
    protocol: Protocol,
    target: Uri,
    headers: HeaderMap,
}

impl TunnelRequest {
    /// A request with no extra headers.
    pub fn new(protocol: Protocol, target: Uri) -> Self {
        Self {
            protocol,
            target,
            headers: HeaderMap::new(),
        }
    }

    /// Add a header, keeping any previous values for the same name.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// The carrier protocol.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// The target URL.
    pub fn target(&self) -> &Uri {
        &self.target
    }

    /// Extra headers sent with the request or upgrade.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Mutable access to the extra headers.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }
}

/// Opens tunnels over the carriers it was built with.
///
/// Cloning a dialer is cheap, and clones share their carriers.
#[derive(Clone, Default)]
pub struct Dialer {
    http1: Option<HttpTransport>,
    http2: Option<HttpTransport>,
    http3: Option<HttpTransport>,
    websocket: Option<UpgradeTransport>,
    config: TunnelConfig,
}

impl fmt::Debug for Dialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let protocols: Vec<_> = Protocol::ALL
            .iter()
            .filter(|protocol| self.has_transport(**protocol))
            .map(|protocol| protocol.as_str())
            .collect();

        f.debug_struct("Dialer")
            .field("protocols", &protocols)
            .field("config", &self.config)
            .finish()
    }
}

impl Dialer {
    /// Start building a dialer with no carriers.
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// The configuration applied to every stream.
    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    /// Whether this dialer has a carrier for `protocol`.
    pub fn has_transport(&self, protocol: Protocol) -> bool {
        match protocol {
            Protocol::Http1 => self.http1.is_some(),
            Protocol::Http2 => self.http2.is_some(),
            Protocol::Http3 => self.http3.is_some(),
            Protocol::WebSocket => self.websocket.is_some(),
        }
    }

    /// Dial using textual protocol and URL, as they would come from the command line.
    ///
    /// An unknown protocol fails with [`Error::UnsupportedProtocol`] and a malformed URL
    /// with [`Error::Dial`], both before anything touches the network.
    pub async fn dial_with(
        &self,
        protocol: &str,
        url: &str,
        headers: HeaderMap,
    ) -> Result<DuplexStream, Error> {
        let protocol: Protocol = protocol.parse()?;
        let target: Uri = url.parse().map_err(|error| Error::Dial(Box::new(error)))?;

        let mut request = TunnelRequest::new(protocol, target);
        *request.headers_mut() = headers;
        self.dial(request).await
    }

    /// Dial a tunnel.
    ///
    /// For request/response protocols this returns as soon as the request has been handed
    /// to the carrier, before any response arrives. For WebSocket it returns once the
    /// upgrade has completed.
    #[tracing::instrument(skip_all, fields(protocol = %request.protocol, target = %request.target))]
    pub async fn dial(&self, request: TunnelRequest) -> Result<DuplexStream, Error> {
        let TunnelRequest {
            protocol,
            target,
            mut headers,
        } = request;

        if target.authority().is_none() {
            return Err(Error::Dial(format!("no host in {target}").into()));
        }

        if !headers.contains_key(&ROUTING_CLAIM) {
            let claim = HeaderValue::try_from(target.to_string())
                .map_err(|error| Error::Dial(Box::new(error)))?;
            headers.insert(ROUTING_CLAIM, claim);
        }

        let info = TunnelInfo::new(protocol, target.clone());
        match protocol {
            Protocol::WebSocket => self.upgrade(target, headers, info).await,
            Protocol::Http1 | Protocol::Http2 | Protocol::Http3 => {
                self.exchange(protocol, target, headers, info).await
            }
        }
    }

    async fn exchange(
        &self,
        protocol: Protocol,
        target: Uri,
        headers: HeaderMap,
        info: TunnelInfo,
    ) -> Result<DuplexStream, Error> {
        let transport = match protocol {
            Protocol::Http1 => self.http1.as_ref(),
            Protocol::Http2 => self.http2.as_ref(),
            Protocol::Http3 => self.http3.as_ref(),
            Protocol::WebSocket => None,
        };
        let mut transport = transport
            .cloned()
            .ok_or(Error::TransportUnavailable(protocol))?;

        let (outbound, body) = pipe(self.config.pipe_capacity);
        let mut request = http::Request::builder()
            .method(self.config.method.clone())
            .uri(target.clone())
            .version(protocol.version().unwrap_or_default())
            .body(Body::from(body))
            .map_err(|error| Error::Dial(Box::new(error)))?;
        request.headers_mut().extend(headers);

        transport.ready().await.map_err(Error::Dial)?;

        let (abort, pending) = capture::spawn(transport, request, protocol, &target);
        debug!("request sent");
        Ok(DuplexStream::requested(
            outbound,
            pending,
            abort,
            &self.config,
            info,
        ))
    }

    async fn upgrade(
        &self,
        target: Uri,
        headers: HeaderMap,
        info: TunnelInfo,
    ) -> Result<DuplexStream, Error> {
        let transport = self
            .websocket
            .clone()
            .ok_or(Error::TransportUnavailable(Protocol::WebSocket))?;

        let handshake = transport
            .oneshot(UpgradeRequest::new(target, headers))
            .await
            .map_err(|error| Error::UpgradeFailed(UpgradeError::Transport(error)))?;

        let status = handshake.status();
        let io = handshake
            .into_io()
            .ok_or(Error::UpgradeFailed(UpgradeError::Status(status)))?;

        debug!(%status, "upgraded");
        Ok(DuplexStream::native(io, &self.config, info))
    }
}

/// Builder for a [`Dialer`].
#[derive(Default)]
pub struct Builder {
    http1: Option<HttpTransport>,
    http2: Option<HttpTransport>,
    http3: Option<HttpTransport>,
    websocket: Option<UpgradeTransport>,
    config: TunnelConfig,
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("http1", &self.http1.is_some())
            .field("http2", &self.http2.is_some())
            .field("http3", &self.http3.is_some())
            .field("websocket", &self.websocket.is_some())
            .field("config", &self.config)
            .finish()
    }
}

impl Builder {
    /// Use `transport` for HTTP/1.1 tunnels.
    pub fn with_http1<S>(mut self, transport: S) -> Self
    where
        S: tower::Service<Request, Response = Response> + Clone + Send + Sync + 'static,
        S::Error: Into<BoxError>,
        S::Future: Send + 'static,
    {
        self.http1 = Some(http_transport(transport));
        self
    }

    /// Use `transport` for HTTP/2 tunnels.
    pub fn with_http2<S>(mut self, transport: S) -> Self
    where
        S: tower::Service<Request, Response = Response> + Clone + Send + Sync + 'static,
        S::Error: Into<BoxError>,
        S::Future: Send + 'static,
    {
        self.http2 = Some(http_transport(transport));
        self
    }

    /// Use `transport` for HTTP/3 tunnels. There is no built-in HTTP/3 carrier.
    pub fn with_http3<S>(mut self, transport: S) -> Self
    where
        S: tower::Service<Request, Response = Response> + Clone + Send + Sync + 'static,
        S::Error: Into<BoxError>,
        S::Future: Send + 'static,
    {
        self.http3 = Some(http_transport(transport));
        self
    }

    /// Use `transport` for WebSocket tunnels.
    pub fn with_websocket<S>(mut self, transport: S) -> Self
    where
        S: tower::Service<UpgradeRequest, Response = Handshake> + Clone + Send + Sync + 'static,
        S::Error: Into<BoxError>,
        S::Future: Send + 'static,
    {
        self.websocket = Some(upgrade_transport(transport));
        self
    }

    /// Use hyper over `connector` for both HTTP/1.1 and HTTP/2.
    pub fn with_hyper<C, IO>(self, connector: C) -> Self
    where
        C: tower::Service<Uri, Response = IO> + Clone + Send + Sync + 'static,
        C::Error: Into<BoxError>,
        C::Future: Send + 'static,
        IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
    {
        let transport = crate::transport::exchange::HyperTransport::new(connector);
        self.with_http1(transport.clone()).with_http2(transport)
    }

    /// Install the built-in carriers: hyper over TCP for HTTP/1.1 and HTTP/2, and
    /// WebSocket when the `websocket` feature is enabled.
    ///
    /// With the `tls` feature, `https` and `wss` targets are verified against the
    /// platform's certificates, offering `h2` over ALPN for HTTP/2 and `http/1.1`
    /// otherwise.
    pub fn with_default_transports(self) -> Self {
        use crate::transport::connect::default_connector;
        use crate::transport::exchange::HyperTransport;

        let this = self
            .with_http1(HyperTransport::new(default_connector(b"http/1.1")))
            .with_http2(HyperTransport::new(default_connector(b"h2")));

        #[cfg(feature = "websocket")]
        let this = this.with_websocket(crate::transport::websocket::WebSocketTransport::new(
            default_connector(b"http/1.1"),
        ));

        this
    }

    /// Set the configuration applied to every stream.
    pub fn with_config(mut self, config: TunnelConfig) -> Self {
        self.config = config;
        self
    }

    /// Mutable access to the stream configuration.
    pub fn config_mut(&mut self) -> &mut TunnelConfig {
        &mut self.config
    }

    /// Finish building.
    pub fn build(self) -> Dialer {
        Dialer {
            http1: self.http1,
            http2: self.http2,
            http3: self.http3,
            websocket: self.websocket,
            config: self.config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use static_assertions::assert_impl_all;

    assert_impl_all!(Dialer: Clone, Send, Sync);

    #[tokio::test]
    async fn unsupported_protocol_fails_before_network() {
        let dialer = Dialer::builder().with_default_transports().build();
        let err = dialer
            .dial_with("quic", "http://127.0.0.1:9/", HeaderMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedProtocol(ref p) if p == "quic"));
    }

    #[tokio::test]
    async fn malformed_url() {
        let dialer = Dialer::default();
        let err = dialer
            .dial_with("h2", "http://exa mple/", HeaderMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Dial(_)));

        let err = dialer
            .dial_with("h2", "/relative", HeaderMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Dial(_)));
    }

    #[tokio::test]
    async fn no_http3_by_default() {
        let dialer = Dialer::builder().with_default_transports().build();
        assert!(dialer.has_transport(Protocol::Http1));
        assert!(dialer.has_transport(Protocol::Http2));
        assert!(!dialer.has_transport(Protocol::Http3));

        let err = dialer
            .dial(TunnelRequest::new(
                Protocol::Http3,
                Uri::from_static("https://relay.example/h3"),
            ))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::TransportUnavailable(Protocol::Http3)
        ));
    }

    #[test]
    fn request_headers_accumulate() {
        let request = TunnelRequest::new(Protocol::Http1, Uri::from_static("http://a/"))
            .with_header(ROUTING_CLAIM, HeaderValue::from_static("one"))
            .with_header(ROUTING_CLAIM, HeaderValue::from_static("two"));
        assert_eq!(request.headers().get_all(ROUTING_CLAIM).iter().count(), 2);
    }
}
