//! Request/response transport built on hyper's client connection API.
//!
//! Each exchange gets its own connection: a tunnel keeps its request body open for
//! as long as the tunnel lives, so there is nothing useful to pool. The connection
//! driver runs on a spawned task and finishes once the exchange is dropped.

use std::fmt;
use std::task::{Context, Poll};

use http::{header, Uri, Version};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::io::{AsyncRead, AsyncWrite};
use tower::ServiceExt as _;
use tracing::{trace, Instrument as _};

use super::connect::TcpConnector;
use crate::body::{Body, Request, Response};
use crate::{BoxError, BoxFuture};

/// An HTTP/1.1 and HTTP/2 transport over connections produced by `C`.
///
/// The handshake is chosen from the request version: [`Version::HTTP_2`] uses
/// prior-knowledge HTTP/2, anything else HTTP/1.1 with a chunked request body.
#[derive(Clone)]
pub struct HyperTransport<C = TcpConnector> {
    connector: C,
    http1: hyper::client::conn::http1::Builder,
    http2: hyper::client::conn::http2::Builder<TokioExecutor>,
}

impl<C> fmt::Debug for HyperTransport<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HyperTransport").finish()
    }
}

impl Default for HyperTransport<TcpConnector> {
    fn default() -> Self {
        Self::new(TcpConnector::default())
    }
}

impl<C> HyperTransport<C> {
    /// Create a transport which opens connections with `connector`.
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            http1: hyper::client::conn::http1::Builder::new(),
            http2: hyper::client::conn::http2::Builder::new(TokioExecutor::new()),
        }
    }

    /// Get the HTTP/1.1 configuration.
    pub fn http1(&mut self) -> &mut hyper::client::conn::http1::Builder {
        &mut self.http1
    }

    /// Get the HTTP/2 configuration.
    pub fn http2(&mut self) -> &mut hyper::client::conn::http2::Builder<TokioExecutor> {
        &mut self.http2
    }
}

impl<C, IO> HyperTransport<C>
where
    C: tower::Service<Uri, Response = IO> + Clone + Send + 'static,
    C::Error: Into<BoxError>,
    C::Future: Send + 'static,
    IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn exchange(self, mut request: Request) -> Result<Response, BoxError> {
        let stream = self
            .connector
            .oneshot(request.uri().clone())
            .await
            .map_err(Into::<BoxError>::into)?;

        let response = if request.version() == Version::HTTP_2 {
            trace!("handshake h2");
            let (mut sender, conn) = self.http2.handshake(TokioIo::new(stream)).await?;
            tokio::spawn(
                async {
                    if let Err(err) = conn.await {
                        tracing::debug!(%err, "h2 connection driver error");
                    }
                }
                .in_current_span(),
            );

            sender.ready().await?;
            let response = sender.send_request(request).await?;
            response.map(|body| Body::new(Tethered::new(body, sender)))
        } else {
            origin_form(&mut request)?;

            trace!("handshake h1");
            let (mut sender, conn) = self.http1.handshake(TokioIo::new(stream)).await?;
            tokio::spawn(
                async {
                    if let Err(err) = conn.await {
                        tracing::debug!(%err, "h1 connection driver error");
                    }
                }
                .in_current_span(),
            );

            sender.ready().await?;
            let response = sender.send_request(request).await?;
            response.map(|body| Body::new(Tethered::new(body, sender)))
        };

        trace!(status = %response.status(), "response headers received");
        Ok(response)
    }
}

/// A response body which keeps its connection handle alive until the body is dropped.
#[pin_project::pin_project]
struct Tethered<B, S> {
    #[pin]
    body: B,
    _sender: S,
}

impl<B, S> Tethered<B, S> {
    fn new(body: B, sender: S) -> Self {
        Self {
            body,
            _sender: sender,
        }
    }
}

impl<B, S> http_body::Body for Tethered<B, S>
where
    B: http_body::Body,
{
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: std::pin::Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<http_body::Frame<Self::Data>, Self::Error>>> {
        self.project().body.poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.body.is_end_stream()
    }

    fn size_hint(&self) -> http_body::SizeHint {
        self.body.size_hint()
    }
}

/// HTTP/1.1 over the client connection API sends the URI as given, so rewrite it to
/// origin form and carry the authority in `Host`.
fn origin_form(request: &mut Request) -> Result<(), BoxError> {
    *request.version_mut() = Version::HTTP_11;

    if let Some(authority) = request.uri().authority().cloned() {
        if !request.headers().contains_key(header::HOST) {
            request
                .headers_mut()
                .insert(header::HOST, authority.as_str().parse()?);
        }
    }

    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri: Uri = path.parse()?;
    *request.uri_mut() = uri;
    Ok(())
}

impl<C, IO> tower::Service<Request> for HyperTransport<C>
where
    C: tower::Service<Uri, Response = IO> + Clone + Send + 'static,
    C::Error: Into<BoxError>,
    C::Future: Send + 'static,
    IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    type Response = Response;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<Response, BoxError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let span = tracing::debug_span!("exchange", version = ?request.version(), uri = %request.uri());
        Box::pin(self.clone().exchange(request).instrument(span))
    }
}
