//! WebSocket upgrade transport.
//!
//! The handshake is an ordinary HTTP/1.1 request sent over hyper, with the RFC 6455
//! headers and any extra headers from the [`UpgradeRequest`]. Once the server switches
//! protocols, the upgraded connection is framed by tungstenite and exposed as a plain
//! byte stream through [`WsIo`].

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Buf as _, Bytes};
use futures_util::{Sink, Stream};
use http::{header, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tower::ServiceExt as _;
use tracing::{debug, trace, Instrument as _};

use super::connect::TcpConnector;
use super::{Handshake, UpgradeRequest};
use crate::body::Body;
use crate::{BoxError, BoxFuture};

/// Performs WebSocket client handshakes over connections produced by `C`.
#[derive(Clone)]
pub struct WebSocketTransport<C = TcpConnector> {
    connector: C,
    http1: hyper::client::conn::http1::Builder,
}

impl<C> fmt::Debug for WebSocketTransport<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketTransport").finish()
    }
}

impl Default for WebSocketTransport<TcpConnector> {
    fn default() -> Self {
        Self::new(TcpConnector::default())
    }
}

impl<C> WebSocketTransport<C> {
    /// Create a transport which opens connections with `connector`.
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            http1: hyper::client::conn::http1::Builder::new(),
        }
    }
}

impl<C, IO> WebSocketTransport<C>
where
    C: tower::Service<Uri, Response = IO> + Clone + Send + 'static,
    C::Error: Into<BoxError>,
    C::Future: Send + 'static,
    IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn upgrade(self, request: UpgradeRequest) -> Result<Handshake, BoxError> {
        let (uri, extra) = request.into_parts();
        let authority = uri
            .authority()
            .ok_or_else(|| format!("missing authority in {uri}"))?
            .clone();

        let stream = self
            .connector
            .oneshot(uri.clone())
            .await
            .map_err(Into::<BoxError>::into)?;

        trace!("handshake h1");
        let (mut sender, conn) = self.http1.handshake(TokioIo::new(stream)).await?;
        tokio::spawn(
            async {
                if let Err(err) = conn.with_upgrades().await {
                    debug!(%err, "websocket connection driver error");
                }
            }
            .in_current_span(),
        );

        let key = generate_key();
        let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        let mut handshake = http::Request::get(path)
            .header(header::HOST, authority.as_str())
            .header(header::CONNECTION, "Upgrade")
            .header(header::UPGRADE, "websocket")
            .header(header::SEC_WEBSOCKET_VERSION, "13")
            .header(header::SEC_WEBSOCKET_KEY, key.as_str())
            .body(Body::empty())?;

        for (name, value) in extra.iter() {
            handshake.headers_mut().append(name.clone(), value.clone());
        }

        sender.ready().await?;
        let mut response = sender.send_request(handshake).await?;
        let status = response.status();
        if status != StatusCode::SWITCHING_PROTOCOLS {
            debug!(%status, "server refused upgrade");
            return Ok(Handshake::rejected(status));
        }

        let accept = response
            .headers()
            .get(header::SEC_WEBSOCKET_ACCEPT)
            .ok_or("missing Sec-WebSocket-Accept")?;
        if accept.as_bytes() != derive_accept_key(key.as_bytes()).as_bytes() {
            return Err("invalid Sec-WebSocket-Accept".into());
        }

        let upgraded = hyper::upgrade::on(&mut response).await?;
        let ws = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Client, None).await;
        debug!("websocket upgraded");
        Ok(Handshake::switched(WsIo::new(ws)))
    }
}

impl<C, IO> tower::Service<UpgradeRequest> for WebSocketTransport<C>
where
    C: tower::Service<Uri, Response = IO> + Clone + Send + 'static,
    C::Error: Into<BoxError>,
    C::Future: Send + 'static,
    IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    type Response = Handshake;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<Handshake, BoxError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: UpgradeRequest) -> Self::Future {
        let span = tracing::debug_span!("upgrade", uri = %request.uri());
        Box::pin(self.clone().upgrade(request).instrument(span))
    }
}

fn ws_error(error: WsError) -> io::Error {
    io::Error::other(error)
}

/// A WebSocket connection as a byte stream.
///
/// Each write is sent as one binary message. Reads return message payloads in order,
/// binary or text, split across reads as needed. A close frame reads as EOF.
#[pin_project::pin_project]
pub struct WsIo<S> {
    #[pin]
    ws: WebSocketStream<S>,
    chunk: Bytes,
    eof: bool,
}

impl<S> fmt::Debug for WsIo<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsIo")
            .field("buffered", &self.chunk.len())
            .field("eof", &self.eof)
            .finish()
    }
}

impl<S> WsIo<S> {
    /// Wrap an established WebSocket stream.
    pub fn new(ws: WebSocketStream<S>) -> Self {
        Self {
            ws,
            chunk: Bytes::new(),
            eof: false,
        }
    }
}

impl<S> AsyncRead for WsIo<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut this = self.project();

        loop {
            if !this.chunk.is_empty() {
                let n = this.chunk.len().min(buf.remaining());
                buf.put_slice(&this.chunk[..n]);
                this.chunk.advance(n);
                return Poll::Ready(Ok(()));
            }

            if *this.eof {
                return Poll::Ready(Ok(()));
            }

            match ready!(this.ws.as_mut().poll_next(cx)) {
                Some(Ok(Message::Binary(data))) => *this.chunk = Bytes::from(data),
                Some(Ok(Message::Text(text))) => {
                    *this.chunk = Bytes::copy_from_slice(text.as_str().as_bytes())
                }
                Some(Ok(Message::Close(frame))) => {
                    trace!(?frame, "websocket closed by peer");
                    *this.eof = true;
                }
                Some(Ok(_)) => {}
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                    *this.eof = true;
                }
                Some(Err(error)) => return Poll::Ready(Err(ws_error(error))),
            }
        }
    }
}

impl<S> AsyncWrite for WsIo<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        let mut ws = self.project().ws;

        ready!(ws.as_mut().poll_ready(cx)).map_err(ws_error)?;
        ws.as_mut()
            .start_send(Message::binary(buf.to_vec()))
            .map_err(ws_error)?;

        // Push the message out now; a pending flush finishes on the next write or flush.
        if let Poll::Ready(Err(error)) = ws.poll_flush(cx) {
            return Poll::Ready(Err(ws_error(error)));
        }

        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        self.project().ws.poll_flush(cx).map_err(ws_error)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match ready!(self.project().ws.poll_close(cx)) {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => {
                Poll::Ready(Ok(()))
            }
            Err(error) => Poll::Ready(Err(ws_error(error))),
        }
    }
}
