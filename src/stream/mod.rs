//! The duplex stream returned by a dial.
//!
//! A [`DuplexStream`] joins the two halves of an exchange into one connection-shaped
//! object. Writes feed the outbound request body. Reads drain the inbound response
//! body, once it has arrived.
//!
//! # Zero-byte reads
//!
//! Until the response arrives, a read waits for the configured backoff and then
//! completes with **zero bytes and no error**. Tokio treats `Ok(0)` as end of stream,
//! so helpers like [`tokio::io::copy`] or `read_to_end` stop early if they are used
//! before the response has arrived. Either await [`DuplexStream::ready`] first, or read
//! in a loop which treats zero bytes as "not yet" while
//! [`DuplexStream::state`] is [`StreamState::RequestSent`].
//!
//! After [`TunnelConfig::max_not_ready`] consecutive empty reads, the next read fails
//! with [`Error::NoProgress`], wrapped in an [`io::Error`] of kind
//! [`io::ErrorKind::TimedOut`]. The stream has then given up: the exchange is cancelled
//! and every later read fails the same way, even if the response turns up afterwards.

use std::fmt;
use std::future::Future as _;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use http::Uri;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt as _, ReadBuf};
use tokio::task::AbortHandle;
use tokio::time::{Instant, Sleep};
use tracing::{debug, trace, warn};

use crate::body::{Body, BodyReader};
use crate::config::TunnelConfig;
use crate::error::Error;
use crate::handoff::{self, Delivery};
use crate::pipe::PipeWriter;
use crate::protocol::Protocol;
use crate::transport::BoxIo;

/// Lifecycle of a [`DuplexStream`]. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    /// The request is streaming, the response has not arrived.
    RequestSent,

    /// The inbound side is installed.
    Ready,

    /// The stream was closed.
    Closed,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamState::RequestSent => f.write_str("request-sent"),
            StreamState::Ready => f.write_str("ready"),
            StreamState::Closed => f.write_str("closed"),
        }
    }
}

/// What a stream was dialed with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelInfo {
    protocol: Protocol,
    target: Uri,
}

impl TunnelInfo {
    pub(crate) fn new(protocol: Protocol, target: Uri) -> Self {
        Self { protocol, target }
    }

    /// The carrier protocol.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// The dialed URL.
    pub fn target(&self) -> &Uri {
        &self.target
    }
}

enum State {
    RequestSent {
        outbound: PipeWriter,
        pending: handoff::Receiver<Body>,
    },
    Piped {
        outbound: PipeWriter,
        inbound: BodyReader<Body>,
    },
    Native(BoxIo),
    Closed,
}

impl State {
    fn kind(&self) -> StreamState {
        match self {
            State::RequestSent { .. } => StreamState::RequestSent,
            State::Piped { .. } | State::Native(_) => StreamState::Ready,
            State::Closed => StreamState::Closed,
        }
    }
}

/// Aborts the background exchange, at most once.
#[derive(Debug)]
struct CancelGuard(Option<AbortHandle>);

impl CancelGuard {
    fn fire(&mut self) {
        if let Some(handle) = self.0.take() {
            trace!("cancelling exchange");
            handle.abort();
        }
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        self.fire();
    }
}

/// A bidirectional byte stream over an HTTP exchange or WebSocket upgrade.
///
/// See the [module documentation](self) for how reads behave before the response arrives.
pub struct DuplexStream {
    state: State,
    not_ready: usize,
    gave_up: bool,
    backoff: Option<Pin<Box<Sleep>>>,
    interval: Duration,
    max_not_ready: usize,
    cancel: CancelGuard,
    info: TunnelInfo,
}

impl fmt::Debug for DuplexStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DuplexStream")
            .field("state", &self.state.kind())
            .field("not_ready", &self.not_ready)
            .field("gave_up", &self.gave_up)
            .field("protocol", &self.info.protocol)
            .field("target", &crate::DebugLiteral(&self.info.target))
            .finish()
    }
}

impl DuplexStream {
    /// A stream whose response is still being awaited by the task behind `abort`.
    pub(crate) fn requested(
        outbound: PipeWriter,
        pending: handoff::Receiver<Body>,
        abort: AbortHandle,
        config: &TunnelConfig,
        info: TunnelInfo,
    ) -> Self {
        Self {
            state: State::RequestSent { outbound, pending },
            not_ready: 0,
            gave_up: false,
            backoff: None,
            interval: config.backoff,
            max_not_ready: config.max_not_ready,
            cancel: CancelGuard(Some(abort)),
            info,
        }
    }

    /// A stream over an already upgraded connection.
    pub(crate) fn native(io: BoxIo, config: &TunnelConfig, info: TunnelInfo) -> Self {
        Self {
            state: State::Native(io),
            not_ready: 0,
            gave_up: false,
            backoff: None,
            interval: config.backoff,
            max_not_ready: config.max_not_ready,
            cancel: CancelGuard(None),
            info,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> StreamState {
        self.state.kind()
    }

    /// Consecutive reads which found no response.
    pub fn not_ready_attempts(&self) -> usize {
        self.not_ready
    }

    /// The protocol and target this stream was dialed with.
    pub fn info(&self) -> &TunnelInfo {
        &self.info
    }

    /// Wait until the inbound side is installed.
    ///
    /// Fails with [`Error::NoProgress`] if the exchange failed before a response arrived
    /// or the stream already gave up waiting, and with [`Error::ReadAfterClose`] on a
    /// closed stream.
    pub async fn ready(&mut self) -> Result<(), Error> {
        if self.gave_up && self.state() == StreamState::RequestSent {
            return Err(self.no_progress());
        }

        let delivered = match &mut self.state {
            State::Closed => return Err(Error::ReadAfterClose),
            State::Piped { .. } | State::Native(_) => return Ok(()),
            State::RequestSent { pending, .. } => pending.take().await,
        };

        match delivered {
            Some(body) => {
                self.install(body);
                Ok(())
            }
            None => {
                warn!("exchange ended without a response");
                Err(self.give_up())
            }
        }
    }

    /// Cancel the exchange and close the outbound side.
    ///
    /// The stream is closed afterwards even if shutting down the outbound side failed.
    /// Closing an already closed stream does nothing.
    pub async fn close(&mut self) -> io::Result<()> {
        self.shutdown().await
    }

    /// Tunnel streams have no socket addresses.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Err(Error::Unsupported("local_addr"))
    }

    /// Tunnel streams have no socket addresses.
    pub fn remote_addr(&self) -> Result<SocketAddr, Error> {
        Err(Error::Unsupported("remote_addr"))
    }

    /// Deadlines are not supported; use [`tokio::time::timeout`] around I/O instead.
    pub fn set_deadline(&mut self, _deadline: Option<Instant>) -> Result<(), Error> {
        Err(Error::Unsupported("set_deadline"))
    }

    /// Deadlines are not supported; use [`tokio::time::timeout`] around I/O instead.
    pub fn set_read_deadline(&mut self, _deadline: Option<Instant>) -> Result<(), Error> {
        Err(Error::Unsupported("set_read_deadline"))
    }

    /// Deadlines are not supported; use [`tokio::time::timeout`] around I/O instead.
    pub fn set_write_deadline(&mut self, _deadline: Option<Instant>) -> Result<(), Error> {
        Err(Error::Unsupported("set_write_deadline"))
    }

    fn no_progress(&self) -> Error {
        Error::NoProgress {
            attempts: self.not_ready,
        }
    }

    /// Stop waiting for the response for good. The exchange is cancelled, and the
    /// stream stays in [`StreamState::RequestSent`] failing every read.
    fn give_up(&mut self) -> Error {
        if !self.gave_up {
            self.gave_up = true;
            self.backoff = None;
            self.cancel.fire();
        }
        self.no_progress()
    }

    fn install(&mut self, body: Body) {
        let state = std::mem::replace(&mut self.state, State::Closed);
        self.state = match state {
            State::RequestSent { outbound, .. } => {
                debug!(
                    protocol = %self.info.protocol,
                    attempts = self.not_ready,
                    "response installed"
                );
                State::Piped {
                    outbound,
                    inbound: body.into_reader(),
                }
            }
            other => other,
        };
        self.backoff = None;
    }

    /// Install the response if the capture task has delivered it.
    fn try_install(&mut self) -> bool {
        if self.gave_up {
            return false;
        }

        let State::RequestSent { pending, .. } = &mut self.state else {
            return false;
        };

        match pending.try_take() {
            Delivery::Value(body) => {
                self.install(body);
                true
            }
            Delivery::Pending | Delivery::Absent => false,
        }
    }
}

impl AsyncRead for DuplexStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            match &mut this.state {
                State::Closed => return Poll::Ready(Err(Error::ReadAfterClose.into())),
                State::Piped { inbound, .. } => return Pin::new(inbound).poll_read(cx, buf),
                State::Native(io) => return Pin::new(io).poll_read(cx, buf),
                State::RequestSent { .. } => {}
            }

            if this.gave_up {
                return Poll::Ready(Err(this.no_progress().into()));
            }

            if let Some(sleep) = this.backoff.as_mut() {
                ready!(sleep.as_mut().poll(cx));
                this.backoff = None;

                if this.not_ready > this.max_not_ready {
                    warn!(attempts = this.not_ready, "response never arrived");
                    return Poll::Ready(Err(this.give_up().into()));
                }

                trace!(attempts = this.not_ready, "response not ready");
                return Poll::Ready(Ok(()));
            }

            if this.try_install() {
                continue;
            }

            this.not_ready += 1;
            this.backoff = Some(Box::pin(tokio::time::sleep(this.interval)));
        }
    }
}

impl AsyncWrite for DuplexStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        let written = match &mut self.get_mut().state {
            State::Closed => return Poll::Ready(Err(Error::WriteAfterClose.into())),
            State::RequestSent { outbound, .. } | State::Piped { outbound, .. } => {
                ready!(Pin::new(outbound).poll_write(cx, buf))?
            }
            State::Native(io) => ready!(Pin::new(io).poll_write(cx, buf))?,
        };

        trace!(len = written, "write");
        Poll::Ready(Ok(written))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match &mut self.get_mut().state {
            State::Closed => Poll::Ready(Ok(())),
            State::RequestSent { outbound, .. } | State::Piped { outbound, .. } => {
                Pin::new(outbound).poll_flush(cx)
            }
            State::Native(io) => Pin::new(io).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        let this = self.get_mut();
        this.cancel.fire();

        let result = match &mut this.state {
            State::Closed => return Poll::Ready(Ok(())),
            State::RequestSent { outbound, .. } | State::Piped { outbound, .. } => {
                ready!(Pin::new(outbound).poll_shutdown(cx))
            }
            State::Native(io) => ready!(Pin::new(io).poll_shutdown(cx)),
        };

        this.state = State::Closed;
        this.backoff = None;
        debug!(protocol = %this.info.protocol, "stream closed");
        Poll::Ready(result)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio::task::JoinHandle;

    use super::*;
    use crate::pipe::{pipe, PipeReader};

    use static_assertions::assert_impl_all;

    assert_impl_all!(DuplexStream: Send, Unpin, AsyncRead, AsyncWrite);

    struct Fixture {
        stream: DuplexStream,
        tx: handoff::Sender<Body>,
        peer: PipeReader,
        task: JoinHandle<()>,
    }

    fn requested(config: TunnelConfig) -> Fixture {
        let (outbound, peer) = pipe(config.pipe_capacity);
        let (tx, rx) = handoff::channel();
        let task = tokio::spawn(std::future::pending::<()>());
        let info = TunnelInfo::new(Protocol::Http2, Uri::from_static("http://relay.example/"));
        let stream = DuplexStream::requested(outbound, rx, task.abort_handle(), &config, info);

        Fixture {
            stream,
            tx,
            peer,
            task,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn zero_byte_reads_then_no_progress() {
        let config = TunnelConfig::default();
        let mut fx = requested(config.clone());

        let start = Instant::now();
        let mut buf = [0u8; 16];
        for attempt in 1..=100 {
            assert_eq!(fx.stream.read(&mut buf).await.unwrap(), 0);
            assert_eq!(fx.stream.not_ready_attempts(), attempt);
            assert_eq!(fx.stream.state(), StreamState::RequestSent);
        }

        let err = fx.stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(matches!(
            Error::from_io(&err),
            Some(Error::NoProgress { attempts: 101 })
        ));
        assert!(start.elapsed() >= config.patience());

        let err = fx.stream.read(&mut buf).await.unwrap_err();
        assert!(Error::from_io(&err).is_some_and(Error::is_no_progress));
    }

    #[tokio::test(start_paused = true)]
    async fn installs_delivered_response() {
        let mut fx = requested(TunnelConfig::default());

        let mut buf = [0u8; 16];
        assert_eq!(fx.stream.read(&mut buf).await.unwrap(), 0);

        fx.tx.resolve(Some(Body::from("pong"))).unwrap();
        let n = fx.stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");
        assert_eq!(fx.stream.state(), StreamState::Ready);
        assert_eq!(fx.stream.not_ready_attempts(), 1);

        // natural end of the response body
        assert_eq!(fx.stream.read(&mut buf).await.unwrap(), 0);
        assert_eq!(fx.stream.state(), StreamState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn states_only_move_forward() {
        let mut fx = requested(TunnelConfig::default());
        assert_eq!(fx.stream.state(), StreamState::RequestSent);

        fx.tx.resolve(Some(Body::empty())).unwrap();
        fx.stream.ready().await.unwrap();
        assert_eq!(fx.stream.state(), StreamState::Ready);

        fx.stream.close().await.unwrap();
        assert_eq!(fx.stream.state(), StreamState::Closed);

        assert!(matches!(fx.stream.ready().await, Err(Error::ReadAfterClose)));
        assert_eq!(fx.stream.state(), StreamState::Closed);
    }

    #[tokio::test]
    async fn io_after_close_fails() {
        let mut fx = requested(TunnelConfig::default());
        fx.stream.close().await.unwrap();

        let err = fx.stream.write(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        assert!(matches!(Error::from_io(&err), Some(Error::WriteAfterClose)));

        let err = fx.stream.read(&mut [0u8; 4]).await.unwrap_err();
        assert!(matches!(Error::from_io(&err), Some(Error::ReadAfterClose)));

        // closing twice is a no-op
        fx.stream.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn late_response_after_giving_up() {
        let mut fx = requested(TunnelConfig::default().with_max_not_ready(2));

        let mut buf = [0u8; 16];
        for _ in 0..2 {
            assert_eq!(fx.stream.read(&mut buf).await.unwrap(), 0);
        }
        let err = fx.stream.read(&mut buf).await.unwrap_err();
        assert!(matches!(
            Error::from_io(&err),
            Some(Error::NoProgress { attempts: 3 })
        ));

        fx.tx.resolve(Some(Body::from("late"))).unwrap();

        let err = fx.stream.read(&mut buf).await.unwrap_err();
        assert!(matches!(
            Error::from_io(&err),
            Some(Error::NoProgress { attempts: 3 })
        ));
        assert_eq!(fx.stream.state(), StreamState::RequestSent);
        assert!(matches!(
            fx.stream.ready().await,
            Err(Error::NoProgress { attempts: 3 })
        ));
        assert_eq!(fx.stream.state(), StreamState::RequestSent);

        assert!(fx.task.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn close_discards_unread_response() {
        let mut fx = requested(TunnelConfig::default());
        fx.tx.resolve(Some(Body::from("unread"))).unwrap();
        fx.stream.ready().await.unwrap();

        let mut buf = [0u8; 2];
        fx.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"un");

        fx.stream.close().await.unwrap();

        let err = fx.stream.read(&mut buf).await.unwrap_err();
        assert!(matches!(Error::from_io(&err), Some(Error::ReadAfterClose)));
        let err = fx.stream.write(b"more").await.unwrap_err();
        assert!(matches!(Error::from_io(&err), Some(Error::WriteAfterClose)));
    }

    #[tokio::test]
    async fn close_discards_unread_native_data() {
        let (io, mut peer) = tokio::io::duplex(64);
        let info = TunnelInfo::new(Protocol::WebSocket, Uri::from_static("ws://relay.example/"));
        let mut stream = DuplexStream::native(Box::new(io), &TunnelConfig::default(), info);

        peer.write_all(b"unread").await.unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"un");

        stream.close().await.unwrap();

        let err = stream.read(&mut buf).await.unwrap_err();
        assert!(matches!(Error::from_io(&err), Some(Error::ReadAfterClose)));
        let err = stream.write(b"more").await.unwrap_err();
        assert!(matches!(Error::from_io(&err), Some(Error::WriteAfterClose)));
    }

    #[tokio::test]
    async fn writes_feed_request_body() {
        let mut fx = requested(TunnelConfig::default().with_pipe_capacity(64));

        fx.stream.write_all(b"GET ADDR\r\n").await.unwrap();
        fx.stream.close().await.unwrap();

        let mut sent = Vec::new();
        fx.peer.read_to_end(&mut sent).await.unwrap();
        assert_eq!(sent, b"GET ADDR\r\n");
    }

    #[tokio::test]
    async fn close_cancels_exchange() {
        let mut fx = requested(TunnelConfig::default());

        fx.stream.close().await.unwrap();
        assert!(fx.task.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn drop_cancels_exchange() {
        let fx = requested(TunnelConfig::default());

        drop(fx.stream);
        assert!(fx.task.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn absent_response_fails_ready() {
        let mut fx = requested(TunnelConfig::default());

        fx.tx.resolve(None).unwrap();
        assert!(matches!(
            fx.stream.ready().await,
            Err(Error::NoProgress { .. })
        ));
        assert_eq!(fx.stream.state(), StreamState::RequestSent);
    }

    #[tokio::test]
    async fn metadata_is_unsupported() {
        let mut fx = requested(TunnelConfig::default());

        assert!(matches!(
            fx.stream.local_addr(),
            Err(Error::Unsupported("local_addr"))
        ));
        assert!(fx.stream.remote_addr().is_err());
        assert!(fx.stream.set_deadline(None).is_err());
        assert!(fx.stream.set_read_deadline(Some(Instant::now())).is_err());
        assert!(fx.stream.set_write_deadline(None).is_err());
    }

    #[tokio::test]
    async fn native_stream_is_ready() {
        let (io, mut peer) = tokio::io::duplex(64);
        let info = TunnelInfo::new(Protocol::WebSocket, Uri::from_static("ws://relay.example/"));
        let mut stream = DuplexStream::native(Box::new(io), &TunnelConfig::default(), info);
        assert_eq!(stream.state(), StreamState::Ready);

        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        stream.close().await.unwrap();
        assert_eq!(stream.state(), StreamState::Closed);
    }
}
