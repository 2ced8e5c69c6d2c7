//! In-memory, unidirectional byte pipe.
//!
//! The write half is handed to the caller as the outbound side of a tunnel, and the
//! read half becomes the streaming request body. With zero capacity the pipe is a
//! rendezvous: a write offers its bytes and completes only once reads have taken
//! them, so the writer is held back until the exchange actually consumes the request
//! body. A pending write whose future is dropped withdraws whatever is still untaken
//! the next time the writer is used.
//!
//! ```
//! # use hyperpipe::pipe;
//! # use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
//! # async fn demo() {
//! let (mut writer, mut reader) = pipe::pipe(0);
//!
//! let mut buf = [0u8; 5];
//! let (written, read) = tokio::join!(writer.write_all(b"hello"), reader.read_exact(&mut buf));
//! written.unwrap();
//! read.unwrap();
//! assert_eq!(&buf, b"hello");
//! # }
//! ```

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll, Waker};

use bytes::{Bytes, BytesMut};
use http_body::{Frame, SizeHint};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Largest chunk handed out as a single body frame.
const FRAME_SIZE: usize = 16 * 1024;

#[derive(Debug)]
struct Shared {
    buffer: BytesMut,
    capacity: usize,

    /// Bytes of the current rendezvous write sitting in `buffer`, taken or not.
    offered: usize,
    writer_closed: bool,
    reader_closed: bool,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
}

impl Shared {
    fn space(&self) -> usize {
        self.capacity.saturating_sub(self.buffer.len())
    }

    fn wake_reader(&mut self) {
        if let Some(waker) = self.read_waker.take() {
            waker.wake();
        }
    }

    fn wake_writer(&mut self) {
        if let Some(waker) = self.write_waker.take() {
            waker.wake();
        }
    }

    /// Take up to `max` buffered bytes, or register the reader.
    fn poll_take(&mut self, cx: &mut Context<'_>, max: usize) -> Poll<Option<Bytes>> {
        if !self.buffer.is_empty() {
            let n = self.buffer.len().min(max);
            let chunk = self.buffer.split_to(n).freeze();
            self.wake_writer();
            return Poll::Ready(Some(chunk));
        }

        if self.writer_closed {
            return Poll::Ready(None);
        }

        self.read_waker = Some(cx.waker().clone());
        Poll::Pending
    }

    /// A write with no buffer: offer `buf` and complete once reads have taken it.
    fn poll_offer(&mut self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<usize> {
        if self.offered > 0 {
            let taken = self.offered - self.buffer.len();
            if taken > 0 {
                // the untaken rest is offered again by the next write
                self.buffer.clear();
                self.offered = 0;
                return Poll::Ready(taken);
            }

            // nothing taken yet: withdraw and offer the current buffer instead
            self.buffer.clear();
        }

        let n = buf.len().min(FRAME_SIZE);
        self.buffer.extend_from_slice(&buf[..n]);
        self.offered = n;
        self.write_waker = Some(cx.waker().clone());
        self.wake_reader();
        Poll::Pending
    }
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader closed")
}

/// Create a new pipe.
///
/// `capacity` is the number of bytes the pipe may hold without a pending read.
pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let shared = Arc::new(Mutex::new(Shared {
        buffer: BytesMut::with_capacity(capacity),
        capacity,
        offered: 0,
        writer_closed: false,
        reader_closed: false,
        read_waker: None,
        write_waker: None,
    }));

    (
        PipeWriter {
            shared: shared.clone(),
        },
        PipeReader { shared },
    )
}

/// The write end of a [`pipe`].
///
/// Shutting down or dropping the writer ends the stream for the reader.
#[derive(Debug)]
pub struct PipeWriter {
    shared: Arc<Mutex<Shared>>,
}

impl AsyncWrite for PipeWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        let mut shared = self.shared.lock();

        if shared.reader_closed {
            return Poll::Ready(Err(broken_pipe()));
        }

        if shared.writer_closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "pipe writer closed",
            )));
        }

        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        if shared.capacity == 0 {
            let n = ready!(shared.poll_offer(cx, buf));
            tracing::trace!(n, "pipe write taken");
            return Poll::Ready(Ok(n));
        }

        let space = shared.space();
        if space == 0 {
            shared.write_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let n = space.min(buf.len());
        shared.buffer.extend_from_slice(&buf[..n]);
        shared.wake_reader();
        tracing::trace!(n, "pipe write");
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        let mut shared = self.shared.lock();
        shared.writer_closed = true;
        shared.wake_reader();
        Poll::Ready(Ok(()))
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        let mut shared = self.shared.lock();
        shared.writer_closed = true;
        shared.wake_reader();
    }
}

/// The read end of a [`pipe`].
///
/// Usable directly as [`AsyncRead`], or as an [`http_body::Body`] of unknown length.
/// Dropping the reader fails any pending and future writes with `BrokenPipe`.
#[derive(Debug)]
pub struct PipeReader {
    shared: Arc<Mutex<Shared>>,
}

impl PipeReader {
    fn poll_chunk(&self, cx: &mut Context<'_>, max: usize) -> Poll<Option<Bytes>> {
        self.shared.lock().poll_take(cx, max)
    }
}

impl AsyncRead for PipeReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        match self.poll_chunk(cx, buf.remaining()) {
            Poll::Ready(Some(chunk)) => {
                buf.put_slice(&chunk);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl http_body::Body for PipeReader {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        self.poll_chunk(cx, FRAME_SIZE)
            .map(|chunk| chunk.map(|data| Ok(Frame::data(data))))
    }

    fn is_end_stream(&self) -> bool {
        let shared = self.shared.lock();
        shared.writer_closed && shared.buffer.is_empty()
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::default()
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        let mut shared = self.shared.lock();
        shared.reader_closed = true;
        shared.wake_writer();
    }
}
