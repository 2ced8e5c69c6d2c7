use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Buf as _, Bytes};
use tokio::io::{AsyncRead, ReadBuf};

use crate::BoxError;

/// Adapts an [`http_body::Body`] into an [`AsyncRead`] byte stream.
///
/// Data frames are copied out as the reader asks for them, keeping any remainder
/// for the next read. Trailers are skipped, and the end of the body reads as EOF.
#[derive(Debug)]
#[pin_project::pin_project]
pub struct BodyReader<B> {
    #[pin]
    body: B,
    chunk: Bytes,
    done: bool,
}

impl<B> BodyReader<B> {
    /// Create a reader over a body.
    pub fn new(body: B) -> Self {
        Self {
            body,
            chunk: Bytes::new(),
            done: false,
        }
    }
}

impl<B> AsyncRead for BodyReader<B>
where
    B: http_body::Body<Data = Bytes>,
    B::Error: Into<BoxError>,
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

            if *this.done {
                return Poll::Ready(Ok(()));
            }

            match ready!(this.body.as_mut().poll_frame(cx)) {
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data() {
                        *this.chunk = data;
                    }
                }
                Some(Err(error)) => {
                    let error: BoxError = error.into();
                    return Poll::Ready(Err(io::Error::other(error)));
                }
                None => {
                    *this.done = true;
                }
            }
        }
    }
}
