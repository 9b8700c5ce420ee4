//! Non-destructive protocol look-ahead.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

/// A reader that can peek ahead without consuming bytes.
///
/// Protocol detection peeks the first bytes of a connection; whichever
/// handler runs afterwards reads the very same bytes back through this
/// reader. The fallback relay reads the unconsumed buffer first and then
/// continues from the underlying stream.
pub struct PeekReader<R> {
    inner: R,
    buf: Vec<u8>,
    pos: usize,
}

impl<R: AsyncRead + Unpin> PeekReader<R> {
    /// Wrap a reader.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            pos: 0,
        }
    }

    /// Peek up to `n` bytes without consuming them.
    ///
    /// Blocks until `n` bytes are buffered or the stream reaches EOF, in
    /// which case fewer bytes (possibly none) are returned.
    pub async fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        let mut chunk = [0u8; 1024];
        while self.buf.len() - self.pos < n {
            let read = self.inner.read(&mut chunk).await?;
            if read == 0 {
                break;
            }
            self.buf.extend_from_slice(&chunk[..read]);
        }
        let available = (self.buf.len() - self.pos).min(n);
        Ok(&self.buf[self.pos..self.pos + available])
    }

    /// Bytes that were peeked but not yet consumed by a read.
    pub fn buffered(&self) -> &[u8] {
        &self.buf[self.pos..]
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for PeekReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pos < this.buf.len() {
            let n = (this.buf.len() - this.pos).min(buf.remaining());
            buf.put_slice(&this.buf[this.pos..this.pos + n]);
            this.pos += n;
            if this.pos == this.buf.len() {
                this.buf.clear();
                this.pos = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}
