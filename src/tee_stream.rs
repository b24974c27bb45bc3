use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Stream wrapper that lets already-read bytes be read again.
///
/// Works like a tape: while recording, bytes pulled from the underlying
/// stream are retained; `start_or_reset` rewinds the tape and keeps
/// recording, so a parser can re-inspect everything from the first byte
/// onward. `stop` rewinds and freezes the tape: subsequent reads replay the
/// retained bytes and then fall through to the underlying stream, at which
/// point the tape is released.
///
/// The sniffer needs several independent look-aheads per connection, so all
/// of start/stop/start cycles are supported. Writes pass through untouched.
pub struct TeeStream<S> {
    inner: S,
    tape: Vec<u8>,
    pos: usize,
    recording: bool,
}

impl<S> TeeStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            tape: Vec::new(),
            pos: 0,
            recording: false,
        }
    }

    /// Wraps a stream with bytes that must be read back first, e.g. data a
    /// handshake parser pulled off the wire but did not consume.
    pub fn with_replay(inner: S, replay: Vec<u8>) -> Self {
        Self {
            inner,
            tape: replay,
            pos: 0,
            recording: false,
        }
    }

    /// Rewinds to the first retained byte and (re)enables recording.
    pub fn start_or_reset(&mut self) {
        self.pos = 0;
        self.recording = true;
    }

    /// Rewinds and freezes the tape for one final replay.
    pub fn stop(&mut self) {
        self.pos = 0;
        self.recording = false;
    }

    /// Returns the underlying stream, discarding any retained bytes.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TeeStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();

        if this.pos < this.tape.len() {
            let n = std::cmp::min(this.tape.len() - this.pos, buf.remaining());
            buf.put_slice(&this.tape[this.pos..this.pos + n]);
            this.pos += n;
            if !this.recording && this.pos == this.tape.len() {
                // Replay finished, release the tape.
                this.tape = Vec::new();
                this.pos = 0;
            }
            return Poll::Ready(Ok(()));
        }

        let filled_before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                if this.recording {
                    let filled = buf.filled();
                    this.tape.extend_from_slice(&filled[filled_before..]);
                    this.pos = this.tape.len();
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TeeStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_rewind_and_replay() {
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(b"hello world").await.unwrap();

        let mut tee = TeeStream::new(server);
        tee.start_or_reset();

        let mut first = [0u8; 1];
        tee.read_exact(&mut first).await.unwrap();
        assert_eq!(&first, b"h");

        // Rewind: the peeked byte is visible again and recording continues.
        tee.start_or_reset();
        let mut head = [0u8; 5];
        tee.read_exact(&mut head).await.unwrap();
        assert_eq!(&head, b"hello");

        // Freeze: the whole recording replays from the start.
        tee.stop();
        let mut all = [0u8; 11];
        tee.read_exact(&mut all).await.unwrap();
        assert_eq!(&all, b"hello world");

        // Tape is drained; new bytes pass straight through.
        client.write_all(b"more").await.unwrap();
        let mut more = [0u8; 4];
        tee.read_exact(&mut more).await.unwrap();
        assert_eq!(&more, b"more");
    }

    #[tokio::test]
    async fn test_restarting_after_stop_records_again() {
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(b"abcdef").await.unwrap();

        let mut tee = TeeStream::new(server);
        tee.start_or_reset();
        let mut buf = [0u8; 3];
        tee.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abc");

        tee.stop();
        tee.start_or_reset();
        tee.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abc");

        tee.stop();
        let mut rest = [0u8; 6];
        tee.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"abcdef");
    }

    #[tokio::test]
    async fn test_preloaded_replay() {
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(b" world").await.unwrap();

        let mut tee = TeeStream::with_replay(server, b"hello".to_vec());
        let mut all = [0u8; 11];
        tee.read_exact(&mut all).await.unwrap();
        assert_eq!(&all, b"hello world");
    }

    #[tokio::test]
    async fn test_writes_pass_through() {
        let (client, mut server) = tokio::io::duplex(1024);

        let mut tee = TeeStream::new(client);
        tee.start_or_reset();
        tee.write_all(b"untouched").await.unwrap();

        let mut buf = [0u8; 9];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"untouched");
    }
}
