// Forked from tokio's copy.rs and copy_bidirectional.rs.
//
// Changes:
// - Circular buffer, read and write whenever there's space
// - Flush after writes, for stream backends that cache until poll_flush
// - Returns as soon as either direction finishes

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::ready;
use log::debug;
use tokio::io::{AsyncWriteExt, ReadBuf};

use crate::async_stream::AsyncStream;

const RELAY_BUF_SIZE: usize = 16384;

#[derive(Debug)]
struct CopyBuffer {
    read_done: bool,
    need_flush: bool,
    start_index: usize,
    cache_length: usize,
    size: usize,
    buf: Box<[u8]>,
}

impl CopyBuffer {
    fn new(size: usize) -> Self {
        Self {
            read_done: false,
            need_flush: false,
            start_index: 0,
            cache_length: 0,
            size,
            buf: vec![0u8; size].into_boxed_slice(),
        }
    }

    fn poll_copy<R, W>(
        &mut self,
        cx: &mut Context<'_>,
        mut reader: Pin<&mut R>,
        mut writer: Pin<&mut W>,
    ) -> Poll<io::Result<()>>
    where
        R: AsyncStream + ?Sized,
        W: AsyncStream + ?Sized,
    {
        loop {
            let mut read_pending = false;
            let mut write_pending = false;

            // Read as much as possible before writing: backends that
            // packetize each poll_write benefit from larger chunks.
            while !self.read_done && self.cache_length < self.size {
                let unused_start_index = (self.start_index + self.cache_length) % self.size;
                let unused_end_index_exclusive = if unused_start_index < self.start_index {
                    self.start_index
                } else {
                    self.size
                };

                let me = &mut *self;
                let mut buf =
                    ReadBuf::new(&mut me.buf[unused_start_index..unused_end_index_exclusive]);
                match reader.as_mut().poll_read(cx, &mut buf) {
                    Poll::Ready(val) => {
                        val?;
                        let n = buf.filled().len();
                        if n == 0 {
                            self.read_done = true;
                        } else {
                            self.cache_length += n;
                        }
                    }
                    Poll::Pending => {
                        read_pending = true;
                        break;
                    }
                }
            }

            // Write out whatever is cached, minimizing forwarding latency
            // and improving the odds of an optimal read at start_index zero.
            while self.cache_length > 0 {
                let used_start_index = self.start_index;
                let used_end_index_exclusive =
                    std::cmp::min(self.start_index + self.cache_length, self.size);

                let me = &mut *self;
                match writer
                    .as_mut()
                    .poll_write(cx, &me.buf[used_start_index..used_end_index_exclusive])
                {
                    Poll::Ready(val) => {
                        let written = val?;
                        if written == 0 {
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::WriteZero,
                                "write zero byte into writer",
                            )));
                        }
                        self.cache_length -= written;
                        if self.cache_length == 0 {
                            self.start_index = 0;
                        } else {
                            self.start_index = (self.start_index + written) % self.size;
                        }
                        self.need_flush = true;
                    }
                    Poll::Pending => {
                        write_pending = true;
                        break;
                    }
                }
            }

            if self.need_flush {
                ready!(writer.as_mut().poll_flush(cx))?;
                self.need_flush = false;
            }

            // All data written and EOF seen: this direction is done.
            if self.read_done && self.cache_length == 0 {
                return Poll::Ready(Ok(()));
            }

            if read_pending || write_pending {
                return Poll::Pending;
            }
        }
    }
}

enum TransferState {
    Running,
    ShuttingDown,
    Done,
}

fn transfer_one_direction<A, B>(
    cx: &mut Context<'_>,
    state: &mut TransferState,
    buf: &mut CopyBuffer,
    r: &mut A,
    w: &mut B,
) -> Poll<io::Result<()>>
where
    A: AsyncStream + ?Sized,
    B: AsyncStream + ?Sized,
{
    let mut r = Pin::new(r);
    let mut w = Pin::new(w);

    loop {
        match state {
            TransferState::Running => {
                ready!(buf.poll_copy(cx, r.as_mut(), w.as_mut()))?;
                *state = TransferState::ShuttingDown;
            }
            TransferState::ShuttingDown => {
                ready!(w.as_mut().poll_shutdown(cx))?;
                *state = TransferState::Done;
            }
            TransferState::Done => return Poll::Ready(Ok(())),
        }
    }
}

struct CopyBidirectional<'a, A: ?Sized, B: ?Sized> {
    a: &'a mut A,
    b: &'a mut B,
    a_buf: CopyBuffer,
    b_buf: CopyBuffer,
    a_to_b: TransferState,
    b_to_a: TransferState,
}

impl<A, B> Future for CopyBidirectional<'_, A, B>
where
    A: AsyncStream + ?Sized,
    B: AsyncStream + ?Sized,
{
    type Output = io::Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let CopyBidirectional {
            a,
            b,
            a_buf,
            b_buf,
            a_to_b,
            b_to_a,
        } = &mut *self;

        let a_to_b = transfer_one_direction(cx, a_to_b, &mut *a_buf, &mut *a, &mut *b);
        let b_to_a = transfer_one_direction(cx, b_to_a, &mut *b_buf, &mut *b, &mut *a);

        // Once either direction terminates, the whole relay is over: the
        // caller closes both streams, which unblocks the other direction.
        if a_to_b.is_ready() {
            return a_to_b;
        }
        if b_to_a.is_ready() {
            return b_to_a;
        }

        Poll::Pending
    }
}

/// Copies data in both directions between `a` and `b`, returning as soon as
/// either direction sees EOF (and finishes writing out) or errors.
pub async fn copy_bidirectional<A, B>(a: &mut A, b: &mut B) -> io::Result<()>
where
    A: AsyncStream + ?Sized,
    B: AsyncStream + ?Sized,
{
    CopyBidirectional {
        a,
        b,
        a_buf: CopyBuffer::new(RELAY_BUF_SIZE),
        b_buf: CopyBuffer::new(RELAY_BUF_SIZE),
        a_to_b: TransferState::Running,
        b_to_a: TransferState::Running,
    }
    .await
}

/// Bridges two established connections until either side ends, then closes
/// both before returning. Copy and close errors are logged, never raised:
/// a torn-down relay is the normal end of a proxied connection.
pub async fn relay(mut a: Box<dyn AsyncStream>, mut b: Box<dyn AsyncStream>) {
    let copy_result = copy_bidirectional(&mut *a, &mut *b).await;

    let (close_a, close_b) = futures::join!(a.shutdown(), b.shutdown());

    if let Err(e) = copy_result {
        debug!("relay finished with error: {e}");
    }
    if let Err(e) = close_a {
        debug!("closing near side: {e}");
    }
    if let Err(e) = close_b {
        debug!("closing far side: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_relay_copies_both_directions() {
        let (a_near, mut a_far) = tokio::io::duplex(1024);
        let (b_near, mut b_far) = tokio::io::duplex(1024);

        let handle = tokio::spawn(relay(Box::new(a_near), Box::new(b_near)));

        a_far.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        b_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        b_far.write_all(b"pong").await.unwrap();
        a_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(a_far);
        timeout(Duration::from_secs(5), handle)
            .await
            .expect("relay did not finish after one side closed")
            .unwrap();

        // The opposite connection was closed too.
        let n = b_far.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_relay_forwards_large_transfers() {
        let (a_near, mut a_far) = tokio::io::duplex(4096);
        let (b_near, mut b_far) = tokio::io::duplex(4096);

        let handle = tokio::spawn(relay(Box::new(a_near), Box::new(b_near)));

        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let writer = tokio::spawn(async move {
            a_far.write_all(&payload).await.unwrap();
            a_far.shutdown().await.unwrap();
        });

        let mut received = Vec::new();
        b_far.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, expected);

        writer.await.unwrap();
        timeout(Duration::from_secs(5), handle)
            .await
            .expect("relay did not finish")
            .unwrap();
    }
}
