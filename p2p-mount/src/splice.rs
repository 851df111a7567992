//! Full-duplex byte relay between two streams.

use std::io;

use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

/// Copy `a -> b` and `b -> a` until both directions are done.
///
/// EOF on one side shuts down the write half of the other side and lets the
/// opposite direction carry on. The first I/O error ends both directions.
/// Cancelling `cancel` aborts the relay with [`io::ErrorKind::ConnectionAborted`].
///
/// Both streams are dropped, and so closed, when this returns. On success
/// the result is the number of bytes copied `a -> b` and `b -> a`.
pub async fn splice<A, B>(
    a: A,
    b: B,
    cancel: &CancellationToken,
    buffer_size: usize,
) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let buffer_size = buffer_size.max(1);
    let (a_read, mut a_write) = tokio::io::split(a);
    let (b_read, mut b_write) = tokio::io::split(b);
    let mut a_read = BufReader::with_capacity(buffer_size, a_read);
    let mut b_read = BufReader::with_capacity(buffer_size, b_read);

    let a_to_b = copy_half(&mut a_read, &mut b_write);
    let b_to_a = copy_half(&mut b_read, &mut a_write);

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(io::Error::new(
            io::ErrorKind::ConnectionAborted,
            "session cancelled",
        )),
        copied = async { futures_util::try_join!(a_to_b, b_to_a) } => copied,
    }
}

async fn copy_half<R, W>(reader: &mut R, writer: &mut W) -> io::Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = tokio::io::copy_buf(reader, writer).await?;
    match writer.shutdown().await {
        // the other end is already gone, nothing left to tell it
        Err(e) if e.kind() == io::ErrorKind::NotConnected => {}
        result => result?,
    }
    Ok(copied)
}
