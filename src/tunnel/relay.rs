//! Bidirectional relay between a client connection and a tunnel stream

use crate::pool::BufferPool;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Copy bytes both ways between `a` and `b` until both directions finish
///
/// When one side reaches end-of-stream the other side's write direction is
/// shut down, so data still flowing the opposite way can drain. The first
/// error aborts both directions and drops both ends. Returns the byte
/// counts `(a -> b, b -> a)`.
pub async fn relay<A, B>(a: A, b: B, pool: &BufferPool) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    tokio::try_join!(
        copy_half(&mut a_read, &mut b_write, pool),
        copy_half(&mut b_read, &mut a_write, pool),
    )
}

async fn copy_half<R, W>(reader: &mut R, writer: &mut W, pool: &BufferPool) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = pool.get();
    let mut total = 0u64;

    loop {
        let n = reader.read(&mut buf[..]).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        total += n as u64;
    }

    match writer.shutdown().await {
        Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
        _ => Ok(total),
    }
}
