//! Bidirectional byte relay between a client and the backend

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

const COPY_BUFFER_SIZE: usize = 8 * 1024;

/// Bytes relayed in each direction, including sessions cut short by an error
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardStats {
    pub client_to_backend: u64,
    pub backend_to_client: u64,
}

/// Relay bytes between `client` and `backend` until both directions finish.
///
/// Each direction runs until its source reaches end-of-stream or fails, then
/// shuts down the write half of its destination so the peer sees the
/// half-close. The other direction keeps running on its own.
pub async fn forward<C, B>(client: C, backend: B) -> ForwardStats
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut backend_read, mut backend_write) = tokio::io::split(backend);

    let (client_to_backend, backend_to_client) = tokio::join!(
        copy_half(&mut client_read, &mut backend_write, "client->backend"),
        copy_half(&mut backend_read, &mut client_write, "backend->client"),
    );

    ForwardStats {
        client_to_backend,
        backend_to_client,
    }
}

/// Copy until end-of-stream or the first error, returning the bytes written
async fn copy_half<R, W>(reader: &mut R, writer: &mut W, direction: &'static str) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut copied: u64 = 0;

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                trace!(direction, copied, error = %e, "Read ended with error");
                break;
            }
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            trace!(direction, copied, error = %e, "Write ended with error");
            break;
        }
        copied += n as u64;
    }

    let _ = writer.shutdown().await;
    copied
}
