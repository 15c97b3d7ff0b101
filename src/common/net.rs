//! Network utilities

use crate::{Error, Result};
use socket2::SockRef;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::trace;

#[inline]
pub fn configure_tcp_stream(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let sock = SockRef::from(stream);
    let _ = sock.set_keepalive(true);
}

/// Join a host and port, bracketing IPv6 literals.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Splice two streams until both directions are exhausted.
///
/// Each direction runs in its own task and shuts down the write half of its
/// destination once its source reaches EOF, so a half-close on one side does
/// not stall the other. Returns `(client -> upstream, upstream -> client)`
/// byte counts.
pub async fn splice<A, B>(client: A, upstream: B) -> Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let outbound = tokio::spawn(async move {
        let copied = tokio::io::copy(&mut client_read, &mut upstream_write).await;
        let _ = upstream_write.shutdown().await;
        trace!(direction = "client->upstream", ?copied, "copy finished");
        copied
    });

    let inbound = tokio::spawn(async move {
        let copied = tokio::io::copy(&mut upstream_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
        trace!(direction = "upstream->client", ?copied, "copy finished");
        copied
    });

    let (sent, received) = futures::future::join(outbound, inbound).await;
    let sent = flatten(sent)?;
    let received = flatten(received)?;
    Ok((sent, received))
}

fn flatten(joined: std::result::Result<io::Result<u64>, tokio::task::JoinError>) -> Result<u64> {
    match joined {
        Ok(Ok(n)) => Ok(n),
        Ok(Err(e)) => Err(Error::Io(e)),
        Err(e) => Err(Error::internal(format!("copy task failed: {}", e))),
    }
}
