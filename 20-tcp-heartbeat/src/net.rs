use std::{io, net::SocketAddr};

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    net::{TcpListener, TcpSocket, TcpStream, lookup_host},
};

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 9527;
/// Upper bound on bytes taken per read. Not a message boundary.
pub const DEFAULT_READ_BUFFER: usize = 1024;

const LISTEN_BACKLOG: u32 = 1024;

/// Resolves `host:port`, keeping the first address the resolver returns.
pub async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    lookup_host((host, port))
        .await
        .with_context(|| format!("failed to resolve {host}:{port}"))?
        .next()
        .with_context(|| format!("no address found for {host}:{port}"))
}

/// Binds and listens on `host:port` with `SO_REUSEADDR` set, so a restarted
/// server does not trip over sockets still lingering in `TIME_WAIT`.
pub async fn bind_listener(host: &str, port: u16) -> Result<TcpListener> {
    let addr = resolve(host, port).await?;
    let socket =
        reusable_socket(addr).with_context(|| format!("failed to create socket for {addr}"))?;
    socket
        .bind(addr)
        .with_context(|| format!("failed to bind {addr}"))?;
    socket
        .listen(LISTEN_BACKLOG)
        .with_context(|| format!("failed to listen on {addr}"))
}

/// Opens an outbound connection to `host:port` from a socket with
/// `SO_REUSEADDR` set.
pub async fn connect(host: &str, port: u16) -> Result<TcpStream> {
    let addr = resolve(host, port).await?;
    let socket =
        reusable_socket(addr).with_context(|| format!("failed to create socket for {addr}"))?;
    socket
        .connect(addr)
        .await
        .with_context(|| format!("failed to connect to {addr}"))
}

/// Waits for the next chunk of bytes. `Ok(None)` is end-of-stream.
///
/// No reassembly happens here: a chunk may hold part of what the peer wrote,
/// or pieces of several writes. Cancel safe.
pub async fn read_chunk<R>(reader: &mut R, buf: &mut [u8]) -> io::Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    match reader.read(buf).await? {
        0 => Ok(None),
        n => Ok(Some(Bytes::copy_from_slice(&buf[..n]))),
    }
}

fn reusable_socket(addr: SocketAddr) -> std::io::Result<TcpSocket> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncWriteExt, duplex};

    use super::*;

    #[tokio::test]
    async fn read_chunk_is_bounded_by_the_buffer() -> Result<()> {
        let (mut writer, mut reader) = duplex(64);
        writer.write_all(b"Test Message!").await?;
        drop(writer);

        let mut buf = [0u8; 8];
        let first = read_chunk(&mut reader, &mut buf).await?;
        let second = read_chunk(&mut reader, &mut buf).await?;
        let end = read_chunk(&mut reader, &mut buf).await?;

        assert_eq!(first.as_deref(), Some(&b"Test Mes"[..]));
        assert_eq!(second.as_deref(), Some(&b"sage!"[..]));
        assert_eq!(end, None);
        Ok(())
    }

    #[tokio::test]
    async fn listener_accepts_outbound_connection() -> Result<()> {
        let listener = bind_listener("127.0.0.1", 0).await?;
        let addr = listener.local_addr()?;

        let (accepted, connected) =
            tokio::join!(listener.accept(), connect("127.0.0.1", addr.port()));
        let (_, peer) = accepted?;
        assert_eq!(peer, connected?.local_addr()?);
        Ok(())
    }

    #[tokio::test]
    async fn binding_a_live_address_twice_fails() -> Result<()> {
        let listener = bind_listener("127.0.0.1", 0).await?;
        let port = listener.local_addr()?.port();

        let err = bind_listener("127.0.0.1", port)
            .await
            .expect_err("second listener on the same address should fail");
        assert!(err.to_string().contains("failed to bind"));
        Ok(())
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() -> Result<()> {
        let port = {
            let listener = bind_listener("127.0.0.1", 0).await?;
            listener.local_addr()?.port()
        };

        assert!(connect("127.0.0.1", port).await.is_err());
        Ok(())
    }
}
