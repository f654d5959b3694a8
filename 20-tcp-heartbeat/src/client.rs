use std::{future::Future, io, net::SocketAddr};

use anyhow::Result;
use bytes::Bytes;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    select,
    sync::{broadcast, mpsc},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    net::{self, DEFAULT_HOST, DEFAULT_PORT, DEFAULT_READ_BUFFER},
    runtime::{self, Lifecycle},
};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub read_buffer_size: usize,
    /// Half-close the connection once the startup messages are sent instead
    /// of staying connected until the server goes away.
    pub half_close_when_drained: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            read_buffer_size: DEFAULT_READ_BUFFER,
            half_close_when_drained: false,
        }
    }
}

#[derive(Debug, Error)]
#[error("outbound queue is closed")]
pub struct QueueClosed(pub Bytes);

/// Producer side of the client's unbounded FIFO of outgoing payloads.
///
/// Payloads pushed through one handle reach the wire in push order. Once
/// every handle is dropped and the queue drains, the client half-closes.
#[derive(Debug, Clone)]
pub struct OutboundQueue {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl OutboundQueue {
    pub fn push(&self, payload: impl Into<Bytes>) -> Result<(), QueueClosed> {
        self.tx
            .send(payload.into())
            .map_err(|err| QueueClosed(err.0))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub struct Client {
    stream: TcpStream,
    queue: OutboundQueue,
    pending: mpsc::UnboundedReceiver<Bytes>,
    inbound: broadcast::Sender<Bytes>,
    read_buffer_size: usize,
}

impl Client {
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        let stream = net::connect(&config.host, config.port).await?;
        info!(peer = ?stream.peer_addr().ok(), "connected");
        Ok(Self::new(stream, config))
    }

    pub fn new(stream: TcpStream, config: &ClientConfig) -> Self {
        let (tx, pending) = mpsc::unbounded_channel();
        let (inbound, _) = broadcast::channel(256);
        Self {
            stream,
            queue: OutboundQueue { tx },
            pending,
            inbound,
            read_buffer_size: config.read_buffer_size.max(1),
        }
    }

    pub fn queue(&self) -> OutboundQueue {
        self.queue.clone()
    }

    /// Chunks received from the server. Without a subscriber they are discarded.
    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.inbound.subscribe()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    /// Runs the send and receive loops until both stop or `shutdown` resolves.
    ///
    /// End-of-stream from the server stops the send loop too, dropping any
    /// payloads still queued. The queue closing only half-closes the
    /// connection; the receive loop keeps going until the server closes.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Client {
            stream,
            queue,
            pending,
            inbound,
            read_buffer_size,
        } = self;
        // Only handles given out by `queue()` keep the send loop alive.
        drop(queue);

        let lifecycle = Lifecycle::new();
        let (reader, writer) = stream.into_split();
        lifecycle.spawn(receive_loop(
            reader,
            inbound,
            read_buffer_size,
            lifecycle.token(),
        ));
        lifecycle.spawn(send_loop(writer, pending, lifecycle.token()));

        tokio::pin!(shutdown);
        select! {
            _ = &mut shutdown => info!("client shutting down"),
            _ = lifecycle.finished() => debug!("connection finished"),
        }

        lifecycle.shutdown().await;
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(runtime::ctrl_c()).await
    }
}

async fn receive_loop<R>(
    mut reader: R,
    inbound: broadcast::Sender<Bytes>,
    read_buffer_size: usize,
    connection: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; read_buffer_size];

    loop {
        select! {
            _ = connection.cancelled() => break,
            chunk = net::read_chunk(&mut reader, &mut buf) => match chunk {
                Ok(Some(bytes)) => {
                    debug!(len = bytes.len(), ?bytes, "received bytes");
                    let _ = inbound.send(bytes);
                }
                Ok(None) => {
                    info!("server closed the connection");
                    break;
                }
                Err(err) => {
                    warn!(error = ?err, "read failed");
                    break;
                }
            }
        }
    }

    connection.cancel();
}

async fn send_loop<W>(
    mut writer: W,
    mut pending: mpsc::UnboundedReceiver<Bytes>,
    connection: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let payload = select! {
            _ = connection.cancelled() => break,
            next = pending.recv() => match next {
                Some(payload) => payload,
                None => {
                    debug!("outbound queue closed, half-closing connection");
                    if let Err(err) = writer.shutdown().await {
                        debug!(error = ?err, "failed to half-close connection");
                    }
                    return;
                }
            }
        };

        if payload.is_empty() {
            continue;
        }

        select! {
            _ = connection.cancelled() => break,
            written = write_payload(&mut writer, &payload) => match written {
                Ok(()) => debug!(len = payload.len(), "sent message"),
                Err(err) => {
                    warn!(error = ?err, "failed to send message, closing connection");
                    connection.cancel();
                    break;
                }
            }
        }
    }

    if !pending.is_empty() {
        debug!(unsent = pending.len(), "dropping queued messages");
    }
}

async fn write_payload<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(payload).await?;
    writer.flush().await
}

/// Connects, queues `messages`, and runs until the connection ends or Ctrl-C.
///
/// Blocks the calling thread. Connect errors surface before any task runs.
pub fn start(config: &ClientConfig, messages: Vec<Bytes>) -> Result<()> {
    runtime::block_on(async {
        let client = Client::connect(config).await?;
        let queue = client.queue();
        for message in messages {
            queue.push(message)?;
        }

        if config.half_close_when_drained {
            drop(queue);
            client.run_until_ctrl_c().await
        } else {
            let result = client.run_until_ctrl_c().await;
            drop(queue);
            result
        }
    })?
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{
        io::{AsyncReadExt, duplex, split},
        time::timeout,
    };

    use super::*;

    #[tokio::test]
    async fn send_loop_writes_in_fifo_order_and_skips_empty_items() {
        let (tx, pending) = mpsc::unbounded_channel();
        let queue = OutboundQueue { tx };
        let (writer, mut peer) = duplex(64);

        queue.push("P1").expect("push");
        queue.push(Bytes::new()).expect("push");
        queue.push("P2").expect("push");
        drop(queue);

        send_loop(writer, pending, CancellationToken::new()).await;

        let mut received = Vec::new();
        peer.read_to_end(&mut received).await.expect("read");
        assert_eq!(received, b"P1P2");
    }

    #[tokio::test]
    async fn push_after_receiver_is_gone_returns_the_payload() {
        let (tx, pending) = mpsc::unbounded_channel();
        let queue = OutboundQueue { tx };
        drop(pending);

        assert!(queue.is_closed());
        let err = queue.push("late").expect_err("queue is closed");
        assert_eq!(err.0, Bytes::from_static(b"late"));
    }

    #[tokio::test]
    async fn failed_write_cancels_the_connection() {
        let (tx, pending) = mpsc::unbounded_channel();
        let queue = OutboundQueue { tx };
        let (writer, peer) = duplex(64);
        drop(peer);
        let connection = CancellationToken::new();

        queue.push("doomed").expect("push");
        timeout(
            Duration::from_secs(1),
            send_loop(writer, pending, connection.clone()),
        )
        .await
        .expect("send loop should stop after a failed write");
        assert!(connection.is_cancelled());
    }

    #[tokio::test]
    async fn end_of_stream_cancels_the_connection() {
        let (inbound, mut chunks) = broadcast::channel(16);
        let (client_side, mut server_side) = duplex(64);
        let (reader, _writer) = split(client_side);
        let connection = CancellationToken::new();

        server_side.write_all(b"PING").await.expect("write");
        drop(server_side);

        receive_loop(reader, inbound, 16, connection.clone()).await;

        assert!(connection.is_cancelled());
        assert_eq!(chunks.recv().await.expect("chunk"), Bytes::from_static(b"PING"));
    }
}
