use std::{future::Future, io, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use bytes::Bytes;
use tokio::{
    io::AsyncRead,
    net::{TcpListener, TcpStream},
    select,
    sync::broadcast,
};
use tracing::{debug, info, warn};

use crate::{
    heartbeat::{self, DEFAULT_HEARTBEAT_INTERVAL},
    net::{self, DEFAULT_HOST, DEFAULT_PORT, DEFAULT_READ_BUFFER},
    registry::{Connection, ConnectionId, ConnectionSet},
    runtime::{self, Lifecycle},
};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub heartbeat_interval: Duration,
    pub read_buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            read_buffer_size: DEFAULT_READ_BUFFER,
        }
    }
}

/// A chunk of bytes read from one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub connection: ConnectionId,
    pub bytes: Bytes,
}

pub struct Server {
    listener: TcpListener,
    state: Arc<ServerState>,
    heartbeat_interval: Duration,
}

struct ServerState {
    connections: ConnectionSet,
    inbound: broadcast::Sender<Inbound>,
    read_buffer_size: usize,
}

impl Server {
    pub async fn bind(config: &ServerConfig) -> Result<Self> {
        let listener = net::bind_listener(&config.host, config.port).await?;
        Ok(Self::new(listener, config))
    }

    pub fn new(listener: TcpListener, config: &ServerConfig) -> Self {
        // Received bytes are otherwise discarded; with no subscriber the send is a no-op.
        let (inbound, _) = broadcast::channel(256);
        Self {
            listener,
            state: Arc::new(ServerState {
                connections: ConnectionSet::new(),
                inbound,
                read_buffer_size: config.read_buffer_size.max(1),
            }),
            heartbeat_interval: config.heartbeat_interval,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn connections(&self) -> ConnectionSet {
        self.state.connections.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Inbound> {
        self.state.inbound.subscribe()
    }

    /// Accepts connections and runs the heartbeat until `shutdown` resolves,
    /// then waits for every receive loop and the heartbeat to stop.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            state,
            heartbeat_interval,
        } = self;
        let lifecycle = Lifecycle::new();
        tokio::pin!(shutdown);

        lifecycle.spawn(heartbeat::run_heartbeat(
            state.connections.clone(),
            heartbeat_interval,
            lifecycle.token(),
        ));

        loop {
            select! {
                _ = &mut shutdown => break,
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state, &lifecycle);
                }
            }
        }

        info!(
            connections = state.connections.len(),
            "server shutting down"
        );
        lifecycle.shutdown().await;
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(runtime::ctrl_c()).await
    }
}

fn handle_accept_result(
    result: io::Result<(TcpStream, SocketAddr)>,
    state: &Arc<ServerState>,
    lifecycle: &Lifecycle,
) {
    match result {
        Ok((stream, peer)) => spawn_receive_loop(stream, peer, state, lifecycle),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_receive_loop(
    stream: TcpStream,
    peer: SocketAddr,
    state: &Arc<ServerState>,
    lifecycle: &Lifecycle,
) {
    let (reader, writer) = stream.into_split();
    // Registered before its receive loop exists, so the next heartbeat sees it.
    let connection = state
        .connections
        .register(writer, Some(peer), &lifecycle.token());
    info!(connection = connection.id(), %peer, "connection accepted");

    lifecycle.spawn(receive_loop(reader, connection, Arc::clone(state)));
}

async fn receive_loop<R>(mut reader: R, connection: Connection, state: Arc<ServerState>)
where
    R: AsyncRead + Unpin,
{
    let id = connection.id();
    let mut buf = vec![0u8; state.read_buffer_size];

    loop {
        select! {
            _ = connection.closed() => break,
            chunk = net::read_chunk(&mut reader, &mut buf) => match chunk {
                Ok(Some(bytes)) => {
                    debug!(connection = id, len = bytes.len(), ?bytes, "received bytes");
                    let _ = state.inbound.send(Inbound { connection: id, bytes });
                }
                Ok(None) => {
                    debug!(connection = id, "peer closed the connection");
                    break;
                }
                Err(err) => {
                    warn!(connection = id, error = ?err, "read failed");
                    break;
                }
            }
        }
    }

    if state.connections.close(id).await {
        info!(connection = id, peer = ?connection.peer(), "connection closed");
    }
}

/// Binds, serves until Ctrl-C, and returns once every task has exited.
///
/// Blocks the calling thread. Bind errors surface before any task runs.
pub fn start(config: &ServerConfig) -> Result<()> {
    runtime::block_on(async {
        let server = Server::bind(config).await?;
        info!("server listening on {}", server.local_addr()?);
        server.run_until_ctrl_c().await
    })?
}
