use std::{collections::BTreeMap, fmt, io, net::SocketAddr, sync::Arc};

use parking_lot::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, warn};

pub type ConnectionId = u64;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Handle to one live peer.
///
/// Clones share the same write half; the async mutex around it makes every
/// `send` on a connection run to completion before the next one starts.
#[derive(Clone)]
pub struct Connection {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    writer: Arc<tokio::sync::Mutex<BoxedWriter>>,
    closed: CancellationToken,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// True once the connection was removed from its set or its owner shut down.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }

    pub async fn send(&self, payload: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(payload).await?;
        writer.flush().await
    }

    async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(err) = writer.shutdown().await {
            debug!(connection = self.id, error = ?err, "write half already closed");
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Outcome of one pass of [`ConnectionSet::broadcast`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Removed by someone else after the snapshot was taken.
    pub skipped: usize,
    /// Write failed; the connection was closed and removed.
    pub dropped: usize,
}

/// Insertion-ordered registry of live connections.
///
/// Ids grow monotonically and are never reused, so iterating the map by key
/// yields connections in the order they were registered.
#[derive(Clone, Default)]
pub struct ConnectionSet {
    inner: Arc<Mutex<Registry>>,
}

#[derive(Default)]
struct Registry {
    last_id: ConnectionId,
    entries: BTreeMap<ConnectionId, Connection>,
}

impl ConnectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a write half to the set. The connection's token is a child of
    /// `shutdown`, so cancelling the owner closes every registered connection.
    pub fn register<W>(
        &self,
        writer: W,
        peer: Option<SocketAddr>,
        shutdown: &CancellationToken,
    ) -> Connection
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let mut registry = self.inner.lock();
        registry.last_id += 1;

        let writer: BoxedWriter = Box::new(writer);
        let connection = Connection {
            id: registry.last_id,
            peer,
            writer: Arc::new(tokio::sync::Mutex::new(writer)),
            closed: shutdown.child_token(),
        };
        registry.entries.insert(connection.id, connection.clone());
        connection
    }

    /// Removes `id` and marks it closed. Returns `None` if it was already gone.
    pub fn remove(&self, id: ConnectionId) -> Option<Connection> {
        let removed = self.inner.lock().entries.remove(&id);
        if let Some(connection) = &removed {
            connection.closed.cancel();
        }
        removed
    }

    /// Removes `id` and shuts down its write half. Only the caller that
    /// actually removed the entry performs the shutdown.
    pub async fn close(&self, id: ConnectionId) -> bool {
        match self.remove(id) {
            Some(connection) => {
                connection.shutdown().await;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.inner.lock().entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.inner.lock().entries.keys().copied().collect()
    }

    pub fn snapshot(&self) -> Vec<Connection> {
        self.inner.lock().entries.values().cloned().collect()
    }

    /// Writes `payload` to every connection in the set, one after another.
    ///
    /// Iterates a snapshot, so receive loops may remove entries while the
    /// broadcast is suspended on a write. A slow peer holds up the peers after
    /// it. A failed write closes that connection and the broadcast moves on.
    pub async fn broadcast(&self, payload: &[u8]) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        for connection in self.snapshot() {
            if connection.is_closed() {
                report.skipped += 1;
                continue;
            }

            match connection.send(payload).await {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    warn!(
                        connection = connection.id,
                        peer = ?connection.peer,
                        error = ?err,
                        "write failed, dropping connection"
                    );
                    self.close(connection.id).await;
                    report.dropped += 1;
                }
            }
        }

        report
    }
}

impl fmt::Debug for ConnectionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSet")
            .field("ids", &self.ids())
            .finish()
    }
}
