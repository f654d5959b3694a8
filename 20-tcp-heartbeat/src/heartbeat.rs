use std::time::Duration;

use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::registry::ConnectionSet;

pub const HEARTBEAT_PAYLOAD: &[u8] = b"PING";
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Sleeps `interval`, probes every live connection, repeats until `shutdown`.
///
/// A tick that is still writing when shutdown arrives is abandoned, so a
/// stalled peer never keeps the server from stopping.
pub async fn run_heartbeat(set: ConnectionSet, interval: Duration, shutdown: CancellationToken) {
    loop {
        select! {
            _ = shutdown.cancelled() => break,
            _ = time::sleep(interval) => {}
        }

        debug!(connections = set.len(), "sending heartbeat");
        select! {
            _ = shutdown.cancelled() => break,
            report = set.broadcast(HEARTBEAT_PAYLOAD) => {
                if report.dropped > 0 {
                    warn!(dropped = report.dropped, "heartbeat dropped unreachable peers");
                }
            }
        }
    }

    debug!("heartbeat stopped");
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, duplex};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn probes_every_interval() {
        let set = ConnectionSet::new();
        let shutdown = CancellationToken::new();
        let (writer, mut reader) = duplex(64);
        set.register(writer, None, &shutdown);

        let heartbeat = tokio::spawn(run_heartbeat(
            set.clone(),
            Duration::from_secs(5),
            shutdown.clone(),
        ));

        let mut probe = [0u8; 4];
        reader.read_exact(&mut probe).await.expect("first probe");
        assert_eq!(&probe, HEARTBEAT_PAYLOAD);

        reader.read_exact(&mut probe).await.expect("second probe");
        assert_eq!(&probe, HEARTBEAT_PAYLOAD);

        shutdown.cancel();
        heartbeat.await.expect("heartbeat task");
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_is_sent_before_the_first_interval() {
        let set = ConnectionSet::new();
        let shutdown = CancellationToken::new();
        let (writer, mut reader) = duplex(64);
        set.register(writer, None, &shutdown);

        let heartbeat = tokio::spawn(run_heartbeat(
            set.clone(),
            Duration::from_secs(5),
            shutdown.clone(),
        ));

        let mut probe = [0u8; 4];
        let early = time::timeout(Duration::from_secs(4), reader.read_exact(&mut probe)).await;
        assert!(early.is_err(), "probe arrived before the interval elapsed");

        shutdown.cancel();
        heartbeat.await.expect("heartbeat task");
    }

    #[tokio::test]
    async fn shutdown_interrupts_a_stalled_tick() {
        let set = ConnectionSet::new();
        let shutdown = CancellationToken::new();
        // Nobody reads this one, so the probe stalls after a single byte.
        let (writer, _stalled) = duplex(1);
        set.register(writer, None, &shutdown);

        let heartbeat = tokio::spawn(run_heartbeat(
            set.clone(),
            Duration::from_millis(10),
            shutdown.clone(),
        ));

        time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        time::timeout(Duration::from_secs(1), heartbeat)
            .await
            .expect("heartbeat should stop while a write is stalled")
            .expect("heartbeat task");
    }
}
