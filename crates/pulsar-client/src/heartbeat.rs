// Connection keepalive.
//
// Sends PING whenever nothing was written for a full keepalive interval
// and fails the connection when nothing was received for two intervals.
// Inbound PINGs are answered by the router, not here.
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::warn;

use pulsar_wire::proto::{BaseCommand, CommandPing, CommandType};

use crate::connection::{CommandSender, Connection};

pub(crate) fn spawn(conn: Arc<Connection>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut close = conn.closed_signal();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick fires immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = close.wait() => return,
                _ = ticker.tick() => {}
            }
            if conn.since_last_received() > interval * 2 {
                warn!("no frame received within two keepalive intervals, failing connection");
                conn.close().await;
                return;
            }
            if conn.since_last_sent() >= interval {
                let mut cmd = BaseCommand::of(CommandType::Ping);
                cmd.ping = Some(CommandPing {});
                if conn.send_simple(cmd).await.is_err() {
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use pulsar_wire::Frame;
    use tokio::io::AsyncReadExt;

    fn conn_pair() -> (Arc<Connection>, tokio::io::DuplexStream) {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(local);
        (
            Arc::new(Connection::from_parts(Box::new(reader), Box::new(writer))),
            remote,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connection_pings_on_the_keepalive_interval() {
        let (conn, remote) = conn_pair();
        let interval = Duration::from_millis(100);
        let task = spawn(Arc::clone(&conn), interval);

        let (mut remote_reader, _remote_writer) = tokio::io::split(remote);
        let mut buf = BytesMut::new();
        loop {
            if let Some(frame) = Frame::decode(&mut buf).expect("decode") {
                assert_eq!(frame.command.command_type(), Some(CommandType::Ping));
                break;
            }
            remote_reader.read_buf(&mut buf).await.expect("read");
        }
        conn.close().await;
        task.await.expect("join");
    }

    #[tokio::test(start_paused = true)]
    async fn missing_inbound_frames_fail_the_connection() {
        let (conn, remote) = conn_pair();
        // keep the remote end alive so only the heartbeat can close
        let _remote = remote;
        let interval = Duration::from_millis(50);
        let task = spawn(Arc::clone(&conn), interval);

        let mut closed = conn.closed_signal();
        tokio::time::timeout(Duration::from_secs(5), closed.wait())
            .await
            .expect("connection should be failed by the heartbeat");
        assert!(conn.is_closed());
        task.await.expect("join");
    }
}
