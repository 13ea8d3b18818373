//! Periodic relay health reports sent to the base station.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bon::Builder;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::identity::{InstanceId, RelayId};
use crate::state_machine::lifecycle::RelayState;
use crate::stats::{StatisticsSnapshot, StatsAggregator};

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Heartbeat,
}

/// One heartbeat datagram, encoded as a single JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub schema_version: u32,
    pub relay_id: RelayId,
    pub instance_id: InstanceId,
    pub state: RelayState,
    pub timestamp: DateTime<Utc>,
    pub statistics: StatisticsSnapshot,
}

impl HeartbeatMessage {
    pub fn new(
        relay_id: RelayId,
        instance_id: InstanceId,
        state: RelayState,
        statistics: StatisticsSnapshot,
    ) -> Self {
        Self {
            message_type: MessageType::Heartbeat,
            schema_version: SCHEMA_VERSION,
            relay_id,
            instance_id,
            state,
            timestamp: Utc::now(),
            statistics,
        }
    }

    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }
}

/// Sends a [`HeartbeatMessage`] every `interval`, starting one interval after [`run`](Self::run).
///
/// Failed sends are counted and logged but never retried.
#[derive(Builder)]
pub struct HeartbeatReporter {
    socket: UdpSocket,
    target: SocketAddr,
    interval: Duration,
    relay_id: RelayId,
    instance_id: InstanceId,
    stats: Arc<StatsAggregator>,
    state: watch::Receiver<RelayState>,
}

impl HeartbeatReporter {
    pub async fn run(self, token: CancellationToken) {
        let start = tokio::time::Instant::now() + self.interval;
        let mut ticker = tokio::time::interval_at(start, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(target_addr = %self.target, interval_secs = self.interval.as_secs_f64(), "Heartbeat reporter started");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => self.beat().await,
            }
        }

        debug!("Heartbeat reporter stopped");
    }

    async fn beat(&self) {
        let snapshot = self.stats.snapshot();
        let state = *self.state.borrow();
        let message = HeartbeatMessage::new(
            self.relay_id.clone(),
            self.instance_id,
            state,
            snapshot.clone(),
        );

        let sent = match message.encode() {
            Ok(payload) => self
                .socket
                .send_to(&payload, self.target)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        match sent {
            Ok(_) => self.stats.record_heartbeat_sent(),
            Err(e) => {
                self.stats.record_heartbeat_error();
                warn!(target_addr = %self.target, error = %e, "Failed to send heartbeat");
            }
        }

        info!(relay = %self.relay_id, %state, "{snapshot}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelKind;

    async fn reporter(
        target: SocketAddr,
        interval: Duration,
        stats: Arc<StatsAggregator>,
    ) -> (HeartbeatReporter, watch::Sender<RelayState>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (state_tx, state_rx) = watch::channel(RelayState::Running);
        let reporter = HeartbeatReporter::builder()
            .socket(socket)
            .target(target)
            .interval(interval)
            .relay_id(RelayId::from("pi-relay"))
            .instance_id(InstanceId::generate())
            .stats(stats)
            .state(state_rx)
            .build();
        (reporter, state_tx)
    }

    #[test]
    fn test_message_schema() {
        let stats = StatsAggregator::new();
        stats.register(ChannelKind::Telemetry).record_forwarded(42);

        let message = HeartbeatMessage::new(
            RelayId::from("pi-relay"),
            InstanceId::generate(),
            RelayState::Running,
            stats.snapshot(),
        );
        let value: serde_json::Value = serde_json::from_slice(&message.encode().unwrap()).unwrap();

        assert_eq!(value["type"], "heartbeat");
        assert_eq!(value["schema_version"], 1);
        assert_eq!(value["relay_id"], "pi-relay");
        assert_eq!(value["state"], "running");
        assert_eq!(value["statistics"]["channels"][0]["channel"], "telemetry");
        assert_eq!(value["statistics"]["channels"][0]["bytes"], 42);

        let timestamp = value["timestamp"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(timestamp).is_ok());
    }

    #[tokio::test]
    async fn test_heartbeats_sent_periodically() {
        let base = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let stats = Arc::new(StatsAggregator::new());
        let (reporter, _state) = reporter(
            base.local_addr().unwrap(),
            Duration::from_millis(50),
            stats.clone(),
        )
        .await;
        let token = CancellationToken::new();
        let task = tokio::spawn(reporter.run(token.clone()));

        let mut buf = [0u8; 4096];
        for _ in 0..2 {
            let (len, _) = tokio::time::timeout(Duration::from_secs(2), base.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            let message: HeartbeatMessage = serde_json::from_slice(&buf[..len]).unwrap();
            assert_eq!(message.message_type, MessageType::Heartbeat);
            assert_eq!(message.state, RelayState::Running);
        }

        token.cancel();
        task.await.unwrap();
        assert!(stats.snapshot().heartbeats_sent >= 2);
    }

    #[tokio::test]
    async fn test_first_heartbeat_after_one_interval() {
        let base = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let stats = Arc::new(StatsAggregator::new());
        let (reporter, _state) = reporter(
            base.local_addr().unwrap(),
            Duration::from_secs(30),
            stats.clone(),
        )
        .await;
        let token = CancellationToken::new();
        let task = tokio::spawn(reporter.run(token.clone()));

        let mut buf = [0u8; 4096];
        let early = tokio::time::timeout(Duration::from_millis(200), base.recv_from(&mut buf)).await;
        assert!(early.is_err());

        token.cancel();
        task.await.unwrap();
        assert_eq!(stats.snapshot().heartbeats_sent, 0);
    }

    #[tokio::test]
    async fn test_send_failure_counted() {
        let stats = Arc::new(StatsAggregator::new());
        // An IPv4 socket cannot reach an IPv6 target
        let (reporter, _state) = reporter(
            "[::1]:9".parse().unwrap(),
            Duration::from_millis(20),
            stats.clone(),
        )
        .await;
        let token = CancellationToken::new();
        let task = tokio::spawn(reporter.run(token.clone()));

        for _ in 0..200 {
            if stats.snapshot().heartbeat_errors > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        token.cancel();
        task.await.unwrap();
        let snapshot = stats.snapshot();
        assert!(snapshot.heartbeat_errors > 0);
        assert_eq!(snapshot.heartbeats_sent, 0);
    }
}
