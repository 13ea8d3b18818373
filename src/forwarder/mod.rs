//! The channel forwarder: one worker pumping opaque datagrams between the base-station-facing and
//! the drone-facing socket of a channel.
//!
//! The command and telemetry channels are the same worker with different [`Direction`]s. Every
//! datagram arriving on the drone-side socket is offered to the [`EndpointRegistry`] for address
//! learning, whichever way the channel forwards.

pub mod error;

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::channel::{ChannelKind, Direction, Side};
use crate::config::ChannelConfig;
use crate::endpoint::EndpointRegistry;
use crate::net::bind_udp;
use crate::stats::ChannelCounters;

use self::error::BindError;

/// Consecutive receive failures of one forwarder.
#[derive(Debug, Default)]
struct RecvHealth {
    failures: u32,
    degraded: bool,
}

pub struct Forwarder {
    kind: ChannelKind,
    direction: Direction,
    base: UdpSocket,
    drone: UdpSocket,
    registry: Arc<EndpointRegistry>,
    counters: Arc<ChannelCounters>,
    allowed_sources: Vec<IpAddr>,
    send_timeout: Option<Duration>,
    recv_backoff: Duration,
    max_recv_failures: u32,
    log_packets: bool,
    buffer_size: usize,
}

impl Forwarder {
    /// Bind both sockets of the channel. Must be called from within a tokio runtime.
    pub fn bind(
        kind: ChannelKind,
        config: &ChannelConfig,
        buffer_size: usize,
        registry: Arc<EndpointRegistry>,
        counters: Arc<ChannelCounters>,
    ) -> Result<Self, BindError> {
        let bind_side = |side: Side| {
            let addr = config.bind(side);
            bind_udp(addr).map_err(|source| BindError {
                channel: kind,
                side,
                addr,
                source,
            })
        };

        let base = bind_side(Side::BaseStation)?;
        let drone = bind_side(Side::Drone)?;

        Ok(Self {
            kind,
            direction: config.direction(kind),
            base,
            drone,
            registry,
            counters,
            allowed_sources: config.allowed_sources.clone(),
            send_timeout: config.send_timeout(),
            recv_backoff: config.recv_backoff(),
            max_recv_failures: config.max_recv_failures,
            log_packets: config.log_packets,
            buffer_size,
        })
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn local_addr(&self, side: Side) -> io::Result<SocketAddr> {
        self.socket(side).local_addr()
    }

    fn socket(&self, side: Side) -> &UdpSocket {
        match side {
            Side::BaseStation => &self.base,
            Side::Drone => &self.drone,
        }
    }

    fn is_allowed(&self, source: &SocketAddr) -> bool {
        self.allowed_sources.is_empty() || self.allowed_sources.contains(&source.ip())
    }

    /// Pump datagrams until `token` is cancelled. The sockets close when this returns.
    pub async fn run(self, token: CancellationToken) {
        // One spare byte tells an oversized datagram apart from one that fills the buffer exactly.
        let mut base_buf = vec![0u8; self.buffer_size + 1];
        let mut drone_buf = vec![0u8; self.buffer_size + 1];
        let mut health = RecvHealth::default();

        info!(
            channel = %self.kind,
            direction = ?self.direction,
            base = ?self.base.local_addr().ok(),
            drone = ?self.drone.local_addr().ok(),
            "Channel forwarder started"
        );

        loop {
            let (from, received) = tokio::select! {
                _ = token.cancelled() => break,
                received = self.base.recv_from(&mut base_buf) => (Side::BaseStation, received),
                received = self.drone.recv_from(&mut drone_buf) => (Side::Drone, received),
            };

            match received {
                Ok((len, source)) => {
                    self.on_recv_success(&mut health);

                    if len > self.buffer_size {
                        self.counters.record_dropped();
                        warn!(
                            channel = %self.kind,
                            side = %from,
                            %source,
                            buffer_size = self.buffer_size,
                            "Dropped datagram larger than the receive buffer"
                        );
                        continue;
                    }

                    let payload = match from {
                        Side::BaseStation => &base_buf[..len],
                        Side::Drone => &drone_buf[..len],
                    };
                    self.handle_datagram(from, source, payload).await;
                }
                Err(e) => {
                    self.on_recv_failure(&mut health, from, &e);

                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(self.recv_backoff) => {}
                    }
                }
            }
        }

        info!(channel = %self.kind, "Channel forwarder stopped");
    }

    fn on_recv_success(&self, health: &mut RecvHealth) {
        health.failures = 0;
        if health.degraded {
            health.degraded = false;
            self.counters.set_degraded(false);
            info!(channel = %self.kind, "Channel recovered");
        }
    }

    fn on_recv_failure(&self, health: &mut RecvHealth, side: Side, error: &io::Error) {
        health.failures = health.failures.saturating_add(1);
        debug!(channel = %self.kind, %side, %error, failures = health.failures, "Receive failed");

        if health.failures >= self.max_recv_failures && !health.degraded {
            health.degraded = true;
            self.counters.set_degraded(true);
            warn!(channel = %self.kind, %error, failures = health.failures, "Channel degraded");
        }
    }

    async fn handle_datagram(&self, from: Side, source: SocketAddr, payload: &[u8]) {
        if from == Side::Drone {
            self.registry.observe(self.kind, source);
        }

        if !self.direction.forwards_from(from) {
            return;
        }

        if from == Side::BaseStation && !self.is_allowed(&source) {
            self.counters.record_dropped();
            warn!(channel = %self.kind, %source, "Dropped datagram from source not in allowed list");
            return;
        }

        let to = from.opposite();
        let Some(destination) = self.registry.lookup(self.kind, to) else {
            self.counters.record_dropped();
            debug!(channel = %self.kind, side = %to, "No destination known, dropped datagram");
            return;
        };

        match self.send(to, payload, destination.addr).await {
            Ok(sent) => {
                self.counters.record_forwarded(sent);
                if self.log_packets {
                    trace!(
                        channel = %self.kind,
                        %source,
                        destination = %destination.addr,
                        len = sent,
                        "Forwarded datagram"
                    );
                }
            }
            Err(e) => {
                self.counters.record_error();
                warn!(
                    channel = %self.kind,
                    destination = %destination.addr,
                    error = %e,
                    "Failed to forward datagram"
                );
            }
        }
    }

    async fn send(&self, to: Side, payload: &[u8], addr: SocketAddr) -> io::Result<usize> {
        let send = self.socket(to).send_to(payload, addr);

        match self.send_timeout {
            Some(limit) => tokio::time::timeout(limit, send)
                .await
                .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::TimedOut, "send timed out"))),
            None => send.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LearningConfig, LearningMode, RelayConfig};
    use crate::stats::StatsAggregator;

    const WAIT: Duration = Duration::from_secs(2);

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    async fn peer() -> UdpSocket {
        UdpSocket::bind(loopback()).await.unwrap()
    }

    async fn recv(socket: &UdpSocket) -> Option<(Vec<u8>, SocketAddr)> {
        let mut buf = [0u8; 2048];
        let (len, from) = tokio::time::timeout(Duration::from_millis(500), socket.recv_from(&mut buf))
            .await
            .ok()?
            .ok()?;
        Some((buf[..len].to_vec(), from))
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + WAIT;
        while tokio::time::Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    struct Harness {
        forwarder: Forwarder,
        registry: Arc<EndpointRegistry>,
        counters: Arc<ChannelCounters>,
    }

    fn harness(kind: ChannelKind, channel: ChannelConfig) -> Harness {
        harness_with_buffer(kind, channel, 2048)
    }

    fn harness_with_buffer(kind: ChannelKind, channel: ChannelConfig, buffer_size: usize) -> Harness {
        let mut config = RelayConfig::default();
        config.video.enabled = false;
        config.heartbeat.enabled = false;
        config.channels.command.enabled = false;
        config.channels.telemetry.enabled = false;
        match kind {
            ChannelKind::Command => config.channels.command = channel.clone(),
            ChannelKind::Telemetry => config.channels.telemetry = channel.clone(),
            ChannelKind::Video => unreachable!(),
        }

        let registry = Arc::new(EndpointRegistry::resolve(&config).unwrap());
        let stats = StatsAggregator::new();
        let counters = stats.register(kind);
        let forwarder =
            Forwarder::bind(kind, &channel, buffer_size, registry.clone(), counters.clone()).unwrap();

        Harness {
            forwarder,
            registry,
            counters,
        }
    }

    fn static_learning() -> LearningConfig {
        LearningConfig::builder().mode(LearningMode::Static).build()
    }

    #[tokio::test]
    async fn test_command_forwarded_to_drone() {
        let drone = peer().await;
        let base = peer().await;

        let h = harness(
            ChannelKind::Command,
            ChannelConfig::builder()
                .direction(Direction::BaseToDrone)
                .base_bind(loopback())
                .drone_bind(loopback())
                .drone(drone.local_addr().unwrap())
                .learning(static_learning())
                .send_timeout_ms(50)
                .build(),
        );
        let ingress = h.forwarder.local_addr(Side::BaseStation).unwrap();
        let egress = h.forwarder.local_addr(Side::Drone).unwrap();
        let token = CancellationToken::new();
        let task = tokio::spawn(h.forwarder.run(token.clone()));

        base.send_to(b"takeoff", ingress).await.unwrap();
        let (payload, from) = recv(&drone).await.expect("drone receives command");
        assert_eq!(payload, b"takeoff");
        assert_eq!(from, egress);

        base.send_to(b"land", ingress).await.unwrap();
        assert_eq!(recv(&drone).await.unwrap().0, b"land");

        assert!(eventually(|| h.counters.packets() == 2).await);
        assert_eq!(h.counters.bytes(), 11);
        assert_eq!(h.counters.errors(), 0);

        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_telemetry_forwarded_to_base_only() {
        let drone = peer().await;
        let base = peer().await;

        let h = harness(
            ChannelKind::Telemetry,
            ChannelConfig::builder()
                .direction(Direction::DroneToBase)
                .base_bind(loopback())
                .drone_bind(loopback())
                .base_station(base.local_addr().unwrap())
                .learning(static_learning())
                .build(),
        );
        let drone_side = h.forwarder.local_addr(Side::Drone).unwrap();
        let base_side = h.forwarder.local_addr(Side::BaseStation).unwrap();
        let token = CancellationToken::new();
        let task = tokio::spawn(h.forwarder.run(token.clone()));

        drone.send_to(b"bat:87;h:120", drone_side).await.unwrap();
        let (payload, _) = recv(&base).await.expect("base receives telemetry");
        assert_eq!(payload, b"bat:87;h:120");

        // Nothing flows against the channel direction
        base.send_to(b"ignored", base_side).await.unwrap();
        assert!(recv(&drone).await.is_none());
        assert_eq!(h.counters.packets(), 1);
        assert_eq!(h.counters.dropped(), 0);

        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_drone_endpoint_learned_from_traffic() {
        let drone = peer().await;
        let base = peer().await;

        let h = harness(
            ChannelKind::Command,
            ChannelConfig::builder()
                .direction(Direction::BaseToDrone)
                .base_bind(loopback())
                .drone_bind(loopback())
                .build(),
        );
        let ingress = h.forwarder.local_addr(Side::BaseStation).unwrap();
        let drone_side = h.forwarder.local_addr(Side::Drone).unwrap();
        let registry = h.registry.clone();
        let counters = h.counters.clone();
        let token = CancellationToken::new();
        let task = tokio::spawn(h.forwarder.run(token.clone()));

        // No drone known yet
        base.send_to(b"command", ingress).await.unwrap();
        assert!(eventually(|| counters.dropped() == 1).await);

        drone.send_to(b"ok", drone_side).await.unwrap();
        assert!(eventually(|| registry.learned(ChannelKind::Command).is_some()).await);
        assert_eq!(
            registry.learned(ChannelKind::Command).unwrap().addr,
            drone.local_addr().unwrap()
        );

        base.send_to(b"command", ingress).await.unwrap();
        assert_eq!(recv(&drone).await.unwrap().0, b"command");
        assert!(eventually(|| counters.packets() == 1).await);

        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_source_not_in_allowed_list_dropped() {
        let drone = peer().await;
        let base = peer().await;

        let h = harness(
            ChannelKind::Command,
            ChannelConfig::builder()
                .direction(Direction::BaseToDrone)
                .base_bind(loopback())
                .drone_bind(loopback())
                .drone(drone.local_addr().unwrap())
                .allowed_sources(vec!["10.0.0.3".parse().unwrap()])
                .learning(static_learning())
                .build(),
        );
        let ingress = h.forwarder.local_addr(Side::BaseStation).unwrap();
        let counters = h.counters.clone();
        let token = CancellationToken::new();
        let task = tokio::spawn(h.forwarder.run(token.clone()));

        base.send_to(b"command", ingress).await.unwrap();
        assert!(eventually(|| counters.dropped() == 1).await);
        assert!(recv(&drone).await.is_none());
        assert_eq!(counters.packets(), 0);

        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_datagram_dropped_whole() {
        let drone = peer().await;
        let base = peer().await;

        let h = harness_with_buffer(
            ChannelKind::Command,
            ChannelConfig::builder()
                .direction(Direction::BaseToDrone)
                .base_bind(loopback())
                .drone_bind(loopback())
                .drone(drone.local_addr().unwrap())
                .learning(static_learning())
                .build(),
            16,
        );
        let ingress = h.forwarder.local_addr(Side::BaseStation).unwrap();
        let counters = h.counters.clone();
        let token = CancellationToken::new();
        let task = tokio::spawn(h.forwarder.run(token.clone()));

        base.send_to(&[7u8; 32], ingress).await.unwrap();
        assert!(eventually(|| counters.dropped() == 1).await);
        assert!(recv(&drone).await.is_none());
        assert_eq!(counters.packets(), 0);
        assert_eq!(counters.bytes(), 0);

        // A datagram filling the buffer exactly still goes through untouched
        base.send_to(&[9u8; 16], ingress).await.unwrap();
        assert_eq!(recv(&drone).await.unwrap().0, vec![9u8; 16]);
        assert!(eventually(|| counters.bytes() == 16).await);

        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_send_failure_counted_and_forwarding_continues() {
        let drone = peer().await;
        let base = peer().await;

        // The static drone endpoint is IPv6, which the IPv4 socket cannot reach
        let h = harness(
            ChannelKind::Command,
            ChannelConfig::builder()
                .direction(Direction::BaseToDrone)
                .base_bind(loopback())
                .drone_bind(loopback())
                .drone("[::1]:9".parse().unwrap())
                .build(),
        );
        let ingress = h.forwarder.local_addr(Side::BaseStation).unwrap();
        let drone_side = h.forwarder.local_addr(Side::Drone).unwrap();
        let registry = h.registry.clone();
        let counters = h.counters.clone();
        let token = CancellationToken::new();
        let task = tokio::spawn(h.forwarder.run(token.clone()));

        base.send_to(b"arm", ingress).await.unwrap();
        assert!(eventually(|| counters.errors() == 1).await);
        assert_eq!(counters.packets(), 0);

        drone.send_to(b"hello", drone_side).await.unwrap();
        assert!(eventually(|| registry.learned(ChannelKind::Command).is_some()).await);

        base.send_to(b"arm", ingress).await.unwrap();
        assert_eq!(recv(&drone).await.unwrap().0, b"arm");
        assert!(eventually(|| counters.packets() == 1).await);
        assert_eq!(counters.errors(), 1);
        assert!(!task.is_finished());

        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_repeated_receive_failures_degrade_until_success() {
        let h = harness(
            ChannelKind::Telemetry,
            ChannelConfig::builder()
                .direction(Direction::DroneToBase)
                .base_bind(loopback())
                .drone_bind(loopback())
                .base_station(loopback())
                .max_recv_failures(3)
                .build(),
        );
        let forwarder = h.forwarder;
        let mut health = RecvHealth::default();
        let error = io::Error::from(io::ErrorKind::ConnectionRefused);

        forwarder.on_recv_failure(&mut health, Side::Drone, &error);
        forwarder.on_recv_failure(&mut health, Side::Drone, &error);
        assert!(!h.counters.is_degraded());

        forwarder.on_recv_failure(&mut health, Side::Drone, &error);
        assert!(h.counters.is_degraded());
        forwarder.on_recv_failure(&mut health, Side::BaseStation, &error);
        assert!(h.counters.is_degraded());

        forwarder.on_recv_success(&mut health);
        assert!(!h.counters.is_degraded());
        assert_eq!(health.failures, 0);

        // The failure count starts over after a success
        forwarder.on_recv_failure(&mut health, Side::Drone, &error);
        forwarder.on_recv_failure(&mut health, Side::Drone, &error);
        assert!(!h.counters.is_degraded());
    }

    #[tokio::test]
    async fn test_cancellation_closes_sockets() {
        let base = peer().await;
        let h = harness(
            ChannelKind::Telemetry,
            ChannelConfig::builder()
                .direction(Direction::DroneToBase)
                .base_bind(loopback())
                .drone_bind(loopback())
                .base_station(base.local_addr().unwrap())
                .build(),
        );
        let drone_side = h.forwarder.local_addr(Side::Drone).unwrap();
        let token = CancellationToken::new();
        let task = tokio::spawn(h.forwarder.run(token.clone()));

        token.cancel();
        tokio::time::timeout(WAIT, task)
            .await
            .expect("forwarder stops promptly")
            .unwrap();

        // The port is free again once the worker returned
        std::net::UdpSocket::bind(drone_side).unwrap();
    }
}
