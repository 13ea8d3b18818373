use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use bon::Builder;
use serde::{Deserialize, Serialize};

use crate::channel::{ChannelKind, Direction, Side};

use super::error::ConfigError;

pub(crate) const UNSPECIFIED: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);

/// How the drone-side peer of a channel may be discovered from inbound traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningMode {
    /// Only the statically configured endpoint is ever used.
    Static,
    /// The first observed source is kept until restart or explicit invalidation.
    #[default]
    FirstSeen,
    /// Every new source replaces the previously learned one.
    FollowLatest,
    /// A new source replaces the current one only after the current peer went silent.
    HoldOff,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Builder)]
#[serde(default)]
pub struct LearningConfig {
    #[builder(default)]
    pub mode: LearningMode,

    /// Silence required from the current peer before `hold_off` lets a new source take over.
    #[builder(default = 5000)]
    pub hold_off_ms: u64,

    /// When non-empty, only sources with these IPs can be learned.
    #[builder(default)]
    pub allowed_ips: Vec<IpAddr>,
}

impl LearningConfig {
    pub fn hold_off(&self) -> Duration {
        Duration::from_millis(self.hold_off_ms)
    }
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Configuration for one forwarded channel (command or telemetry).
///
/// Every channel owns two sockets: `base_bind` faces the base station and `drone_bind` faces the
/// drone. A bind address with port 0 gets an ephemeral port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
#[serde(default)]
pub struct ChannelConfig {
    #[builder(default = true)]
    pub enabled: bool,

    /// Defaults to the natural direction of the channel kind when omitted.
    pub direction: Option<Direction>,

    #[builder(default = UNSPECIFIED)]
    pub base_bind: SocketAddr,

    #[builder(default = UNSPECIFIED)]
    pub drone_bind: SocketAddr,

    /// Static base station endpoint.
    pub base_station: Option<SocketAddr>,

    /// Static drone endpoint; may be absent when the drone address is learned.
    pub drone: Option<SocketAddr>,

    /// Base station source IPs allowed to send on this channel. Empty allows all.
    #[builder(default)]
    pub allowed_sources: Vec<IpAddr>,

    /// Upper bound for a single send; a send that does not complete in time is dropped.
    pub send_timeout_ms: Option<u64>,

    #[builder(default = 100)]
    pub recv_backoff_ms: u64,

    /// Consecutive receive failures after which the channel is reported degraded.
    #[builder(default = 5)]
    pub max_recv_failures: u32,

    #[builder(default)]
    pub learning: LearningConfig,

    /// Emit a trace event for every forwarded datagram.
    #[builder(default)]
    pub log_packets: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ChannelConfig {
    pub fn direction(&self, kind: ChannelKind) -> Direction {
        self.direction.unwrap_or_else(|| Direction::default_for(kind))
    }

    pub fn bind(&self, side: Side) -> SocketAddr {
        match side {
            Side::BaseStation => self.base_bind,
            Side::Drone => self.drone_bind,
        }
    }

    pub fn remote(&self, side: Side) -> Option<SocketAddr> {
        match side {
            Side::BaseStation => self.base_station,
            Side::Drone => self.drone,
        }
    }

    pub fn send_timeout(&self) -> Option<Duration> {
        self.send_timeout_ms.map(Duration::from_millis)
    }

    pub fn recv_backoff(&self) -> Duration {
        Duration::from_millis(self.recv_backoff_ms)
    }

    pub(crate) fn validate(&self, kind: ChannelKind) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }

        let direction = self.direction(kind);

        if direction.forwards_from(Side::BaseStation)
            && self.drone.is_none()
            && self.learning.mode == LearningMode::Static
        {
            return Err(ConfigError::MissingDestination {
                channel: kind,
                side: Side::Drone,
            });
        }

        if direction.forwards_from(Side::Drone) && self.base_station.is_none() {
            return Err(ConfigError::MissingDestination {
                channel: kind,
                side: Side::BaseStation,
            });
        }

        if self.max_recv_failures == 0 {
            return Err(ConfigError::Zero("max_recv_failures"));
        }

        Ok(())
    }
}

/// The forwarded channels. Video is configured separately since it is relayed by a subprocess.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    pub command: ChannelConfig,
    pub telemetry: ChannelConfig,
}

impl ChannelsConfig {
    pub fn get(&self, kind: ChannelKind) -> Option<&ChannelConfig> {
        match kind {
            ChannelKind::Command => Some(&self.command),
            ChannelKind::Telemetry => Some(&self.telemetry),
            ChannelKind::Video => None,
        }
    }

    /// Enabled forwarded channels in a stable order.
    pub fn enabled(&self) -> impl Iterator<Item = (ChannelKind, &ChannelConfig)> {
        [
            (ChannelKind::Command, &self.command),
            (ChannelKind::Telemetry, &self.telemetry),
        ]
        .into_iter()
        .filter(|(_, config)| config.enabled)
    }
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            command: ChannelConfig::builder()
                .direction(Direction::BaseToDrone)
                .base_bind(SocketAddr::from(([0, 0, 0, 0], 8889)))
                .drone(SocketAddr::from(([192, 168, 10, 1], 8889)))
                .send_timeout_ms(50)
                .build(),
            telemetry: ChannelConfig::builder()
                .direction(Direction::DroneToBase)
                .drone_bind(SocketAddr::from(([0, 0, 0, 0], 8888)))
                .base_station(SocketAddr::from(([10, 0, 0, 3], 8888)))
                .build(),
        }
    }
}
