use std::fmt;

use serde::{Deserialize, Serialize};

/// One logical stream relayed between the base station and the drone.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Command,
    Telemetry,
    Video,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 3] = [
        ChannelKind::Command,
        ChannelKind::Telemetry,
        ChannelKind::Video,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Command => "command",
            ChannelKind::Telemetry => "telemetry",
            ChannelKind::Video => "video",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which party an endpoint or socket faces.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    BaseStation,
    Drone,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::BaseStation => Side::Drone,
            Side::Drone => Side::BaseStation,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::BaseStation => f.write_str("base_station"),
            Side::Drone => f.write_str("drone"),
        }
    }
}

/// Which way datagrams are pumped by a forwarder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    BaseToDrone,
    DroneToBase,
    Bidirectional,
}

impl Direction {
    /// Whether datagrams received from `from` are forwarded to the opposite side.
    pub fn forwards_from(self, from: Side) -> bool {
        matches!(
            (self, from),
            (Direction::Bidirectional, _)
                | (Direction::BaseToDrone, Side::BaseStation)
                | (Direction::DroneToBase, Side::Drone)
        )
    }

    /// The natural direction of a channel kind.
    pub fn default_for(kind: ChannelKind) -> Direction {
        match kind {
            ChannelKind::Command => Direction::BaseToDrone,
            ChannelKind::Telemetry | ChannelKind::Video => Direction::DroneToBase,
        }
    }
}
