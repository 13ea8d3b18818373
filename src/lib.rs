//! Drone relay core.
//!
//! Bridges three best-effort streams between a base station and a drone on different networks:
//! command datagrams toward the drone, telemetry datagrams toward the base station, and drone
//! video repackaged to RTP by a supervised transcoder. Payloads are never inspected.

pub mod channel;
pub mod config;
pub mod endpoint;
pub mod forwarder;
pub mod heartbeat;
pub mod identity;
pub mod lifecycle;
pub mod logging;
pub mod net;
pub mod state_machine;
pub mod stats;
pub mod sys;
pub mod video;

pub use self::channel::{ChannelKind, Direction, Side};
pub use self::config::RelayConfig;
pub use self::lifecycle::RelaySupervisor;
