//! Error types for channel forwarders.

use std::net::SocketAddr;

use crate::channel::{ChannelKind, Side};

/// Indicates that one of a channel's sockets could not be bound.
#[derive(Debug, thiserror::Error)]
#[error("failed to bind {channel} {side} socket on {addr}")]
pub struct BindError {
    pub channel: ChannelKind,
    pub side: Side,
    pub addr: SocketAddr,
    #[source]
    pub source: std::io::Error,
}
