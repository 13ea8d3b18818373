//! Error types for loading and validating relay configuration.

use std::path::PathBuf;

use crate::channel::{ChannelKind, Side};

/// Errors produced while reading or validating a [`RelayConfig`](super::RelayConfig).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for the relay schema.
    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),

    /// A channel forwards toward a side for which no destination can ever be known.
    #[error("{channel} channel forwards to the {side} side but has no {side} endpoint configured")]
    MissingDestination { channel: ChannelKind, side: Side },

    /// The heartbeat is enabled but has no target and no base station endpoint to fall back on.
    #[error("heartbeat is enabled but no target or telemetry base station endpoint is configured")]
    MissingHeartbeatTarget,

    /// An interval or size that must be positive was zero.
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    /// The configured port-conflict signal is not a known signal name.
    #[error("unknown signal '{0}'")]
    UnknownSignal(String),
}
