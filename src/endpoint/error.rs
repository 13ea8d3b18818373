//! Error types for endpoint resolution.

use super::{PortOwner, Protocol};
use crate::config::ConfigError;

/// Indicates that two enabled consumers were configured to bind the same local port.
#[derive(Debug, thiserror::Error)]
#[error("local {protocol} port {port} is claimed by both {first} and {second}")]
pub struct PortConflict {
    pub port: u16,
    pub protocol: Protocol,
    pub first: PortOwner,
    pub second: PortOwner,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("invalid configuration")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    PortConflict(#[from] PortConflict),
}
