//! Error types for starting and stopping the relay.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::config::ConfigError;
use crate::endpoint::error::RegistryError;
use crate::forwarder::error::BindError;
use crate::state_machine::lifecycle::RelayState;

/// Process exit code for a failure to bind a socket at start.
pub const EXIT_BIND_FAILURE: u8 = 2;
/// Process exit code for configuration errors, an already running relay, and other failures.
pub const EXIT_FAILURE: u8 = 1;

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("invalid configuration")]
    Config(#[from] ConfigError),

    #[error("failed to resolve endpoints")]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    PidFile(#[from] PidFileError),

    #[error(transparent)]
    Preflight(#[from] PreflightError),

    #[error(transparent)]
    Bind(#[from] BindError),

    #[error("failed to bind heartbeat socket on {addr}")]
    HeartbeatBind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("cannot start while {0}")]
    InvalidState(RelayState),
}

impl LifecycleError {
    /// The exit code the process should report for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            LifecycleError::Bind(_) | LifecycleError::HeartbeatBind { .. } => EXIT_BIND_FAILURE,
            LifecycleError::Preflight(PreflightError::PortStillHeld { .. })
            | LifecycleError::Preflight(PreflightError::Unavailable { .. }) => EXIT_BIND_FAILURE,
            _ => EXIT_FAILURE,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PidFileError {
    #[error("relay already running with pid {pid}")]
    AlreadyRunning { pid: u32 },

    #[error("failed to access pid file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode pid file {path}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum PreflightError {
    #[error("udp port {port} is still held by pid(s) {pids:?} after SIGKILL")]
    PortStillHeld { port: u16, pids: Vec<u32> },

    /// The port cannot be bound and no process that could be signalled holds it.
    #[error("udp port {port} is unavailable and no foreign holder was found")]
    Unavailable {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("failed to inspect sockets in /proc")]
    Proc(#[source] io::Error),
}
