//! Error types for the supervised transcoder.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum VideoError {
    #[error("failed to spawn transcoder '{program}'")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to signal transcoder process {pid}")]
    Signal {
        pid: u32,
        #[source]
        source: io::Error,
    },

    #[error("failed to wait for transcoder")]
    Wait(#[source] io::Error),
}
