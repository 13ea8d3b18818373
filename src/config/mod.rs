//! Relay configuration.
//!
//! Loaded from a TOML file at start and re-read on every restart. Every section and field has a
//! default matching a stock Raspberry Pi relay deployment, so a config file only needs to list
//! what differs.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bon::Builder;
use serde::{Deserialize, Serialize};

use crate::channel::ChannelKind;
use crate::identity::RelayId;
use crate::sys::parse_signal;

pub mod channel;
pub mod error;

pub use self::channel::{ChannelConfig, ChannelsConfig, LearningConfig, LearningMode};
pub use self::error::ConfigError;

/// Top-level relay configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub relay: RelaySection,
    pub runtime: RuntimeConfig,
    pub logging: LoggingConfig,
    pub port_conflict: PortConflictConfig,
    pub channels: ChannelsConfig,
    pub video: VideoConfig,
    pub heartbeat: HeartbeatConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
#[serde(default)]
pub struct RelaySection {
    /// Relay identity reported to the base station.
    #[builder(into, default = "drone-relay".to_string())]
    pub name: String,

    /// Bound on how long stop waits for workers before reclaiming them forcibly.
    #[builder(default = 5000)]
    pub shutdown_timeout_ms: u64,

    /// Receive buffer size for forwarded datagrams.
    #[builder(default = 65536)]
    pub buffer_size: usize,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Paths for the liveness marker and the status file read by external tooling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
#[serde(default)]
pub struct RuntimeConfig {
    #[builder(into, default = PathBuf::from("/tmp/drone-relay/drone-relay.pid"))]
    pub pid_file: PathBuf,

    #[builder(into, default = PathBuf::from("/tmp/drone-relay/status.json"))]
    pub status_file: PathBuf,

    #[builder(default = 5)]
    pub status_interval_secs: u64,
}

impl RuntimeConfig {
    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence when set.
    #[builder(into, default = "info".to_string())]
    pub level: String,

    #[builder(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Pre-flight handling of foreign processes holding one of the relay's ports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
#[serde(default)]
pub struct PortConflictConfig {
    #[builder(default = true)]
    pub enabled: bool,

    /// Signal sent to a process holding a configured port.
    #[builder(into, default = "SIGTERM".to_string())]
    pub signal: String,

    /// How long to wait for the port to be released before escalating to SIGKILL.
    #[builder(default = 2000)]
    pub release_timeout_ms: u64,
}

impl PortConflictConfig {
    pub fn release_timeout(&self) -> Duration {
        Duration::from_millis(self.release_timeout_ms)
    }
}

impl Default for PortConflictConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// The supervised video transcoder.
///
/// `args` entries may contain `{input_port}`, `{output_host}`, `{output_port}`,
/// `{input_format}`, `{output_format}` and `{pkt_size}` placeholders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
#[serde(default)]
pub struct VideoConfig {
    #[builder(default = true)]
    pub enabled: bool,

    /// Local UDP port on which the drone delivers raw video to the transcoder.
    #[builder(default = 11111)]
    pub input_port: u16,

    /// Base station RTP target.
    #[builder(default = SocketAddr::from(([10, 0, 0, 3], 5000)))]
    pub output: SocketAddr,

    #[builder(into, default = "h264".to_string())]
    pub input_format: String,

    #[builder(into, default = "rtp".to_string())]
    pub output_format: String,

    #[builder(default = 1500)]
    pub pkt_size: u32,

    #[builder(into, default = "ffmpeg".to_string())]
    pub program: String,

    #[builder(default = default_transcoder_args())]
    pub args: Vec<String>,

    #[builder(default = 2000)]
    pub restart_backoff_ms: u64,

    #[builder(default = 30_000)]
    pub max_backoff_ms: u64,

    /// Restarts allowed inside `restart_window_secs` before video is marked failed.
    #[builder(default = 5)]
    pub max_restarts: u32,

    #[builder(default = 300)]
    pub restart_window_secs: u64,

    /// Grace period between SIGTERM and SIGKILL on shutdown.
    #[builder(default = 5000)]
    pub terminate_timeout_ms: u64,
}

impl VideoConfig {
    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_millis(self.terminate_timeout_ms)
    }

    /// Expand the placeholders in `args` for this configuration.
    pub fn expanded_args(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{input_port}", &self.input_port.to_string())
                    .replace("{output_host}", &self.output.ip().to_string())
                    .replace("{output_port}", &self.output.port().to_string())
                    .replace("{input_format}", &self.input_format)
                    .replace("{output_format}", &self.output_format)
                    .replace("{pkt_size}", &self.pkt_size.to_string())
            })
            .collect()
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

fn default_transcoder_args() -> Vec<String> {
    [
        "-hide_banner",
        "-loglevel",
        "error",
        "-nostats",
        "-progress",
        "pipe:1",
        "-f",
        "{input_format}",
        "-i",
        "udp://0.0.0.0:{input_port}?fifo_size=1000000&overrun_nonfatal=1",
        "-c",
        "copy",
        "-f",
        "{output_format}",
        "rtp://{output_host}:{output_port}?pkt_size={pkt_size}",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
#[serde(default)]
pub struct HeartbeatConfig {
    #[builder(default = true)]
    pub enabled: bool,

    #[builder(default = 60)]
    pub interval_secs: u64,

    /// Defaults to the telemetry channel's base station endpoint.
    pub target: Option<SocketAddr>,

    #[builder(default = channel::UNSPECIFIED)]
    pub bind: SocketAddr,
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RelayConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    pub fn relay_id(&self) -> RelayId {
        RelayId::from(self.relay.name.as_str())
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.relay.shutdown_timeout_ms)
    }

    /// Where heartbeats are sent, if anywhere.
    pub fn heartbeat_target(&self) -> Option<SocketAddr> {
        self.heartbeat
            .target
            .or(self.channels.telemetry.base_station)
    }

    /// Structural validation. Port conflicts between channels are checked when the endpoint
    /// registry is resolved.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.relay.buffer_size == 0 {
            return Err(ConfigError::Zero("relay.buffer_size"));
        }
        if self.runtime.status_interval_secs == 0 {
            return Err(ConfigError::Zero("runtime.status_interval_secs"));
        }

        for kind in [ChannelKind::Command, ChannelKind::Telemetry] {
            if let Some(channel) = self.channels.get(kind) {
                channel.validate(kind)?;
            }
        }

        if self.video.enabled {
            if self.video.input_port == 0 {
                return Err(ConfigError::Zero("video.input_port"));
            }
            if self.video.max_restarts == 0 {
                return Err(ConfigError::Zero("video.max_restarts"));
            }
        }

        if self.heartbeat.enabled {
            if self.heartbeat.interval_secs == 0 {
                return Err(ConfigError::Zero("heartbeat.interval_secs"));
            }
            if self.heartbeat_target().is_none() {
                return Err(ConfigError::MissingHeartbeatTarget);
            }
        }

        if self.port_conflict.enabled && parse_signal(&self.port_conflict.signal).is_none() {
            return Err(ConfigError::UnknownSignal(self.port_conflict.signal.clone()));
        }

        Ok(())
    }
}
