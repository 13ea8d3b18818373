//! Relay lifecycle: start, stop, restart, and status.
//!
//! [`RelaySupervisor`] owns everything a running relay consists of: the endpoint registry, the
//! statistics, one task per worker, the liveness marker, and the cancellation token shared by the
//! workers. State transitions are decided by [`LifecycleMachine`] and published through a `watch`
//! channel and the status file.

pub mod error;
pub mod pidfile;
pub mod preflight;
pub mod status;

use std::fs;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelKind, Side};
use crate::config::{ConfigError, RelayConfig};
use crate::endpoint::EndpointRegistry;
use crate::forwarder::Forwarder;
use crate::heartbeat::HeartbeatReporter;
use crate::identity::{InstanceId, RelayId};
use crate::net::bind_udp;
use crate::state_machine::StateMachine;
use crate::state_machine::lifecycle::{LifecycleEvent, LifecycleMachine, LifecycleOutput, RelayState};
use crate::stats::StatsAggregator;
use crate::video::VideoSupervisor;

use self::error::LifecycleError;
use self::pidfile::{PidFile, PidRecord};
use self::preflight::{PortPreflight, ResolvedConflict};
use self::status::{RelayStatus, StatusSource, run_status_writer, write_status};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started {
        /// A marker left behind by a relay that no longer runs, cleared during start.
        stale_marker: Option<PidRecord>,
        /// Foreign processes that had to be signalled to free a port.
        conflicts: Vec<ResolvedConflict>,
    },
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped {
        /// Workers that did not finish within the shutdown timeout and were aborted.
        aborted: usize,
    },
    AlreadyStopped,
}

struct RunningRelay {
    config: RelayConfig,
    registry: Arc<EndpointRegistry>,
    source: StatusSource,
    token: CancellationToken,
    tasks: JoinSet<()>,
    local_addrs: Vec<(ChannelKind, Side, SocketAddr)>,
    _pid_file: PidFile,
}

pub struct RelaySupervisor {
    instance_id: InstanceId,
    machine: LifecycleMachine,
    state: watch::Sender<RelayState>,
    running: Option<RunningRelay>,
    // Status file and relay id of the most recent start, for status after stop.
    last_run: Option<(PathBuf, RelayId)>,
}

impl RelaySupervisor {
    pub fn new() -> Self {
        let (state, _) = watch::channel(RelayState::Stopped);
        Self {
            instance_id: InstanceId::generate(),
            machine: LifecycleMachine::new(),
            state,
            running: None,
            last_run: None,
        }
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub fn state(&self) -> RelayState {
        self.machine.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<RelayState> {
        self.state.subscribe()
    }

    /// The endpoint registry of the running relay.
    pub fn registry(&self) -> Option<Arc<EndpointRegistry>> {
        self.running.as_ref().map(|running| running.registry.clone())
    }

    /// The bound local address of one side of a running channel.
    pub fn local_addr(&self, kind: ChannelKind, side: Side) -> Option<SocketAddr> {
        self.running.as_ref().and_then(|running| {
            running
                .local_addrs
                .iter()
                .find(|(k, s, _)| *k == kind && *s == side)
                .map(|(_, _, addr)| *addr)
        })
    }

    pub fn status(&self) -> RelayStatus {
        match &self.running {
            Some(running) => {
                let mut status = running.source.status();
                status.state = self.machine.state();
                status
            }
            None => RelayStatus {
                state: self.machine.state(),
                relay_id: self.last_run.as_ref().map(|(_, id)| id.clone()),
                instance_id: self.instance_id,
                pid: std::process::id(),
                updated_at: chrono::Utc::now(),
                snapshot: None,
                video: None,
            },
        }
    }

    fn apply(&mut self, event: LifecycleEvent) -> LifecycleOutput {
        self.machine.process_input(event);
        let output = self
            .machine
            .poll_output()
            .unwrap_or(LifecycleOutput::Rejected {
                state: self.machine.state(),
                event,
            });

        if let LifecycleOutput::Transition { from, to } = output {
            info!(%from, %to, instance_id = %self.instance_id, "Relay state changed");
            self.state.send_replace(to);
            self.persist_status();
        }

        output
    }

    fn persist_status(&self) {
        let path = match (&self.running, &self.last_run) {
            (Some(running), _) => &running.config.runtime.status_file,
            (None, Some((path, _))) => path,
            (None, None) => return,
        };

        if let Err(e) = write_status(path, &self.status()) {
            warn!(path = %path.display(), error = %e, "Failed to write status file");
        }
    }

    /// Start the relay with `config`. Starting a running relay is a no-op.
    pub async fn start(&mut self, config: RelayConfig) -> Result<StartOutcome, LifecycleError> {
        match self.apply(LifecycleEvent::StartRequested) {
            LifecycleOutput::Transition { .. } => {}
            LifecycleOutput::AlreadyRunning => {
                debug!("Start requested while running");
                return Ok(StartOutcome::AlreadyRunning);
            }
            LifecycleOutput::AlreadyStopped | LifecycleOutput::Rejected { .. } => {
                return Err(LifecycleError::InvalidState(self.machine.state()));
            }
        }

        self.last_run = Some((config.runtime.status_file.clone(), config.relay_id()));

        match self.launch(config).await {
            Ok((running, outcome)) => {
                self.running = Some(running);
                self.apply(LifecycleEvent::StartSucceeded);
                Ok(outcome)
            }
            Err(e) => {
                error!(error = ?e, "Relay failed to start");
                self.apply(LifecycleEvent::StartFailed);
                Err(e)
            }
        }
    }

    async fn launch(&self, config: RelayConfig) -> Result<(RunningRelay, StartOutcome), LifecycleError> {
        let relay_id = config.relay_id();
        let registry = Arc::new(EndpointRegistry::resolve(&config)?);

        let (pid_file, stale_marker) = PidFile::acquire(
            &config.runtime.pid_file,
            PidRecord::current(self.instance_id, relay_id.clone()),
        )?;

        let conflicts = if config.port_conflict.enabled {
            PortPreflight::new(&config.port_conflict)?
                .resolve(&registry.claims())
                .await?
        } else {
            Vec::new()
        };

        let stats = Arc::new(StatsAggregator::new());

        // Bind every socket before any worker runs so a bind failure leaves nothing behind.
        let mut forwarders = Vec::new();
        for (kind, channel) in config.channels.enabled() {
            forwarders.push(Forwarder::bind(
                kind,
                channel,
                config.relay.buffer_size,
                registry.clone(),
                stats.register(kind),
            )?);
        }

        let heartbeat = if config.heartbeat.enabled {
            let target = config
                .heartbeat_target()
                .ok_or(ConfigError::MissingHeartbeatTarget)?;
            let addr = config.heartbeat.bind;
            let socket = bind_udp(addr).map_err(|source| LifecycleError::HeartbeatBind { addr, source })?;
            Some((socket, target))
        } else {
            None
        };

        let token = CancellationToken::new();
        let mut tasks = JoinSet::new();
        let mut local_addrs = Vec::new();

        for forwarder in forwarders {
            for side in [Side::BaseStation, Side::Drone] {
                if let Ok(addr) = forwarder.local_addr(side) {
                    local_addrs.push((forwarder.kind(), side, addr));
                }
            }
            tasks.spawn(forwarder.run(token.child_token()));
        }

        let video = if config.video.enabled {
            let supervisor = VideoSupervisor::new(config.video.clone(), stats.register(ChannelKind::Video));
            let video = supervisor.subscribe();
            tasks.spawn(supervisor.run(token.child_token()));
            Some(video)
        } else {
            None
        };

        if let Some((socket, target)) = heartbeat {
            let reporter = HeartbeatReporter::builder()
                .socket(socket)
                .target(target)
                .interval(config.heartbeat.interval())
                .relay_id(relay_id.clone())
                .instance_id(self.instance_id)
                .stats(stats.clone())
                .state(self.state.subscribe())
                .build();
            tasks.spawn(reporter.run(token.child_token()));
        }

        let source = StatusSource {
            relay_id: relay_id.clone(),
            instance_id: self.instance_id,
            state: self.state.subscribe(),
            stats,
            video,
        };
        tasks.spawn(run_status_writer(
            config.runtime.status_file.clone(),
            config.runtime.status_interval(),
            source.clone(),
            token.child_token(),
        ));

        info!(
            relay = %relay_id,
            instance_id = %self.instance_id,
            workers = tasks.len(),
            "Relay started"
        );

        let running = RunningRelay {
            config,
            registry,
            source,
            token,
            tasks,
            local_addrs,
            _pid_file: pid_file,
        };
        let outcome = StartOutcome::Started {
            stale_marker,
            conflicts,
        };
        Ok((running, outcome))
    }

    /// Stop all workers, waiting at most the configured shutdown timeout before aborting the rest.
    /// Stopping a stopped relay is a no-op.
    pub async fn stop(&mut self) -> StopOutcome {
        match self.apply(LifecycleEvent::StopRequested) {
            LifecycleOutput::Transition { .. } => {}
            _ => return StopOutcome::AlreadyStopped,
        }

        let Some(mut running) = self.running.take() else {
            self.apply(LifecycleEvent::StopCompleted);
            return StopOutcome::Stopped { aborted: 0 };
        };

        running.token.cancel();
        let timeout = running.config.shutdown_timeout();

        let drained = tokio::time::timeout(timeout, async {
            while let Some(result) = running.tasks.join_next().await {
                if let Err(e) = result {
                    warn!(error = %e, "Worker ended abnormally");
                }
            }
        })
        .await;

        let aborted = running.tasks.len();
        if drained.is_err() {
            warn!(aborted, timeout_ms = timeout.as_millis() as u64, "Workers did not stop in time, aborting");
            running.tasks.shutdown().await;
        }

        info!(summary = %running.source.stats.snapshot(), "Relay stopped");
        // Dropping the relay closes every socket and releases the liveness marker.
        drop(running);

        self.apply(LifecycleEvent::StopCompleted);
        StopOutcome::Stopped { aborted }
    }

    /// Stop, reload the configuration through `loader`, and start again.
    ///
    /// A configuration that fails to load leaves the relay stopped.
    pub async fn restart<F>(&mut self, loader: F) -> Result<StartOutcome, LifecycleError>
    where
        F: FnOnce() -> Result<RelayConfig, ConfigError>,
    {
        info!("Restarting relay");
        self.stop().await;
        let config = loader()?;
        self.start(config).await
    }
}

impl Default for RelaySupervisor {
    fn default() -> Self {
        Self::new()
    }
}

/// Write `contents` to a sibling temporary file and rename it over `path`.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = fs::File::create(&tmp)?;
    file.write_all(contents)?;
    file.sync_all()?;
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::UdpSocket;

    use super::*;
    use crate::channel::Direction;
    use crate::config::{ChannelConfig, LearningConfig, LearningMode, VideoConfig};
    use crate::lifecycle::pidfile::{MarkerState, inspect};
    use crate::lifecycle::status::read_status;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    /// A relay on ephemeral loopback ports with video and heartbeat disabled.
    fn test_config(dir: &Path, base_station: SocketAddr, drone: SocketAddr) -> RelayConfig {
        let mut config = RelayConfig::default();
        config.runtime.pid_file = dir.join("relay.pid");
        config.runtime.status_file = dir.join("status.json");
        config.relay.shutdown_timeout_ms = 2000;
        config.video.enabled = false;
        config.heartbeat.enabled = false;
        config.channels.command = ChannelConfig::builder()
            .direction(Direction::BaseToDrone)
            .base_bind(loopback())
            .drone_bind(loopback())
            .drone(drone)
            .learning(LearningConfig::builder().mode(LearningMode::Static).build())
            .build();
        config.channels.telemetry = ChannelConfig::builder()
            .direction(Direction::DroneToBase)
            .base_bind(loopback())
            .drone_bind(loopback())
            .base_station(base_station)
            .build();
        config
    }

    async fn recv(socket: &UdpSocket) -> Option<Vec<u8>> {
        let mut buf = [0u8; 2048];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .ok()?
            .ok()?;
        Some(buf[..len].to_vec())
    }

    #[tokio::test]
    async fn test_start_forward_stop() {
        let dir = tempfile::tempdir().unwrap();
        let base = UdpSocket::bind(loopback()).await.unwrap();
        let drone = UdpSocket::bind(loopback()).await.unwrap();
        let config = test_config(dir.path(), base.local_addr().unwrap(), drone.local_addr().unwrap());

        let mut supervisor = RelaySupervisor::new();
        let mut state = supervisor.subscribe();
        let outcome = supervisor.start(config.clone()).await.unwrap();
        assert!(matches!(outcome, StartOutcome::Started { stale_marker: None, .. }));
        assert_eq!(supervisor.state(), RelayState::Running);
        assert_eq!(*state.borrow_and_update(), RelayState::Running);
        assert!(matches!(inspect(&config.runtime.pid_file).unwrap(), MarkerState::Running(_)));

        let command_in = supervisor.local_addr(ChannelKind::Command, Side::BaseStation).unwrap();
        base.send_to(b"cmd", command_in).await.unwrap();
        assert_eq!(recv(&drone).await.unwrap(), b"cmd");

        let telemetry_in = supervisor.local_addr(ChannelKind::Telemetry, Side::Drone).unwrap();
        drone.send_to(b"tlm", telemetry_in).await.unwrap();
        assert_eq!(recv(&base).await.unwrap(), b"tlm");

        // Starting again is a no-op
        assert_eq!(
            supervisor.start(config.clone()).await.unwrap(),
            StartOutcome::AlreadyRunning
        );

        let status = supervisor.status();
        assert_eq!(status.state, RelayState::Running);
        assert_eq!(status.instance_id, supervisor.instance_id());

        let stopped = tokio::time::timeout(Duration::from_secs(5), supervisor.stop())
            .await
            .expect("stop completes within the shutdown timeout");
        assert_eq!(stopped, StopOutcome::Stopped { aborted: 0 });
        assert_eq!(supervisor.state(), RelayState::Stopped);
        assert_eq!(inspect(&config.runtime.pid_file).unwrap(), MarkerState::Absent);
        assert_eq!(read_status(&config.runtime.status_file).unwrap().state, RelayState::Stopped);

        // Sockets are closed
        std::net::UdpSocket::bind(command_in).unwrap();
        std::net::UdpSocket::bind(telemetry_in).unwrap();

        assert_eq!(supervisor.stop().await, StopOutcome::AlreadyStopped);
    }

    #[tokio::test]
    async fn test_bind_failure_leaves_nothing_running() {
        let dir = tempfile::tempdir().unwrap();
        let held = std::net::UdpSocket::bind(loopback()).unwrap();
        let mut config = test_config(dir.path(), loopback(), loopback());
        config.port_conflict.enabled = false;
        config.channels.telemetry.drone_bind = held.local_addr().unwrap();

        let mut supervisor = RelaySupervisor::new();
        let err = supervisor.start(config.clone()).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Bind(_)));
        assert_eq!(err.exit_code(), error::EXIT_BIND_FAILURE);
        assert_eq!(supervisor.state(), RelayState::Stopped);
        assert!(supervisor.registry().is_none());
        assert_eq!(inspect(&config.runtime.pid_file).unwrap(), MarkerState::Absent);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path(), loopback(), loopback());
        config.channels.telemetry.base_station = None;

        let mut supervisor = RelaySupervisor::new();
        let err = supervisor.start(config).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Registry(_)));
        assert_eq!(err.exit_code(), error::EXIT_FAILURE);
        assert_eq!(supervisor.state(), RelayState::Stopped);
    }

    #[tokio::test]
    async fn test_video_failure_is_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let base = UdpSocket::bind(loopback()).await.unwrap();
        let drone = UdpSocket::bind(loopback()).await.unwrap();
        let mut config = test_config(dir.path(), base.local_addr().unwrap(), drone.local_addr().unwrap());
        config.video = VideoConfig::builder()
            .input_port(free_port())
            .program("/bin/sh")
            .args(vec!["-c".to_string(), "exit 1".to_string()])
            .restart_backoff_ms(10)
            .max_restarts(1)
            .build();

        let mut supervisor = RelaySupervisor::new();
        supervisor.start(config).await.unwrap();

        let mut failed = false;
        for _ in 0..200 {
            if supervisor.status().video.is_some_and(|video| video.failed) {
                failed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(failed);
        assert_eq!(supervisor.state(), RelayState::Running);

        let telemetry_in = supervisor.local_addr(ChannelKind::Telemetry, Side::Drone).unwrap();
        drone.send_to(b"still flowing", telemetry_in).await.unwrap();
        assert_eq!(recv(&base).await.unwrap(), b"still flowing");

        let snapshot = supervisor.status().snapshot.unwrap();
        assert!(snapshot.channel(ChannelKind::Video).unwrap().failed);
        assert!(!snapshot.channel(ChannelKind::Telemetry).unwrap().failed);

        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_restart_reloads_config() {
        let dir = tempfile::tempdir().unwrap();
        let base = UdpSocket::bind(loopback()).await.unwrap();
        let drone = UdpSocket::bind(loopback()).await.unwrap();
        let config = test_config(dir.path(), base.local_addr().unwrap(), drone.local_addr().unwrap());

        let mut supervisor = RelaySupervisor::new();
        supervisor.start(config.clone()).await.unwrap();
        let instance_id = supervisor.instance_id();

        let mut reloaded = config.clone();
        reloaded.channels.command.enabled = false;
        let outcome = supervisor.restart(move || Ok(reloaded)).await.unwrap();
        assert!(matches!(outcome, StartOutcome::Started { .. }));
        assert_eq!(supervisor.state(), RelayState::Running);
        assert_eq!(supervisor.instance_id(), instance_id);
        assert!(supervisor.local_addr(ChannelKind::Command, Side::BaseStation).is_none());
        assert!(supervisor.local_addr(ChannelKind::Telemetry, Side::Drone).is_some());

        // A failing loader leaves the relay stopped
        let result = supervisor
            .restart(|| Err(ConfigError::Zero("relay.buffer_size")))
            .await;
        assert!(matches!(result, Err(LifecycleError::Config(_))));
        assert_eq!(supervisor.state(), RelayState::Stopped);
    }

    #[tokio::test]
    async fn test_stale_marker_reported() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), loopback(), loopback());

        let mut child = std::process::Command::new("/bin/sh").arg("-c").arg("exit 0").spawn().unwrap();
        let dead = child.id();
        child.wait().unwrap();
        let stale = PidRecord {
            pid: dead,
            ..PidRecord::current(InstanceId::generate(), RelayId::from("old"))
        };
        fs::write(&config.runtime.pid_file, serde_json::to_vec(&stale).unwrap()).unwrap();

        let mut supervisor = RelaySupervisor::new();
        let outcome = supervisor.start(config).await.unwrap();
        assert_eq!(
            outcome,
            StartOutcome::Started {
                stale_marker: Some(stale),
                conflicts: Vec::new()
            }
        );
        supervisor.stop().await;
    }

    fn free_port() -> u16 {
        std::net::UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }
}
