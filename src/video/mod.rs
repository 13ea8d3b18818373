//! Supervision of the external video transcoder.
//!
//! The transcoder reads raw video from the drone on a local UDP port and sends RTP to the base
//! station; the relay never touches the video payload. The supervisor keeps one transcoder running,
//! restarts it with backoff when it exits unexpectedly, and marks the video channel failed once the
//! restart budget is spent. Other channels are unaffected by a video failure.

pub mod error;
pub mod process;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::watch;
use tokio_stream::wrappers::LinesStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::VideoConfig;
use crate::state_machine::StateMachine;
use crate::state_machine::restart::{
    RestartDecision, RestartInput, RestartPolicy, RestartPolicyMachine,
};
use crate::state_machine::system::{SystemInput, SystemResource};
use crate::stats::ChannelCounters;

pub use self::error::VideoError;
pub use self::process::TranscoderProcess;

const STDERR_TAIL_LINES: usize = 20;
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Read-only view of the supervised transcoder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoState {
    /// Pid of the running transcoder, if one is running.
    pub pid: Option<u32>,
    pub restart_count: u32,
    pub last_start: Option<DateTime<Utc>>,
    /// How the previous transcoder ended, e.g. `exit status: 1`.
    pub last_exit: Option<String>,
    /// Restarts were given up on; video stays down until the relay restarts.
    pub failed: bool,
}

/// Turns the `key=value` lines of ffmpeg's `-progress` output into counter deltas.
///
/// `frame=` is used as the packet count and `total_size=` as the byte count. Both are cumulative
/// for one process, so a fresh tracker is used for every spawn.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    frames: u64,
    bytes: u64,
}

impl ProgressTracker {
    /// Returns `(packets, bytes)` gained since the previous line, if the line carried progress.
    pub fn feed(&mut self, line: &str) -> Option<(u64, u64)> {
        let (key, value) = line.trim().split_once('=')?;
        let value: u64 = value.trim().parse().ok()?;

        match key {
            "frame" => {
                let delta = value.saturating_sub(self.frames);
                self.frames = self.frames.max(value);
                Some((delta, 0))
            }
            "total_size" => {
                let delta = value.saturating_sub(self.bytes);
                self.bytes = self.bytes.max(value);
                Some((0, delta))
            }
            _ => None,
        }
    }
}

enum Supervised {
    Cancelled,
    Exited(String),
}

/// Keeps one transcoder running until cancelled or until restarts are given up on.
pub struct VideoSupervisor {
    config: VideoConfig,
    counters: Arc<ChannelCounters>,
    state: watch::Sender<VideoState>,
}

impl VideoSupervisor {
    pub fn new(config: VideoConfig, counters: Arc<ChannelCounters>) -> Self {
        let (state, _) = watch::channel(VideoState::default());
        Self {
            config,
            counters,
            state,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<VideoState> {
        self.state.subscribe()
    }

    pub async fn run(self, token: CancellationToken) {
        let mut policy = RestartPolicyMachine::new(RestartPolicy::from(&self.config));
        let args = self.config.expanded_args();

        info!(
            program = %self.config.program,
            input_port = self.config.input_port,
            output = %self.config.output,
            "Video supervisor started"
        );

        loop {
            let exit = match TranscoderProcess::spawn(&self.config.program, &args) {
                Ok(process) => match self.supervise(process, &token).await {
                    Supervised::Cancelled => {
                        self.state.send_modify(|state| state.pid = None);
                        break;
                    }
                    Supervised::Exited(exit) => exit,
                },
                Err(e) => {
                    self.counters.record_error();
                    error!(error = ?e, "Transcoder could not be started");
                    e.to_string()
                }
            };

            self.state.send_modify(|state| {
                state.pid = None;
                state.last_exit = Some(exit);
            });

            if token.is_cancelled() {
                break;
            }

            policy.process_input(SystemInput::System(Instant::generate()));
            policy.process_input(SystemInput::Input(RestartInput::UnexpectedExit));

            let decision = policy.poll_output().unwrap_or(RestartDecision::GiveUp {
                restarts: policy.total_restarts(),
            });

            match decision {
                RestartDecision::RestartAfter { delay, attempt } => {
                    self.counters.record_error();
                    self.state.send_modify(|state| state.restart_count = attempt);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, "Restarting transcoder");

                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                RestartDecision::GiveUp { restarts } => {
                    self.counters.mark_failed();
                    self.state.send_modify(|state| state.failed = true);
                    error!(
                        restarts,
                        window_secs = self.config.restart_window_secs,
                        "Transcoder keeps exiting, video relay marked failed"
                    );
                    break;
                }
            }
        }

        info!("Video supervisor stopped");
    }

    async fn supervise(&self, mut process: TranscoderProcess, token: &CancellationToken) -> Supervised {
        let pid = process.pid();
        self.state.send_modify(|state| {
            state.pid = pid;
            state.last_start = Some(Utc::now());
        });
        info!(pid = ?pid, "Transcoder started");

        let progress = process
            .take_stdout()
            .map(|stdout| tokio::spawn(track_progress(stdout, self.counters.clone())));
        let stderr = process.take_stderr().map(|stderr| tokio::spawn(stderr_tail(stderr)));

        let outcome = tokio::select! {
            _ = token.cancelled() => {
                match process.terminate(self.config.terminate_timeout()).await {
                    Ok(status) => info!(pid = ?pid, %status, "Transcoder stopped"),
                    Err(e) => warn!(pid = ?pid, error = %e, "Failed to stop transcoder cleanly"),
                }
                Supervised::Cancelled
            }
            status = process.wait() => match status {
                Ok(status) => Supervised::Exited(status.to_string()),
                Err(e) => Supervised::Exited(e.to_string()),
            },
        };

        if let Some(progress) = progress {
            let _ = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, progress).await;
        }

        let tail = match stderr {
            Some(stderr) => tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, stderr)
                .await
                .ok()
                .and_then(Result::ok)
                .unwrap_or_default(),
            None => Vec::new(),
        };

        if let Supervised::Exited(exit) = &outcome {
            warn!(pid = ?pid, exit = %exit, stderr = %tail.join("\n"), "Transcoder exited unexpectedly");
        }

        outcome
    }
}

async fn track_progress(stdout: impl AsyncRead + Unpin, counters: Arc<ChannelCounters>) {
    let mut tracker = ProgressTracker::default();
    let mut lines = LinesStream::new(BufReader::new(stdout).lines());

    while let Some(Ok(line)) = lines.next().await {
        if let Some((packets, bytes)) = tracker.feed(&line) {
            counters.record_progress(packets, bytes);
        }
    }
}

async fn stderr_tail(stderr: impl AsyncRead + Unpin) -> Vec<String> {
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut lines = LinesStream::new(BufReader::new(stderr).lines());

    while let Some(Ok(line)) = lines.next().await {
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }

    tail.into()
}
