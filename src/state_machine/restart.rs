use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::StateMachine;
use super::system::SystemInput;
use crate::config::VideoConfig;

/// Restart limits for a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub backoff: Duration,
    pub max_backoff: Duration,
    pub max_restarts: u32,
    pub window: Duration,
}

impl From<&VideoConfig> for RestartPolicy {
    fn from(config: &VideoConfig) -> Self {
        Self {
            backoff: Duration::from_millis(config.restart_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            max_restarts: config.max_restarts,
            window: Duration::from_secs(config.restart_window_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartInput {
    /// The process exited while it was expected to keep running.
    UnexpectedExit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    RestartAfter { delay: Duration, attempt: u32 },
    /// The restart budget inside the window is spent. Final for the machine's lifetime.
    GiveUp { restarts: u32 },
}

/// Sliding-window restart limiter with exponential backoff.
///
/// The backoff doubles for every restart still inside the window, so a process that has been
/// stable for a full window starts over at the base delay.
pub struct RestartPolicyMachine {
    policy: RestartPolicy,
    now: Option<Instant>,
    recent_restarts: VecDeque<Instant>,
    total_restarts: u32,
    failed: bool,
    pending: Option<RestartDecision>,
}

impl RestartPolicyMachine {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            now: None,
            recent_restarts: VecDeque::new(),
            total_restarts: 0,
            failed: false,
            pending: None,
        }
    }

    pub fn total_restarts(&self) -> u32 {
        self.total_restarts
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.recent_restarts.front() {
            if now.saturating_duration_since(oldest) >= self.policy.window {
                self.recent_restarts.pop_front();
            } else {
                break;
            }
        }
    }

    fn backoff_for(&self, in_window: u32) -> Duration {
        let factor = 1u32.checked_shl(in_window).unwrap_or(u32::MAX);
        self.policy
            .backoff
            .saturating_mul(factor)
            .min(self.policy.max_backoff)
    }

    fn on_unexpected_exit(&mut self) -> RestartDecision {
        if self.failed {
            return RestartDecision::GiveUp {
                restarts: self.total_restarts,
            };
        }

        // A missing clock reading is treated as "no time has passed".
        if let Some(now) = self.now {
            self.prune(now);
        }

        let in_window = self.recent_restarts.len() as u32;
        if in_window >= self.policy.max_restarts {
            self.failed = true;
            return RestartDecision::GiveUp {
                restarts: self.total_restarts,
            };
        }

        let delay = self.backoff_for(in_window);
        if let Some(now) = self.now {
            self.recent_restarts.push_back(now);
        } else if let Some(&last) = self.recent_restarts.back() {
            self.recent_restarts.push_back(last);
        }
        self.total_restarts += 1;

        RestartDecision::RestartAfter {
            delay,
            attempt: self.total_restarts,
        }
    }
}

impl StateMachine for RestartPolicyMachine {
    type Input = SystemInput<RestartInput, Instant>;
    type Output = RestartDecision;

    fn process_input(&mut self, input: Self::Input) {
        match input {
            SystemInput::System(now) => self.now = Some(now),
            SystemInput::Input(RestartInput::UnexpectedExit) => {
                self.pending = Some(self.on_unexpected_exit());
            }
        }
    }

    fn poll_output(&mut self) -> Option<Self::Output> {
        self.pending.take()
    }
}
