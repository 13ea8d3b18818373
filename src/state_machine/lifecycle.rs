use std::fmt;

use serde::{Deserialize, Serialize};

use super::StateMachine;

/// Process-wide relay state, driven only by the lifecycle supervisor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayState {
    Starting,
    Running,
    Stopping,
    #[default]
    Stopped,
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RelayState::Starting => "starting",
            RelayState::Running => "running",
            RelayState::Stopping => "stopping",
            RelayState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    StartRequested,
    StartSucceeded,
    StartFailed,
    StopRequested,
    StopCompleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleOutput {
    Transition { from: RelayState, to: RelayState },
    /// Start requested while already running; nothing to do.
    AlreadyRunning,
    /// Stop requested while already stopped; nothing to do.
    AlreadyStopped,
    /// The event is not valid in the current state and was ignored.
    Rejected {
        state: RelayState,
        event: LifecycleEvent,
    },
}

/// `Stopped → Starting → Running → Stopping → Stopped`, with `Starting → Stopped` on a failed
/// start.
#[derive(Debug, Default)]
pub struct LifecycleMachine {
    state: RelayState,
    pending: Option<LifecycleOutput>,
}

impl LifecycleMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    fn apply(&mut self, event: LifecycleEvent) -> LifecycleOutput {
        use LifecycleEvent as E;
        use RelayState as S;

        let next = match (self.state, event) {
            (S::Running, E::StartRequested) => return LifecycleOutput::AlreadyRunning,
            (S::Stopped, E::StopRequested) => return LifecycleOutput::AlreadyStopped,
            (S::Stopped, E::StartRequested) => S::Starting,
            (S::Starting, E::StartSucceeded) => S::Running,
            (S::Starting, E::StartFailed) => S::Stopped,
            (S::Running, E::StopRequested) => S::Stopping,
            (S::Stopping, E::StopCompleted) => S::Stopped,
            (state, event) => return LifecycleOutput::Rejected { state, event },
        };

        let from = std::mem::replace(&mut self.state, next);
        LifecycleOutput::Transition { from, to: next }
    }
}

impl StateMachine for LifecycleMachine {
    type Input = LifecycleEvent;
    type Output = LifecycleOutput;

    fn process_input(&mut self, input: Self::Input) {
        self.pending = Some(self.apply(input));
    }

    fn poll_output(&mut self) -> Option<Self::Output> {
        self.pending.take()
    }
}
