use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use super::StateMachine;
use super::system::SystemInput;
use crate::config::{LearningConfig, LearningMode};

/// Decides which source address is the current drone peer of a channel.
pub struct PeerLearner {
    mode: LearningMode,
    hold_off: Duration,
    allowed_ips: Vec<IpAddr>,
    now: Option<Instant>,
    current: Option<Peer>,
    pending: Option<LearnOutcome>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Peer {
    addr: SocketAddr,
    last_seen: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The channel does not learn peers.
    Static,
    /// The source IP is not in the channel's allowed list.
    NotAllowed,
    /// A peer is already locked in by `first_seen`.
    Locked,
    /// The current peer was heard from too recently for `hold_off` to switch.
    HoldOff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LearnOutcome {
    /// `addr` is now the peer; `previous` is the peer it replaced.
    Learned {
        addr: SocketAddr,
        previous: Option<SocketAddr>,
    },
    /// The source is already the current peer.
    Unchanged,
    Rejected {
        addr: SocketAddr,
        reason: RejectReason,
    },
    /// The learned peer was dropped.
    Invalidated { previous: Option<SocketAddr> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LearnerInput {
    Observed(SocketAddr),
    Invalidate,
}

impl PeerLearner {
    pub fn new(config: &LearningConfig) -> Self {
        Self {
            mode: config.mode,
            hold_off: config.hold_off(),
            allowed_ips: config.allowed_ips.clone(),
            now: None,
            current: None,
            pending: None,
        }
    }

    pub fn current(&self) -> Option<SocketAddr> {
        self.current.map(|peer| peer.addr)
    }

    fn is_allowed(&self, addr: &SocketAddr) -> bool {
        self.allowed_ips.is_empty() || self.allowed_ips.contains(&addr.ip())
    }

    fn silent_long_enough(&self, peer: &Peer) -> bool {
        match (self.now, peer.last_seen) {
            (Some(now), Some(last_seen)) => now.saturating_duration_since(last_seen) >= self.hold_off,
            // Without a clock reading silence cannot be established.
            _ => false,
        }
    }

    fn observe(&mut self, addr: SocketAddr) -> LearnOutcome {
        if self.mode == LearningMode::Static {
            return LearnOutcome::Rejected {
                addr,
                reason: RejectReason::Static,
            };
        }

        if !self.is_allowed(&addr) {
            return LearnOutcome::Rejected {
                addr,
                reason: RejectReason::NotAllowed,
            };
        }

        let Some(mut peer) = self.current else {
            self.current = Some(Peer {
                addr,
                last_seen: self.now,
            });
            return LearnOutcome::Learned {
                addr,
                previous: None,
            };
        };

        if peer.addr == addr {
            peer.last_seen = self.now;
            self.current = Some(peer);
            return LearnOutcome::Unchanged;
        }

        let replace = match self.mode {
            LearningMode::FollowLatest => true,
            LearningMode::HoldOff => self.silent_long_enough(&peer),
            LearningMode::FirstSeen | LearningMode::Static => false,
        };

        if replace {
            self.current = Some(Peer {
                addr,
                last_seen: self.now,
            });
            LearnOutcome::Learned {
                addr,
                previous: Some(peer.addr),
            }
        } else {
            let reason = if self.mode == LearningMode::HoldOff {
                RejectReason::HoldOff
            } else {
                RejectReason::Locked
            };
            LearnOutcome::Rejected { addr, reason }
        }
    }
}

impl StateMachine for PeerLearner {
    type Input = SystemInput<LearnerInput, Instant>;
    type Output = LearnOutcome;

    fn process_input(&mut self, input: Self::Input) {
        match input {
            SystemInput::System(now) => self.now = Some(now),
            SystemInput::Input(LearnerInput::Observed(addr)) => {
                self.pending = Some(self.observe(addr));
            }
            SystemInput::Input(LearnerInput::Invalidate) => {
                let previous = self.current.take().map(|peer| peer.addr);
                self.pending = Some(LearnOutcome::Invalidated { previous });
            }
        }
    }

    fn poll_output(&mut self) -> Option<Self::Output> {
        self.pending.take()
    }
}
