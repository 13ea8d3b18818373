pub mod error;

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

use dashmap::{DashMap, Entry};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::channel::{ChannelKind, Side};
use crate::config::{LearningMode, RelayConfig};
use crate::state_machine::StateMachine;
use crate::state_machine::learning::{LearnOutcome, LearnerInput, PeerLearner, RejectReason};
use crate::state_machine::system::{SystemInput, SystemResource};

use self::error::{PortConflict, RegistryError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Udp => f.write_str("udp"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointSource {
    Static,
    Learned,
}

/// One side of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub addr: SocketAddr,
    pub protocol: Protocol,
    pub role: Side,
    pub source: EndpointSource,
}

impl Endpoint {
    pub fn fixed(addr: SocketAddr, role: Side) -> Self {
        Self {
            addr,
            protocol: Protocol::Udp,
            role,
            source: EndpointSource::Static,
        }
    }

    fn learned(addr: SocketAddr, role: Side) -> Self {
        Self {
            addr,
            protocol: Protocol::Udp,
            role,
            source: EndpointSource::Learned,
        }
    }
}

/// What a claimed local port is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortOwner {
    Channel { kind: ChannelKind, side: Side },
    VideoInput,
    Heartbeat,
}

impl fmt::Display for PortOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortOwner::Channel { kind, side } => write!(f, "{kind}/{side}"),
            PortOwner::VideoInput => f.write_str("video/input"),
            PortOwner::Heartbeat => f.write_str("heartbeat"),
        }
    }
}

/// A local port reserved by one consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortClaim {
    pub bind: SocketAddr,
    pub owner: PortOwner,
}

struct LearnedSlot {
    learner: PeerLearner,
    endpoint: Option<Endpoint>,
}

/// Resolved endpoints for every enabled channel.
///
/// Static endpoints are fixed at resolution. The drone side of a channel in a learning mode is
/// replaced as forwarders report source addresses; each replacement swaps the whole entry, so a
/// reader sees either the old or the new endpoint.
pub struct EndpointRegistry {
    statics: HashMap<(ChannelKind, Side), Endpoint>,
    learned: DashMap<ChannelKind, LearnedSlot, ahash::RandomState>,
    claims: DashMap<(u16, Protocol), PortClaim, ahash::RandomState>,
}

impl EndpointRegistry {
    /// Resolve `config` into endpoints, failing if it is invalid or two enabled consumers share a
    /// local port.
    pub fn resolve(config: &RelayConfig) -> Result<Self, RegistryError> {
        config.validate()?;

        let mut registry = Self {
            statics: HashMap::new(),
            learned: DashMap::default(),
            claims: DashMap::default(),
        };

        for (kind, channel) in config.channels.enabled() {
            for side in [Side::BaseStation, Side::Drone] {
                registry.claim_port(channel.bind(side), PortOwner::Channel { kind, side })?;

                if let Some(addr) = channel.remote(side) {
                    registry
                        .statics
                        .insert((kind, side), Endpoint::fixed(addr, side));
                }
            }

            if channel.learning.mode != LearningMode::Static {
                registry.learned.insert(
                    kind,
                    LearnedSlot {
                        learner: PeerLearner::new(&channel.learning),
                        endpoint: None,
                    },
                );
            }
        }

        if config.video.enabled {
            registry.claim_port(
                SocketAddr::from(([0, 0, 0, 0], config.video.input_port)),
                PortOwner::VideoInput,
            )?;
            registry.statics.insert(
                (ChannelKind::Video, Side::BaseStation),
                Endpoint::fixed(config.video.output, Side::BaseStation),
            );
        }

        if config.heartbeat.enabled {
            registry.claim_port(config.heartbeat.bind, PortOwner::Heartbeat)?;
        }

        Ok(registry)
    }

    fn claim_port(&self, bind: SocketAddr, owner: PortOwner) -> Result<(), PortConflict> {
        // Ephemeral binds never collide.
        if bind.port() == 0 {
            return Ok(());
        }

        match self.claims.entry((bind.port(), Protocol::Udp)) {
            Entry::Occupied(entry) => Err(PortConflict {
                port: bind.port(),
                protocol: Protocol::Udp,
                first: entry.get().owner,
                second: owner,
            }),
            Entry::Vacant(slot) => {
                slot.insert(PortClaim { bind, owner });
                Ok(())
            }
        }
    }

    /// Every fixed local port the relay or its transcoder will bind, sorted by port.
    pub fn claims(&self) -> Vec<PortClaim> {
        let mut claims: Vec<PortClaim> = self.claims.iter().map(|entry| *entry.value()).collect();
        claims.sort_unstable_by_key(|claim| claim.bind.port());
        claims
    }

    pub fn local_ports(&self) -> Vec<u16> {
        self.claims().iter().map(|claim| claim.bind.port()).collect()
    }

    /// The current endpoint for one side of a channel: the learned one if any, else the static one.
    pub fn lookup(&self, kind: ChannelKind, side: Side) -> Option<Endpoint> {
        if side == Side::Drone {
            let learned = self
                .learned
                .get(&kind)
                .and_then(|slot| slot.endpoint);
            if learned.is_some() {
                return learned;
            }
        }

        self.statics.get(&(kind, side)).copied()
    }

    /// The learned drone endpoint for a channel, ignoring the static fallback.
    pub fn learned(&self, kind: ChannelKind) -> Option<Endpoint> {
        self.learned.get(&kind).and_then(|slot| slot.endpoint)
    }

    pub fn is_learning(&self, kind: ChannelKind) -> bool {
        self.learned.contains_key(&kind)
    }

    /// Report a datagram source seen on the drone-side socket of `kind`.
    pub fn observe(&self, kind: ChannelKind, source: SocketAddr) -> LearnOutcome {
        self.observe_at(kind, source, Instant::generate())
    }

    pub fn observe_at(&self, kind: ChannelKind, source: SocketAddr, now: Instant) -> LearnOutcome {
        let Some(mut slot) = self.learned.get_mut(&kind) else {
            return LearnOutcome::Rejected {
                addr: source,
                reason: RejectReason::Static,
            };
        };

        slot.learner.process_input(SystemInput::System(now));
        slot.learner
            .process_input(SystemInput::Input(LearnerInput::Observed(source)));
        let outcome = slot.learner.poll_output().unwrap_or(LearnOutcome::Unchanged);

        if let LearnOutcome::Learned { addr, previous } = outcome {
            slot.endpoint = Some(Endpoint::learned(addr, Side::Drone));
            drop(slot);

            match previous {
                Some(previous) => {
                    info!(channel = %kind, %addr, %previous, "Drone endpoint re-learned")
                }
                None => info!(channel = %kind, %addr, "Drone endpoint learned"),
            }
        } else if let LearnOutcome::Rejected { addr, reason } = outcome {
            debug!(channel = %kind, %addr, ?reason, "Ignored drone source");
        }

        outcome
    }

    /// Forget the learned drone endpoint of `kind` so the next source is learned afresh.
    pub fn invalidate(&self, kind: ChannelKind) {
        if let Some(mut slot) = self.learned.get_mut(&kind) {
            slot.learner
                .process_input(SystemInput::Input(LearnerInput::Invalidate));
            slot.endpoint = None;
            if let Some(LearnOutcome::Invalidated {
                previous: Some(previous),
            }) = slot.learner.poll_output()
            {
                info!(channel = %kind, %previous, "Drone endpoint invalidated");
            }
        }
    }

    pub fn invalidate_all(&self) {
        for kind in ChannelKind::ALL {
            self.invalidate(kind);
        }
    }
}

impl fmt::Debug for EndpointRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointRegistry")
            .field("statics", &self.statics)
            .field("learning", &self.learned.len())
            .field("claims", &self.claims.len())
            .finish()
    }
}
