use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::write_atomic;
use crate::identity::{InstanceId, RelayId};
use crate::state_machine::lifecycle::RelayState;
use crate::stats::{StatisticsSnapshot, StatsAggregator};
use crate::video::VideoState;

/// Externally visible relay status, also written to the status file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayStatus {
    pub state: RelayState,
    pub relay_id: Option<RelayId>,
    pub instance_id: InstanceId,
    pub pid: u32,
    pub updated_at: DateTime<Utc>,
    pub snapshot: Option<StatisticsSnapshot>,
    pub video: Option<VideoState>,
}

/// Everything needed to assemble a [`RelayStatus`] for a running relay without touching workers.
#[derive(Clone)]
pub(crate) struct StatusSource {
    pub relay_id: RelayId,
    pub instance_id: InstanceId,
    pub state: watch::Receiver<RelayState>,
    pub stats: Arc<StatsAggregator>,
    pub video: Option<watch::Receiver<VideoState>>,
}

impl StatusSource {
    pub fn status(&self) -> RelayStatus {
        RelayStatus {
            state: *self.state.borrow(),
            relay_id: Some(self.relay_id.clone()),
            instance_id: self.instance_id,
            pid: std::process::id(),
            updated_at: Utc::now(),
            snapshot: Some(self.stats.snapshot()),
            video: self.video.as_ref().map(|video| video.borrow().clone()),
        }
    }
}

pub fn write_status(path: &Path, status: &RelayStatus) -> io::Result<()> {
    let contents = serde_json::to_vec_pretty(status)?;
    write_atomic(path, &contents)
}

pub fn read_status(path: &Path) -> io::Result<RelayStatus> {
    let contents = std::fs::read(path)?;
    Ok(serde_json::from_slice(&contents)?)
}

/// Rewrites the status file every `interval` and whenever the relay state changes.
pub(crate) async fn run_status_writer(
    path: PathBuf,
    interval: Duration,
    mut source: StatusSource,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
            changed = source.state.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }

        if let Err(e) = write_status(&path, &source.status()) {
            warn!(path = %path.display(), error = %e, "Failed to write status file");
        }
    }
}
