//! The liveness marker: a JSON PID file naming the running relay instance.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::error::PidFileError;
use super::write_atomic;
use crate::identity::{InstanceId, RelayId};
use crate::sys::is_alive;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidRecord {
    pub pid: u32,
    pub instance_id: InstanceId,
    pub relay_id: RelayId,
    pub started_at: DateTime<Utc>,
}

impl PidRecord {
    pub fn current(instance_id: InstanceId, relay_id: RelayId) -> Self {
        Self {
            pid: std::process::id(),
            instance_id,
            relay_id,
            started_at: Utc::now(),
        }
    }
}

/// What a PID file says about the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerState {
    Absent,
    Running(PidRecord),
    /// The recorded process is gone, or the file is unreadable.
    Stale(Option<PidRecord>),
}

/// Read the marker at `path` without modifying it.
pub fn inspect(path: &Path) -> Result<MarkerState, PidFileError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(MarkerState::Absent),
        Err(source) => {
            return Err(PidFileError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    match serde_json::from_str::<PidRecord>(&contents) {
        Ok(record) if is_alive(record.pid) => Ok(MarkerState::Running(record)),
        Ok(record) => Ok(MarkerState::Stale(Some(record))),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Unreadable pid file");
            Ok(MarkerState::Stale(None))
        }
    }
}

/// Remove a stale marker. Returns the stale record if there was one.
pub fn clear_stale(path: &Path) -> Result<Option<PidRecord>, PidFileError> {
    match inspect(path)? {
        MarkerState::Stale(record) => {
            remove(path)?;
            warn!(path = %path.display(), pid = ?record.as_ref().map(|r| r.pid), "Cleared stale pid file");
            Ok(record)
        }
        MarkerState::Absent | MarkerState::Running(_) => Ok(None),
    }
}

fn remove(path: &Path) -> Result<(), PidFileError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(PidFileError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// A held liveness marker. The file is removed when this is dropped.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    record: PidRecord,
}

impl PidFile {
    /// Write `record` to `path` unless another live relay holds the marker.
    ///
    /// A stale marker is cleared and returned alongside the new guard.
    pub fn acquire(
        path: impl Into<PathBuf>,
        record: PidRecord,
    ) -> Result<(Self, Option<PidRecord>), PidFileError> {
        let path = path.into();

        let stale = match inspect(&path)? {
            MarkerState::Running(existing) if existing.pid != record.pid => {
                return Err(PidFileError::AlreadyRunning { pid: existing.pid });
            }
            MarkerState::Running(_) | MarkerState::Absent => None,
            MarkerState::Stale(stale) => {
                warn!(
                    path = %path.display(),
                    pid = ?stale.as_ref().map(|r| r.pid),
                    "Found stale pid file, clearing"
                );
                stale
            }
        };

        let contents = serde_json::to_vec_pretty(&record).map_err(|source| PidFileError::Encode {
            path: path.clone(),
            source,
        })?;
        write_atomic(&path, &contents).map_err(|source| PidFileError::Io {
            path: path.clone(),
            source,
        })?;
        debug!(path = %path.display(), pid = record.pid, "Wrote pid file");

        Ok((Self { path, record }, stale))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self) -> &PidRecord {
        &self.record
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        // Only remove the marker if it still names this process.
        if let Ok(MarkerState::Running(current)) = inspect(&self.path) {
            if current.pid == self.record.pid {
                if let Err(e) = remove(&self.path) {
                    warn!(error = %e, "Failed to remove pid file");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pid: u32) -> PidRecord {
        PidRecord {
            pid,
            instance_id: InstanceId::generate(),
            relay_id: RelayId::from("pi-relay"),
            started_at: Utc::now(),
        }
    }

    fn dead_pid() -> u32 {
        let mut child = std::process::Command::new("/bin/sh")
            .arg("-c")
            .arg("exit 0")
            .spawn()
            .unwrap();
        let pid = child.id();
        child.wait().unwrap();
        pid
    }

    #[test]
    fn test_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run/relay.pid");

        let (marker, stale) = PidFile::acquire(&path, PidRecord::current(InstanceId::generate(), "a".into())).unwrap();
        assert!(stale.is_none());
        assert!(matches!(inspect(&path).unwrap(), MarkerState::Running(r) if r.pid == std::process::id()));

        drop(marker);
        assert_eq!(inspect(&path).unwrap(), MarkerState::Absent);
    }

    #[test]
    fn test_live_marker_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.pid");

        let mut other = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        fs::write(&path, serde_json::to_vec(&record(other.id())).unwrap()).unwrap();

        let result = PidFile::acquire(&path, record(std::process::id()));
        assert!(matches!(result, Err(PidFileError::AlreadyRunning { pid }) if pid == other.id()));

        other.kill().unwrap();
        other.wait().unwrap();
    }

    #[test]
    fn test_stale_marker_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.pid");
        let stale = record(dead_pid());
        fs::write(&path, serde_json::to_vec(&stale).unwrap()).unwrap();

        assert_eq!(inspect(&path).unwrap(), MarkerState::Stale(Some(stale.clone())));

        let (_marker, cleared) = PidFile::acquire(&path, record(std::process::id())).unwrap();
        assert_eq!(cleared, Some(stale));
    }

    #[test]
    fn test_clear_stale_leaves_live_marker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.pid");
        fs::write(&path, "not json").unwrap();

        assert_eq!(clear_stale(&path).unwrap(), None);
        assert_eq!(inspect(&path).unwrap(), MarkerState::Absent);

        let (_marker, _) = PidFile::acquire(&path, record(std::process::id())).unwrap();
        assert_eq!(clear_stale(&path).unwrap(), None);
        assert!(matches!(inspect(&path).unwrap(), MarkerState::Running(_)));
    }
}
