use std::fmt::{self, Display};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The configured name of a relay, reported in heartbeats and status output.
///
/// This is operator supplied and stable across restarts, unlike [`InstanceId`].
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelayId(Arc<str>);

impl RelayId {
    /// Create a new [`RelayId`] from any type that can be converted into an `Arc<str>`.
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    /// Returns the underlying string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RelayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for RelayId {
    fn from(s: String) -> Self {
        Self(s.into())
    }
}

impl From<&str> for RelayId {
    fn from(s: &str) -> Self {
        Self(s.into())
    }
}

/// Identifies one running relay process. A new id is generated for every process start so
/// that the base station can tell a restarted relay from a long-lived one.
#[derive(Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(Uuid);

impl InstanceId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Debug for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InstanceId({})", self.0)
    }
}

impl Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
