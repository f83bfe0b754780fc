/// Collaborative plain-text editing core
/// Operational transform engine, workspace state and event fan-out seam
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

mod operations;
pub use operations::*;

pub mod transform;
pub use transform::{Edit, Transformed};

mod document;
pub use document::*;

mod presence;
pub use presence::*;

mod events;
pub use events::*;

mod workspace;
pub use workspace::*;

mod registry;
pub use registry::*;

mod sync;
pub use sync::*;

#[derive(Debug, Error)]
pub enum CollaborationError {
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("unknown workspace: {0}")]
    UnknownWorkspace(WorkspaceId),

    #[error("unknown user: {0}")]
    UnknownUser(UserId),

    #[error("document already exists: {0}")]
    DocumentExists(DocumentId),

    #[error("workspace unhealthy: {0}")]
    WorkspaceUnhealthy(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("serialization error: {0}")]
    SerializationError(String),
}

impl From<serde_json::Error> for CollaborationError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CollaborationError>;

/// User identifier in a collaborative workspace
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(pub uuid::Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Workspace identifier, chosen by whoever opens the workspace
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkspaceId(pub String);

impl WorkspaceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkspaceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Document identifier, unique within a workspace
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocumentId(pub String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Lamport timestamp assigned by the author of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LamportClock(pub u64);

impl LamportClock {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn tick(&mut self) {
        self.0 += 1;
    }

    pub fn update(&mut self, other: LamportClock) {
        self.0 = self.0.max(other.0) + 1;
    }
}

impl Default for LamportClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lamport_update_jumps_past_remote() {
        let mut clock = LamportClock(3);
        clock.update(LamportClock(10));
        assert_eq!(clock, LamportClock(11));

        clock.update(LamportClock(2));
        assert_eq!(clock, LamportClock(12));

        clock.tick();
        assert_eq!(clock.0, 13);
    }

    #[test]
    fn test_ids_display_raw_value() {
        assert_eq!(WorkspaceId::from("team").to_string(), "team");
        assert_eq!(DocumentId::new("notes.md").as_str(), "notes.md");
    }
}
