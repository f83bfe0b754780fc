/// Collaboration events and the notification seam to the transport layer
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::transform::Edit;
use crate::{
    CursorPosition, DocumentId, Operation, OperationId, Selection, User, UserId, WorkspaceId,
    WorkspaceSnapshot,
};

/// Unique event identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub uuid::Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

/// Event discriminant, handy for filtering and logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    WorkspaceStateSnapshot,
    UserJoined,
    UserLeft,
    DocumentCreated,
    DocumentUpdated,
    PresenceUpdated,
    ChatMessage,
    OperationRejected,
}

/// Event data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    WorkspaceStateSnapshot {
        snapshot: WorkspaceSnapshot,
    },

    UserJoined {
        user: User,
    },

    UserLeft {
        user_id: UserId,
        name: String,
    },

    DocumentCreated {
        document_id: DocumentId,
        content: String,
        version: u64,
    },

    DocumentUpdated {
        operation: Operation,
        /// Edits as applied to the authoritative content
        edits: Vec<Edit>,
        version: u64,
    },

    PresenceUpdated {
        user_id: UserId,
        cursor: Option<CursorPosition>,
        selection: Option<Selection>,
    },

    ChatMessage {
        user_id: UserId,
        name: String,
        text: String,
    },

    OperationRejected {
        operation_id: OperationId,
        document_id: DocumentId,
        reason: String,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::WorkspaceStateSnapshot { .. } => EventKind::WorkspaceStateSnapshot,
            EventPayload::UserJoined { .. } => EventKind::UserJoined,
            EventPayload::UserLeft { .. } => EventKind::UserLeft,
            EventPayload::DocumentCreated { .. } => EventKind::DocumentCreated,
            EventPayload::DocumentUpdated { .. } => EventKind::DocumentUpdated,
            EventPayload::PresenceUpdated { .. } => EventKind::PresenceUpdated,
            EventPayload::ChatMessage { .. } => EventKind::ChatMessage,
            EventPayload::OperationRejected { .. } => EventKind::OperationRejected,
        }
    }
}

/// Append-only audit and broadcast record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollaborationEvent {
    pub id: EventId,

    /// User whose request produced the event
    pub origin: UserId,

    pub workspace_id: WorkspaceId,
    pub payload: EventPayload,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl CollaborationEvent {
    pub fn new(workspace_id: WorkspaceId, origin: UserId, payload: EventPayload) -> Self {
        Self {
            id: EventId::new(),
            origin,
            workspace_id,
            payload,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

/// Who should receive an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recipients {
    All,
    AllExcept(UserId),
    Only(UserId),
}

impl Recipients {
    pub fn includes(&self, user_id: UserId) -> bool {
        match self {
            Recipients::All => true,
            Recipients::AllExcept(excluded) => *excluded != user_id,
            Recipients::Only(target) => *target == user_id,
        }
    }
}

/// Outbound seam consumed by the transport layer for fan-out.
///
/// Called while the workspace is locked, so implementations must not block
/// and must not call back into the workspace.
pub trait EventSink: Send + Sync {
    fn notify(&self, workspace_id: &WorkspaceId, event: &CollaborationEvent, recipients: Recipients);
}

/// Sink that drops every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn notify(&self, workspace_id: &WorkspaceId, event: &CollaborationEvent, _: Recipients) {
        debug!("Dropping {:?} event for workspace {}", event.kind(), workspace_id);
    }
}

/// Event together with its routing, as delivered by [`ChannelSink`]
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub workspace_id: WorkspaceId,
    pub event: CollaborationEvent,
    pub recipients: Recipients,
}

/// Sink forwarding notifications over an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn notify(&self, workspace_id: &WorkspaceId, event: &CollaborationEvent, recipients: Recipients) {
        let notification = Notification {
            workspace_id: workspace_id.clone(),
            event: event.clone(),
            recipients,
        };

        if self.tx.send(notification).is_err() {
            debug!("Notification receiver dropped; event {:?} lost", event.kind());
        }
    }
}
