use collaboration::{
    CollaborationEvent, EventSink, Recipients, ServerMessage, UserId, WorkspaceId,
};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error};

pub type Tx = mpsc::UnboundedSender<Message>;

/// Open connections grouped by workspace; fans workspace events out as JSON frames
#[derive(Default)]
pub struct ConnectionHub {
    connections: DashMap<WorkspaceId, DashMap<UserId, Tx>>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, workspace_id: &WorkspaceId, user_id: UserId, tx: Tx) {
        self.connections
            .entry(workspace_id.clone())
            .or_default()
            .insert(user_id, tx);
        debug!("Attached {} to {}", user_id, workspace_id);
    }

    /// Stop routing events to a connection, handing back its sender
    pub fn detach(&self, workspace_id: &WorkspaceId, user_id: &UserId) -> Option<Tx> {
        let tx = self
            .connections
            .get(workspace_id)
            .and_then(|connections| connections.remove(user_id))
            .map(|(_, tx)| tx);
        self.connections
            .remove_if(workspace_id, |_, connections| connections.is_empty());
        debug!("Detached {} from {}", user_id, workspace_id);
        tx
    }

    pub fn connection_count(&self) -> usize {
        self.connections.iter().map(|entry| entry.value().len()).sum()
    }
}

impl EventSink for ConnectionHub {
    fn notify(&self, workspace_id: &WorkspaceId, event: &CollaborationEvent, recipients: Recipients) {
        let Some(connections) = self.connections.get(workspace_id) else {
            debug!("No connections for {}, dropping {:?}", workspace_id, event.kind());
            return;
        };

        let message = ServerMessage::Event {
            event: event.clone(),
        };
        let json = match serde_json::to_string(&message) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize event: {}", e);
                return;
            }
        };

        for entry in connections.iter() {
            if !recipients.includes(*entry.key()) {
                continue;
            }

            if entry.value().send(Message::Text(json.clone())).is_err() {
                debug!("Connection for {} already closed", entry.key());
            }
        }
    }
}
