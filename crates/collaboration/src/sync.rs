/// Request/response protocol between connected clients and the workspace registry
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::{
    ApplyOutcome, CollaborationError, CollaborationEvent, DocumentId, LamportClock, Operation,
    OperationId, OperationKind, Result, Selection, User, UserId, WorkspaceId, WorkspaceRegistry,
    WorkspaceState,
};

/// Messages sent by a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    JoinWorkspace {
        workspace_id: WorkspaceId,
        /// Display name used if the workspace does not exist yet
        #[serde(default)]
        workspace_name: Option<String>,
        user: User,
    },

    LeaveWorkspace,

    CreateDocument {
        document_id: DocumentId,
        #[serde(default)]
        content: String,
    },

    SubmitOperation {
        operation_id: OperationId,
        document_id: DocumentId,
        position: i64,
        /// Document version the client last observed
        #[serde(default)]
        base_version: u64,
        #[serde(default)]
        clock: LamportClock,
        edit: OperationKind,
    },

    UpdatePresence {
        document_id: DocumentId,
        position: i64,
        #[serde(default)]
        selection: Option<Selection>,
    },

    SendChat {
        text: String,
    },

    Ping,
}

/// Messages sent to a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Event {
        event: CollaborationEvent,
    },

    /// Operation accepted, or recognized as already applied
    Ack {
        operation_id: OperationId,
        version: u64,
        duplicate: bool,
    },

    Error {
        message: String,
    },

    Pong,
}

impl ServerMessage {
    pub fn error(err: &CollaborationError) -> Self {
        ServerMessage::Error {
            message: err.to_string(),
        }
    }
}

/// Which workspace a connection has joined, and as whom
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub workspace_id: Option<WorkspaceId>,
    pub user_id: Option<UserId>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_joined(&self) -> bool {
        self.workspace_id.is_some() && self.user_id.is_some()
    }

    fn membership(&self) -> Result<(WorkspaceId, UserId)> {
        match (&self.workspace_id, self.user_id) {
            (Some(workspace_id), Some(user_id)) => Ok((workspace_id.clone(), user_id)),
            _ => Err(CollaborationError::InvalidRequest(
                "join a workspace first".to_string(),
            )),
        }
    }
}

/// Outcome of handling one request
#[derive(Debug, Default)]
pub struct Reply {
    /// Direct response for the requesting connection
    pub message: Option<ServerMessage>,

    /// Final state of a workspace closed because its last member left
    pub closed: Option<WorkspaceState>,
}

impl Reply {
    fn none() -> Self {
        Self::default()
    }

    fn message(message: ServerMessage) -> Self {
        Self {
            message: Some(message),
            closed: None,
        }
    }
}

/// Routes client requests to the registry on behalf of one connection each
#[derive(Clone)]
pub struct CollaborationService {
    registry: Arc<WorkspaceRegistry>,
}

impl CollaborationService {
    pub fn new(registry: Arc<WorkspaceRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<WorkspaceRegistry> {
        &self.registry
    }

    pub fn handle(&self, session: &mut Session, request: ClientRequest) -> Result<Reply> {
        match request {
            ClientRequest::JoinWorkspace {
                workspace_id,
                workspace_name,
                user,
            } => {
                if let Some(current) = &session.workspace_id {
                    return Err(CollaborationError::InvalidRequest(format!(
                        "already joined workspace {}",
                        current
                    )));
                }

                let user_id = user.id;
                self.registry
                    .join(&workspace_id, workspace_name.as_deref(), user)?;
                session.workspace_id = Some(workspace_id);
                session.user_id = Some(user_id);
                Ok(Reply::none())
            }

            ClientRequest::LeaveWorkspace => {
                session.membership()?;
                Ok(Reply {
                    message: None,
                    closed: self.leave(session)?,
                })
            }

            ClientRequest::CreateDocument {
                document_id,
                content,
            } => {
                let (workspace_id, user_id) = session.membership()?;
                self.registry.with_workspace(&workspace_id, |workspace| {
                    workspace
                        .create_document(&user_id, document_id, content)
                        .map(|_| ())
                })?;
                Ok(Reply::none())
            }

            ClientRequest::SubmitOperation {
                operation_id,
                document_id,
                position,
                base_version,
                clock,
                edit,
            } => {
                let (workspace_id, user_id) = session.membership()?;
                let position = usize::try_from(position).map_err(|_| {
                    CollaborationError::InvalidOperation(format!("negative position {}", position))
                })?;

                let operation = Operation::new(user_id, document_id, position, edit)
                    .with_id(operation_id)
                    .with_clock(clock)
                    .with_base_version(base_version);

                let outcome = self
                    .registry
                    .with_workspace(&workspace_id, |workspace| {
                        workspace.apply_operation(operation)
                    })?;

                Ok(Reply::message(ServerMessage::Ack {
                    operation_id,
                    version: outcome.version(),
                    duplicate: matches!(outcome, ApplyOutcome::Duplicate { .. }),
                }))
            }

            ClientRequest::UpdatePresence {
                document_id,
                position,
                selection,
            } => {
                let (workspace_id, user_id) = session.membership()?;
                let position = usize::try_from(position).map_err(|_| {
                    CollaborationError::InvalidRequest(format!("negative position {}", position))
                })?;

                self.registry.with_workspace(&workspace_id, |workspace| {
                    workspace.update_presence(&user_id, document_id, position, selection)
                })?;
                Ok(Reply::none())
            }

            ClientRequest::SendChat { text } => {
                let (workspace_id, user_id) = session.membership()?;
                self.registry.with_workspace(&workspace_id, |workspace| {
                    workspace.send_chat(&user_id, text)
                })?;
                Ok(Reply::none())
            }

            ClientRequest::Ping => {
                // Keeps joined members clear of the idle sweep
                if let Ok((workspace_id, user_id)) = session.membership() {
                    if let Err(err) = self.registry.with_workspace(&workspace_id, |workspace| {
                        workspace.touch_member(&user_id)
                    }) {
                        debug!("Ping from stale session: {}", err);
                    }
                }
                Ok(Reply::message(ServerMessage::Pong))
            }
        }
    }

    /// Leave the joined workspace, closing it if it is now empty
    fn leave(&self, session: &mut Session) -> Result<Option<WorkspaceState>> {
        let (workspace_id, user_id) = session.membership()?;
        session.workspace_id = None;
        session.user_id = None;

        let remaining = self.registry.leave(&workspace_id, &user_id)?;
        if remaining > 0 {
            return Ok(None);
        }
        Ok(self.registry.teardown_if_empty(&workspace_id))
    }

    /// Clean up after a dropped connection
    pub fn disconnect(&self, session: &mut Session) -> Option<WorkspaceState> {
        if !session.is_joined() {
            return None;
        }

        match self.leave(session) {
            Ok(closed) => closed,
            Err(CollaborationError::UnknownUser(user_id)) => {
                // Already removed, e.g. by the idle sweep
                debug!("User {} was no longer a member on disconnect", user_id);
                None
            }
            Err(err) => {
                warn!("Failed to leave workspace on disconnect: {}", err);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NullSink, WorkspaceConfig};

    fn service() -> CollaborationService {
        CollaborationService::new(Arc::new(WorkspaceRegistry::new(
            Arc::new(NullSink),
            WorkspaceConfig::default(),
        )))
    }

    fn join(service: &CollaborationService, name: &str) -> Session {
        let mut session = Session::new();
        service
            .handle(
                &mut session,
                ClientRequest::JoinWorkspace {
                    workspace_id: WorkspaceId::from("team"),
                    workspace_name: None,
                    user: User::new(UserId::new(), name),
                },
            )
            .unwrap();
        session
    }

    #[test]
    fn test_request_wire_format() {
        let json = r#"{
            "type": "submit_operation",
            "operation_id": "6f1c1f9e-7c1a-4a55-9f0e-0d7b7f1d2a10",
            "document_id": "notes",
            "position": 3,
            "base_version": 2,
            "edit": { "type": "insert", "text": "hi" }
        }"#;

        let request: ClientRequest = serde_json::from_str(json).unwrap();
        match request {
            ClientRequest::SubmitOperation {
                position,
                base_version,
                clock,
                edit,
                ..
            } => {
                assert_eq!(position, 3);
                assert_eq!(base_version, 2);
                assert_eq!(clock, LamportClock(0));
                assert_eq!(edit.content(), "hi");
            }
            other => panic!("unexpected request {:?}", other),
        }

        let ping: ClientRequest = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(ping, ClientRequest::Ping);
    }

    #[test]
    fn test_requests_before_join_are_refused() {
        let service = service();
        let mut session = Session::new();

        let result = service.handle(
            &mut session,
            ClientRequest::SendChat {
                text: "hello".to_string(),
            },
        );
        assert!(matches!(result, Err(CollaborationError::InvalidRequest(_))));

        let pong = service.handle(&mut session, ClientRequest::Ping).unwrap();
        assert_eq!(pong.message, Some(ServerMessage::Pong));
    }

    #[test]
    fn test_double_join_is_refused() {
        let service = service();
        let mut session = join(&service, "Alice");

        let result = service.handle(
            &mut session,
            ClientRequest::JoinWorkspace {
                workspace_id: WorkspaceId::from("other"),
                workspace_name: None,
                user: User::new(UserId::new(), "Alice"),
            },
        );
        assert!(matches!(result, Err(CollaborationError::InvalidRequest(_))));
    }

    #[test]
    fn test_submit_acknowledges_and_deduplicates() {
        let service = service();
        let mut session = join(&service, "Alice");
        service
            .handle(
                &mut session,
                ClientRequest::CreateDocument {
                    document_id: DocumentId::from("notes"),
                    content: "abc".to_string(),
                },
            )
            .unwrap();

        let operation_id = OperationId::new();
        let submit = ClientRequest::SubmitOperation {
            operation_id,
            document_id: DocumentId::from("notes"),
            position: 3,
            base_version: 0,
            clock: LamportClock(1),
            edit: OperationKind::Insert {
                text: "d".to_string(),
            },
        };

        let first = service.handle(&mut session, submit.clone()).unwrap();
        assert_eq!(
            first.message,
            Some(ServerMessage::Ack {
                operation_id,
                version: 1,
                duplicate: false,
            })
        );

        let retry = service.handle(&mut session, submit).unwrap();
        assert_eq!(
            retry.message,
            Some(ServerMessage::Ack {
                operation_id,
                version: 1,
                duplicate: true,
            })
        );
    }

    #[test]
    fn test_negative_position_is_invalid() {
        let service = service();
        let mut session = join(&service, "Alice");

        let result = service.handle(
            &mut session,
            ClientRequest::SubmitOperation {
                operation_id: OperationId::new(),
                document_id: DocumentId::from("notes"),
                position: -1,
                base_version: 0,
                clock: LamportClock(0),
                edit: OperationKind::Insert {
                    text: "x".to_string(),
                },
            },
        );
        assert!(matches!(result, Err(CollaborationError::InvalidOperation(_))));
    }

    #[test]
    fn test_last_leave_closes_workspace() {
        let service = service();
        let mut alice = join(&service, "Alice");
        let mut bob = join(&service, "Bob");

        let reply = service
            .handle(&mut alice, ClientRequest::LeaveWorkspace)
            .unwrap();
        assert!(reply.closed.is_none());
        assert!(!alice.is_joined());

        let closed = service.disconnect(&mut bob).unwrap();
        assert_eq!(closed.id, WorkspaceId::from("team"));
        assert!(service.registry().is_empty());

        // Nothing left to clean up
        assert!(service.disconnect(&mut bob).is_none());
    }
}
