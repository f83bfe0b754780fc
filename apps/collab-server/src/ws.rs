use collaboration::{ClientRequest, CollaborationError, ServerMessage, Session, WorkspaceState};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::session::Tx;
use crate::AppState;

pub async fn handle_connection(stream: TcpStream, addr: SocketAddr, state: AppState) {
    let ws_stream = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", addr, e);
            return;
        }
    };

    info!("WebSocket connection established: {}", addr);

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    // Task to send messages to client
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if let Err(e) = ws_sender.send(msg).await {
                debug!("Failed to send message: {}", e);
                break;
            }
            if closing {
                break;
            }
        }
    });

    let mut session = Session::new();

    while let Some(msg) = ws_receiver.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                warn!("Error receiving message from {}: {}", addr, e);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                if let Err(e) = handle_text(&text, &state, &tx, &mut session).await {
                    debug!("Request from {} failed: {}", addr, e);
                    let reply = ServerMessage::Error {
                        message: e.to_string(),
                    };
                    if let Err(e) = send(&tx, &reply) {
                        debug!("Could not report error to {}: {}", addr, e);
                    }
                }
            }
            Message::Ping(data) => {
                let _ = tx.send(Message::Pong(data));
            }
            Message::Close(_) => {
                info!("Client {} requested close", addr);
                break;
            }
            _ => {}
        }
    }

    // Cleanup on disconnect
    if let (Some(workspace_id), Some(user_id)) = (session.workspace_id.clone(), session.user_id) {
        let closed = state.service.disconnect(&mut session);
        state.hub.detach(&workspace_id, &user_id);
        if let Some(closed) = closed {
            persist(&state, &closed).await;
        }
    }

    send_task.abort();
    info!("Connection closed: {}", addr);
}

async fn handle_text(
    text: &str,
    state: &AppState,
    tx: &Tx,
    session: &mut Session,
) -> anyhow::Result<()> {
    let request: ClientRequest = serde_json::from_str(text)
        .map_err(|e| CollaborationError::InvalidRequest(e.to_string()))?;

    // Route events to the joiner before the join emits its snapshot
    let joining = match &request {
        ClientRequest::JoinWorkspace {
            workspace_id, user, ..
        } if !session.is_joined() => Some((workspace_id.clone(), user.id)),
        _ => None,
    };

    if let Some((workspace_id, user_id)) = &joining {
        if let Some(store) = &state.store {
            if !state.service.registry().contains(workspace_id) {
                if let Some(saved) = store.load(workspace_id).await? {
                    state.service.registry().restore_if_absent(saved)?;
                }
            }
        }
        state.hub.attach(workspace_id, *user_id, tx.clone());
    }

    let before = session.clone();
    let reply = match state.service.handle(session, request) {
        Ok(reply) => reply,
        Err(err) => {
            if let Some((workspace_id, user_id)) = &joining {
                state.hub.detach(workspace_id, user_id);
            }
            return Err(err.into());
        }
    };

    // Left the workspace
    if let (Some(workspace_id), Some(user_id), false) =
        (&before.workspace_id, before.user_id, session.is_joined())
    {
        state.hub.detach(workspace_id, &user_id);
    }

    if let Some(closed) = reply.closed {
        persist(state, &closed).await;
    }

    if let Some(message) = reply.message {
        send(tx, &message)?;
    }

    Ok(())
}

fn send(tx: &Tx, message: &ServerMessage) -> anyhow::Result<()> {
    let json = serde_json::to_string(message)?;
    tx.send(Message::Text(json))?;
    Ok(())
}

/// Save a closed workspace if a state directory is configured
pub async fn persist(state: &AppState, closed: &WorkspaceState) {
    let Some(store) = &state.store else {
        return;
    };

    if let Err(e) = store.save(closed).await {
        error!("Failed to save workspace {}: {:#}", closed.id, e);
    }
}
