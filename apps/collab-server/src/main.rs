//! Collaborative text editing WebSocket server

use clap::Parser;
use collaboration::{CollaborationService, WorkspaceConfig, WorkspaceRegistry};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

mod session;
mod store;
mod ws;

use session::ConnectionHub;
use store::StateStore;

#[derive(Parser, Debug)]
#[command(name = "collab-server")]
#[command(about = "Real-time collaborative plain-text editing server")]
#[command(version)]
struct Cli {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Directory where closed workspaces are saved and restored from
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Log entries kept per document
    #[arg(long, default_value_t = 10_000)]
    history_limit: usize,

    /// Seconds without activity before a member is removed
    #[arg(long, default_value_t = 300)]
    idle_timeout: i64,

    /// Seconds between idle sweeps
    #[arg(long, default_value_t = 30)]
    sweep_interval: u64,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "collab_server=info,collaboration=info")]
    log_filter: String,
}

/// Shared by every connection
#[derive(Clone)]
pub struct AppState {
    pub service: CollaborationService,
    pub hub: Arc<ConnectionHub>,
    pub store: Option<Arc<StateStore>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_filter)),
        )
        .init();

    let hub = Arc::new(ConnectionHub::new());
    let config = WorkspaceConfig {
        history_limit: cli.history_limit,
        idle_timeout_secs: cli.idle_timeout,
    };
    let registry = Arc::new(WorkspaceRegistry::new(hub.clone(), config));

    let state = AppState {
        service: CollaborationService::new(registry),
        hub,
        store: cli.state_dir.map(|dir| Arc::new(StateStore::new(dir))),
    };

    let listener = TcpListener::bind(cli.listen).await?;
    info!("Collaboration server listening on: {}", cli.listen);

    tokio::spawn(sweep_idle(
        state.clone(),
        Duration::from_secs(cli.sweep_interval.max(1)),
    ));

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, addr) = accepted?;
                info!("New connection from: {}", addr);
                tokio::spawn(ws::handle_connection(stream, addr, state.clone()));
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    let registry = state.service.registry();
    for workspace_id in registry.workspace_ids() {
        if let Some(closed) = registry.teardown(&workspace_id) {
            ws::persist(&state, &closed).await;
        }
    }

    Ok(())
}

/// Drop idle members, close their connections and tear down emptied workspaces
async fn sweep_idle(state: AppState, period: Duration) {
    let mut interval = tokio::time::interval(period);
    let registry = state.service.registry().clone();

    loop {
        interval.tick().await;

        let mut emptied = HashSet::new();
        for (workspace_id, user_id) in registry.sweep_idle() {
            if let Some(tx) = state.hub.detach(&workspace_id, &user_id) {
                let _ = tx.send(Message::Close(None));
            }
            emptied.insert(workspace_id);
        }

        for workspace_id in emptied {
            if let Some(closed) = registry.teardown_if_empty(&workspace_id) {
                ws::persist(&state, &closed).await;
            }
        }

        debug!(
            "Registry: {:?}, {} connections",
            registry.stats(),
            state.hub.connection_count()
        );
    }
}
