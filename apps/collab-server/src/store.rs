/// JSON files holding the state of closed workspaces, one per workspace
use anyhow::Context;
use collaboration::{WorkspaceId, WorkspaceState};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Hex of the id bytes, so distinct ids never share a file on any filesystem
    fn path(&self, workspace_id: &WorkspaceId) -> PathBuf {
        let name: String = workspace_id
            .as_str()
            .bytes()
            .map(|b| format!("{:02x}", b))
            .collect();
        self.dir.join(format!("{}.json", name))
    }

    pub async fn save(&self, state: &WorkspaceState) -> anyhow::Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating {}", self.dir.display()))?;

        let path = self.path(&state.id);
        let json = state.to_json()?;
        fs::write(&path, json)
            .await
            .with_context(|| format!("writing {}", path.display()))?;

        info!("Saved workspace {} to {}", state.id, path.display());
        Ok(path)
    }

    /// Saved state for `workspace_id`, if any
    pub async fn load(&self, workspace_id: &WorkspaceId) -> anyhow::Result<Option<WorkspaceState>> {
        let path = self.path(workspace_id);
        if !fs::try_exists(&path).await? {
            debug!("No saved state for {}", workspace_id);
            return Ok(None);
        }

        let json = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let mut state = WorkspaceState::from_json(&json)?;
        if state.id != *workspace_id {
            warn!(
                "Ignoring {}: it holds workspace {}, not {}",
                path.display(),
                state.id,
                workspace_id
            );
            return Ok(None);
        }

        // Nobody is connected to a freshly loaded workspace
        state.members.clear();
        Ok(Some(state))
    }
}
