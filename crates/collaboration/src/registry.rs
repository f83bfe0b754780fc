use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::{
    CollaborationError, EventSink, Result, User, UserId, Workspace, WorkspaceConfig, WorkspaceId,
    WorkspaceSnapshot, WorkspaceState,
};

/// One workspace behind its serialization point. `None` once torn down.
type Slot = Arc<Mutex<Option<Workspace>>>;

/// Aggregate counters over all live workspaces
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub workspaces: usize,
    pub members: usize,
    pub documents: usize,
    pub operations: usize,
}

/// Owns every live workspace.
///
/// Calls on different workspaces proceed in parallel; calls on the same workspace
/// are serialized by its mutex. No map shard is held while a workspace lock is
/// awaited: teardown unlinks first and then waits for the in-flight call, while
/// teardown_if_empty waits first and unlinks under the workspace lock.
pub struct WorkspaceRegistry {
    workspaces: DashMap<WorkspaceId, Slot>,
    sink: Arc<dyn EventSink>,
    config: WorkspaceConfig,
}

impl WorkspaceRegistry {
    pub fn new(sink: Arc<dyn EventSink>, config: WorkspaceConfig) -> Self {
        Self {
            workspaces: DashMap::new(),
            sink,
            config,
        }
    }

    pub fn config(&self) -> &WorkspaceConfig {
        &self.config
    }

    /// Add `user` to a workspace, creating it on first join
    pub fn join(
        &self,
        workspace_id: &WorkspaceId,
        name: Option<&str>,
        user: User,
    ) -> Result<WorkspaceSnapshot> {
        loop {
            let slot = self
                .workspaces
                .entry(workspace_id.clone())
                .or_insert_with(|| {
                    let name = name.unwrap_or(workspace_id.as_str());
                    Arc::new(Mutex::new(Some(Workspace::new(
                        workspace_id.clone(),
                        name,
                        self.config.clone(),
                        self.sink.clone(),
                    ))))
                })
                .clone();

            let mut guard = slot.lock();
            match guard.as_mut() {
                Some(workspace) => return workspace.add_member(user),
                // Torn down between lookup and lock; the next pass creates a fresh one
                None => debug!("Workspace {} closed during join, retrying", workspace_id),
            }
        }
    }

    /// Run `f` with exclusive access to one workspace
    pub fn with_workspace<R>(
        &self,
        workspace_id: &WorkspaceId,
        f: impl FnOnce(&mut Workspace) -> Result<R>,
    ) -> Result<R> {
        let slot = self.slot(workspace_id)?;
        let mut guard = slot.lock();
        let workspace = guard
            .as_mut()
            .ok_or_else(|| CollaborationError::UnknownWorkspace(workspace_id.clone()))?;
        f(workspace)
    }

    /// Remove a member, returning how many remain
    pub fn leave(&self, workspace_id: &WorkspaceId, user_id: &UserId) -> Result<usize> {
        self.with_workspace(workspace_id, |workspace| {
            workspace.remove_member(user_id)?;
            Ok(workspace.member_count())
        })
    }

    /// Discard a workspace and hand back its final state
    pub fn teardown(&self, workspace_id: &WorkspaceId) -> Option<WorkspaceState> {
        let (_, slot) = self.workspaces.remove(workspace_id)?;
        let mut guard = slot.lock();
        Self::close(workspace_id, &mut guard)
    }

    /// Tear a workspace down only if nobody is left in it
    pub fn teardown_if_empty(&self, workspace_id: &WorkspaceId) -> Option<WorkspaceState> {
        let slot = self.slot(workspace_id).ok()?;
        let mut guard = slot.lock();
        if guard.as_ref().is_some_and(|workspace| !workspace.is_empty()) {
            return None;
        }

        // Unlinked while still locked so no join can slip in; a restored replacement stays
        self.workspaces
            .remove_if(workspace_id, |_, current| Arc::ptr_eq(current, &slot));
        Self::close(workspace_id, &mut guard)
    }

    fn close(workspace_id: &WorkspaceId, slot: &mut Option<Workspace>) -> Option<WorkspaceState> {
        let workspace = slot.take()?;
        info!(
            "Workspace {} torn down ({} operations)",
            workspace_id,
            workspace.log().len()
        );
        Some(workspace.save_state())
    }

    /// Rebuild a workspace from saved state, replacing any live instance
    pub fn restore(&self, state: WorkspaceState) -> Result<WorkspaceId> {
        let workspace = Workspace::load_state(state, self.config.clone(), self.sink.clone())?;
        let workspace_id = workspace.id().clone();

        let previous = self
            .workspaces
            .insert(workspace_id.clone(), Arc::new(Mutex::new(Some(workspace))));
        if let Some(previous) = previous {
            previous.lock().take();
            info!("Workspace {} replaced by restored state", workspace_id);
        }

        Ok(workspace_id)
    }

    /// Rebuild a workspace from saved state unless one is already live.
    /// Returns whether the saved state was used.
    pub fn restore_if_absent(&self, state: WorkspaceState) -> Result<bool> {
        match self.workspaces.entry(state.id.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(entry) => {
                let workspace =
                    Workspace::load_state(state, self.config.clone(), self.sink.clone())?;
                info!("Workspace {} restored from saved state", workspace.id());
                entry.insert(Arc::new(Mutex::new(Some(workspace))));
                Ok(true)
            }
        }
    }

    pub fn contains(&self, workspace_id: &WorkspaceId) -> bool {
        self.workspaces.contains_key(workspace_id)
    }

    pub fn len(&self) -> usize {
        self.workspaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workspaces.is_empty()
    }

    pub fn workspace_ids(&self) -> Vec<WorkspaceId> {
        self.workspaces.iter().map(|e| e.key().clone()).collect()
    }

    /// Remove members idle past the configured timeout
    pub fn sweep_idle(&self) -> Vec<(WorkspaceId, UserId)> {
        let mut removed = Vec::new();

        for slot in self.slots() {
            let mut guard = slot.lock();
            let Some(workspace) = guard.as_mut() else {
                continue;
            };

            for user_id in workspace.idle_members() {
                if workspace.remove_member(&user_id).is_ok() {
                    info!("Removed idle user {} from {}", user_id, workspace.id());
                    removed.push((workspace.id().clone(), user_id));
                }
            }
        }

        removed
    }

    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();

        for slot in self.slots() {
            if let Some(workspace) = slot.lock().as_ref() {
                stats.workspaces += 1;
                stats.members += workspace.member_count();
                stats.documents += workspace.document_count();
                stats.operations += workspace.log().len();
            }
        }

        stats
    }

    fn slot(&self, workspace_id: &WorkspaceId) -> Result<Slot> {
        self.workspaces
            .get(workspace_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CollaborationError::UnknownWorkspace(workspace_id.clone()))
    }

    // Cloned out so no map shard is held while a workspace is locked
    fn slots(&self) -> Vec<Slot> {
        self.workspaces.iter().map(|e| e.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DocumentId, NullSink, Operation};
    use std::sync::mpsc;
    use std::thread;
    use std::time::{Duration, Instant};

    fn registry() -> WorkspaceRegistry {
        WorkspaceRegistry::new(Arc::new(NullSink), WorkspaceConfig::default())
    }

    #[test]
    fn test_join_creates_workspace_lazily() {
        let registry = registry();
        let id = WorkspaceId::from("team");
        assert!(!registry.contains(&id));

        let snapshot = registry
            .join(&id, Some("Team"), User::new(UserId::new(), "Alice"))
            .unwrap();
        assert_eq!(snapshot.name, "Team");
        assert_eq!(snapshot.members.len(), 1);

        let snapshot = registry
            .join(&id, None, User::new(UserId::new(), "Bob"))
            .unwrap();
        assert_eq!(snapshot.name, "Team");
        assert_eq!(snapshot.members.len(), 2);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unknown_workspace() {
        let registry = registry();
        let result = registry.with_workspace(&WorkspaceId::from("missing"), |_| Ok(()));
        assert!(matches!(result, Err(CollaborationError::UnknownWorkspace(_))));
    }

    #[test]
    fn test_leave_and_teardown_if_empty() {
        let registry = registry();
        let id = WorkspaceId::from("team");
        let alice = User::new(UserId::new(), "Alice");
        let bob = User::new(UserId::new(), "Bob");
        registry.join(&id, None, alice.clone()).unwrap();
        registry.join(&id, None, bob.clone()).unwrap();

        assert_eq!(registry.leave(&id, &alice.id).unwrap(), 1);
        assert!(registry.teardown_if_empty(&id).is_none());
        assert!(registry.contains(&id));

        assert_eq!(registry.leave(&id, &bob.id).unwrap(), 0);
        let state = registry.teardown_if_empty(&id).unwrap();
        assert_eq!(state.id, id);
        assert!(!registry.contains(&id));
    }

    #[test]
    fn test_teardown_waits_for_in_flight_call() {
        let registry = Arc::new(registry());
        let id = WorkspaceId::from("team");
        let alice = User::new(UserId::new(), "Alice");
        registry.join(&id, None, alice.clone()).unwrap();
        registry
            .with_workspace(&id, |ws| {
                ws.create_document(&alice.id, DocumentId::from("doc"), "")
                    .map(|_| ())
            })
            .unwrap();

        let (locked_tx, locked_rx) = mpsc::channel();
        let worker = {
            let registry = registry.clone();
            let id = id.clone();
            thread::spawn(move || {
                registry.with_workspace(&id, |ws| {
                    locked_tx.send(()).unwrap();
                    thread::sleep(Duration::from_millis(50));
                    ws.apply_operation(Operation::insert(alice.id, "doc", 0, "late"))
                })
            })
        };

        locked_rx.recv().unwrap();
        let state = registry.teardown(&id).unwrap();

        assert!(worker.join().unwrap().is_ok());
        assert_eq!(state.documents[0].content, "late");
        assert!(matches!(
            registry.with_workspace(&id, |_| Ok(())),
            Err(CollaborationError::UnknownWorkspace(_))
        ));
    }

    #[test]
    fn test_waiting_teardown_if_empty_leaves_lookups_free() {
        let registry = Arc::new(registry());
        let id = WorkspaceId::from("team");
        registry
            .join(&id, None, User::new(UserId::new(), "Alice"))
            .unwrap();

        let (locked_tx, locked_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let holder = {
            let registry = registry.clone();
            let id = id.clone();
            thread::spawn(move || {
                registry.with_workspace(&id, |_| {
                    locked_tx.send(()).unwrap();
                    let _ = release_rx.recv_timeout(Duration::from_secs(5));
                    Ok(())
                })
            })
        };
        locked_rx.recv().unwrap();

        let closer = {
            let registry = registry.clone();
            let id = id.clone();
            thread::spawn(move || registry.teardown_if_empty(&id))
        };
        thread::sleep(Duration::from_millis(50));

        // The closer is parked on the workspace lock, not on the map
        let started = Instant::now();
        assert!(registry.contains(&id));
        assert!(registry.slot(&id).is_ok());
        assert!(started.elapsed() < Duration::from_secs(1));

        release_tx.send(()).unwrap();
        holder.join().unwrap().unwrap();
        assert!(closer.join().unwrap().is_none());
        assert!(registry.contains(&id));
    }

    #[test]
    fn test_restore_replaces_live_workspace() {
        let registry = registry();
        let id = WorkspaceId::from("team");
        let alice = User::new(UserId::new(), "Alice");
        registry.join(&id, None, alice.clone()).unwrap();
        registry
            .with_workspace(&id, |ws| {
                ws.create_document(&alice.id, DocumentId::from("doc"), "saved")
                    .map(|_| ())
            })
            .unwrap();

        let state = registry.teardown(&id).unwrap();
        assert!(registry.is_empty());

        let restored = registry.restore(state.clone()).unwrap();
        assert_eq!(restored, id);
        assert!(!registry.restore_if_absent(state).unwrap());
        let content = registry
            .with_workspace(&id, |ws| {
                Ok(ws.document(&DocumentId::from("doc")).map(|d| d.content.clone()))
            })
            .unwrap();
        assert_eq!(content.as_deref(), Some("saved"));
    }

    #[test]
    fn test_stats_and_idle_sweep() {
        let registry = WorkspaceRegistry::new(
            Arc::new(NullSink),
            WorkspaceConfig {
                idle_timeout_secs: -1,
                ..WorkspaceConfig::default()
            },
        );
        let id = WorkspaceId::from("team");
        registry
            .join(&id, None, User::new(UserId::new(), "Alice"))
            .unwrap();
        assert_eq!(registry.stats().members, 1);

        // Negative timeout makes everyone idle immediately
        let removed = registry.sweep_idle();
        assert_eq!(removed.len(), 1);
        assert_eq!(registry.stats().members, 0);
        assert_eq!(registry.stats().workspaces, 1);
    }
}
