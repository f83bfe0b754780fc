/// Collaborative workspace: documents, operation log, membership and events.
/// Every mutating call is expected to run under the workspace's serialization point.
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::transform::{self, Edit};
use crate::{
    AppliedOperation, CollaborationError, CollaborationEvent, CursorPosition, Document,
    DocumentId, EventPayload, EventSink, LamportClock, Member, Operation, OperationLog,
    PresenceManager, Priority, Recipients, Result, Selection, User, UserId, WorkspaceId,
};

/// Tunables shared by every workspace of a registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Log entries retained per document before the oldest are compacted away
    pub history_limit: usize,

    /// Seconds without activity before a member counts as idle
    pub idle_timeout_secs: i64,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            history_limit: 10_000,
            idle_timeout_secs: 60,
        }
    }
}

impl WorkspaceConfig {
    pub fn idle_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.idle_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Health {
    Healthy,
    /// Log and document versions disagree; no further edits until restored
    Unhealthy { reason: String },
}

/// Result of a successful `apply_operation` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied { version: u64, edits: Vec<Edit> },

    /// Operation id already logged; nothing changed
    Duplicate { version: u64 },
}

impl ApplyOutcome {
    pub fn version(&self) -> u64 {
        match self {
            ApplyOutcome::Applied { version, .. } | ApplyOutcome::Duplicate { version } => {
                *version
            }
        }
    }
}

/// Workspace view handed to joining members
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceSnapshot {
    pub workspace_id: WorkspaceId,
    pub name: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub members: Vec<Member>,
    pub documents: Vec<Document>,
    pub clock: LamportClock,
    pub health: Health,
    pub total_operations: usize,
    pub total_events: usize,
}

/// Everything needed to rebuild a workspace, for an external persistence layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceState {
    pub id: WorkspaceId,
    pub name: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub clock: LamportClock,
    pub members: Vec<Member>,
    pub documents: Vec<Document>,
    pub log: OperationLog,
    pub events: Vec<CollaborationEvent>,
}

impl WorkspaceState {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

pub struct Workspace {
    id: WorkspaceId,
    name: String,
    created_at: chrono::DateTime<chrono::Utc>,
    presence: PresenceManager,
    documents: HashMap<DocumentId, Document>,
    log: OperationLog,
    events: Vec<CollaborationEvent>,
    clock: LamportClock,
    health: Health,
    config: WorkspaceConfig,
    sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("members", &self.presence.len())
            .field("documents", &self.documents.len())
            .field("operations", &self.log.len())
            .field("health", &self.health)
            .finish()
    }
}

impl Workspace {
    pub fn new(
        id: WorkspaceId,
        name: impl Into<String>,
        config: WorkspaceConfig,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let name = name.into();
        info!("Workspace created: {} ({})", name, id);

        Self {
            id,
            name,
            created_at: chrono::Utc::now(),
            presence: PresenceManager::new(),
            documents: HashMap::new(),
            log: OperationLog::new(),
            events: Vec::new(),
            clock: LamportClock::new(),
            health: Health::Healthy,
            config,
            sink,
        }
    }

    pub fn id(&self) -> &WorkspaceId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn health(&self) -> &Health {
        &self.health
    }

    pub fn is_healthy(&self) -> bool {
        self.health == Health::Healthy
    }

    pub fn clock(&self) -> LamportClock {
        self.clock
    }

    pub fn member(&self, user_id: &UserId) -> Option<&Member> {
        self.presence.get(user_id)
    }

    pub fn members(&self) -> Vec<&Member> {
        self.presence.members()
    }

    pub fn member_count(&self) -> usize {
        self.presence.len()
    }

    pub fn is_empty(&self) -> bool {
        self.presence.is_empty()
    }

    pub fn document(&self, document_id: &DocumentId) -> Option<&Document> {
        self.documents.get(document_id)
    }

    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    pub fn log(&self) -> &OperationLog {
        &self.log
    }

    pub fn events(&self) -> &[CollaborationEvent] {
        &self.events
    }

    /// Add a member (or refresh a rejoining one) and send them the current state
    pub fn add_member(&mut self, user: User) -> Result<WorkspaceSnapshot> {
        let user_id = user.id;
        if self.presence.insert(Member::new(user.clone())).is_some() {
            debug!("User {} rejoined workspace {}", user_id, self.id);
        }

        info!("User joined workspace {}: {}", self.id, user.name);
        self.emit(
            user_id,
            EventPayload::UserJoined { user },
            Recipients::AllExcept(user_id),
        );

        let snapshot = self.get_state();
        self.send(
            user_id,
            EventPayload::WorkspaceStateSnapshot {
                snapshot: snapshot.clone(),
            },
            Recipients::Only(user_id),
        );

        Ok(snapshot)
    }

    pub fn remove_member(&mut self, user_id: &UserId) -> Result<Member> {
        let member = self
            .presence
            .remove(user_id)
            .ok_or(CollaborationError::UnknownUser(*user_id))?;

        info!("User left workspace {}: {}", self.id, member.user.name);
        self.emit(
            *user_id,
            EventPayload::UserLeft {
                user_id: *user_id,
                name: member.user.name.clone(),
            },
            Recipients::AllExcept(*user_id),
        );

        Ok(member)
    }

    /// Create an empty or pre-filled document at version 0
    pub fn create_document(
        &mut self,
        user_id: &UserId,
        document_id: DocumentId,
        content: impl Into<String>,
    ) -> Result<&Document> {
        self.ensure_healthy()?;
        self.ensure_member(user_id)?;

        if self.documents.contains_key(&document_id) {
            return Err(CollaborationError::DocumentExists(document_id));
        }

        let document = Document::new(document_id.clone(), content);
        info!(
            "Document {} created in workspace {} ({} chars)",
            document_id,
            self.id,
            document.len()
        );
        self.emit(
            *user_id,
            EventPayload::DocumentCreated {
                document_id: document_id.clone(),
                content: document.content.clone(),
                version: document.version,
            },
            Recipients::All,
        );

        Ok(self.documents.entry(document_id).or_insert(document))
    }

    /// Project `op` onto the authoritative document state and apply it
    pub fn apply_operation(&mut self, mut op: Operation) -> Result<ApplyOutcome> {
        self.ensure_healthy()?;
        self.ensure_member(&op.author)?;

        if self.log.contains(&op.id) {
            let version = self
                .documents
                .get(&op.document_id)
                .map(|d| d.version)
                .unwrap_or_default();
            debug!("Duplicate operation {} ignored", op.id);
            return Ok(ApplyOutcome::Duplicate { version });
        }

        if let Err(err) = op.validate() {
            return Err(self.reject(&op, err));
        }

        let Some(current_version) = self.documents.get(&op.document_id).map(|d| d.version)
        else {
            let err = CollaborationError::InvalidOperation(format!(
                "unknown document {}",
                op.document_id
            ));
            return Err(self.reject(&op, err));
        };

        if op.base_version > current_version {
            let err = CollaborationError::InvalidOperation(format!(
                "base version {} is ahead of document version {}",
                op.base_version, current_version
            ));
            return Err(self.reject(&op, err));
        }

        let floor = self.log.floor(&op.document_id);
        if op.base_version < floor {
            let err = CollaborationError::InvalidOperation(format!(
                "base version {} predates retained history (oldest {})",
                op.base_version, floor
            ));
            return Err(self.reject(&op, err));
        }

        let edits = self.project(&op, current_version)?;

        let document = self
            .documents
            .get_mut(&op.document_id)
            .ok_or_else(|| CollaborationError::InvalidOperation(op.document_id.to_string()))?;
        let version = match document.apply(&edits) {
            Ok(version) => version,
            Err(err) => return Err(self.reject(&op, err)),
        };

        self.clock.update(op.clock);
        op.applied = true;
        debug!(
            "Operation applied: {} by {} on {} (v{})",
            op.kind.name(),
            op.author,
            op.document_id,
            version
        );

        self.presence.follow_edits(&op.document_id, &edits);
        if let Some(author) = self.presence.get_mut(&op.author) {
            author.touch();
        }

        self.log.append(AppliedOperation {
            operation: op.clone(),
            edits: edits.clone(),
            version,
        });

        if self.log.document_len(&op.document_id) > self.config.history_limit {
            let dropped = self
                .log
                .compact(&op.document_id, self.config.history_limit);
            debug!("Compacted {} log entries of {}", dropped, op.document_id);
        }

        self.emit(
            op.author,
            EventPayload::DocumentUpdated {
                operation: op,
                edits: edits.clone(),
                version,
            },
            Recipients::All,
        );

        Ok(ApplyOutcome::Applied { version, edits })
    }

    /// Transform `op` against every logged operation its author had not seen.
    ///
    /// An author may send several operations before the first is logged, each
    /// written on top of the previous ones as the author typed them. `op` is
    /// therefore relative to its base version plus the author's own pending
    /// operations, not to the log as stored. The author's view is replayed from
    /// the oldest base still pending: foreign entries are transformed through
    /// the pending operations, and an own entry being logged retires the head
    /// of the queue. What remains for `op` at the end applies to the current
    /// version.
    fn project(&mut self, op: &Operation, current_version: u64) -> Result<Vec<Edit>> {
        let document_id = &op.document_id;

        let mut start = op.base_version;
        loop {
            let earliest = self
                .log
                .entries_since(document_id, start)
                .filter(|entry| entry.operation.author == op.author)
                .map(|entry| entry.operation.base_version)
                .min()
                .unwrap_or(start);
            if earliest >= start {
                break;
            }
            start = earliest;
        }

        let floor = self.log.floor(document_id);
        if start < floor {
            let err = CollaborationError::InvalidOperation(format!(
                "pending operations from base version {} predate retained history (oldest {})",
                start, floor
            ));
            return Err(self.reject(op, err));
        }

        let versions: Vec<u64> = self
            .log
            .entries_since(document_id, start)
            .map(|entry| entry.version)
            .collect();

        if !versions.iter().copied().eq(start + 1..=current_version) {
            let reason = format!(
                "log for {} does not cover versions {}..={}",
                document_id,
                start + 1,
                current_version
            );
            return Err(self.mark_unhealthy(reason));
        }

        let entries: Vec<&AppliedOperation> =
            self.log.entries_since(document_id, start).collect();

        // Operations in the order the author wrote them, each with the version it was based on
        let mut authored: VecDeque<(u64, Priority, Vec<Edit>)> = entries
            .iter()
            .filter(|entry| entry.operation.author == op.author)
            .map(|entry| {
                let own = &entry.operation;
                (own.base_version, own.priority(), own.edits())
            })
            .chain(std::iter::once((op.base_version, op.priority(), op.edits())))
            .collect();

        if authored
            .iter()
            .zip(authored.iter().skip(1))
            .any(|(earlier, later)| later.0 < earlier.0)
        {
            let err = CollaborationError::InvalidOperation(format!(
                "base version {} is older than one this author already used",
                op.base_version
            ));
            return Err(self.reject(op, err));
        }

        let mut pending: VecDeque<(Priority, Vec<Edit>)> = VecDeque::new();
        let mut version = start;
        for entry in entries {
            while authored.front().is_some_and(|(base, _, _)| *base <= version) {
                if let Some((_, priority, edits)) = authored.pop_front() {
                    pending.push_back((priority, edits));
                }
            }
            version = entry.version;

            if entry.operation.author == op.author {
                pending.pop_front();
                continue;
            }

            let mut applied = entry.edits.clone();
            let applied_priority = entry.operation.priority();
            for (priority, edits) in pending.iter_mut() {
                let (rebased, passed) = transform::transform_lists(
                    std::mem::take(edits),
                    applied,
                    *priority < applied_priority,
                );
                *edits = rebased;
                applied = passed;
            }
        }
        pending.extend(authored.into_iter().map(|(_, priority, edits)| (priority, edits)));

        // `op` was queued last and is never retired
        match pending.pop_back() {
            Some((_, edits)) => Ok(edits),
            None => {
                let reason = format!(
                    "own operations on {} since version {} do not match the log",
                    document_id, start
                );
                Err(self.mark_unhealthy(reason))
            }
        }
    }

    /// Overwrite a member's cursor and selection (last write wins)
    pub fn update_presence(
        &mut self,
        user_id: &UserId,
        document_id: DocumentId,
        position: usize,
        selection: Option<Selection>,
    ) -> Result<()> {
        self.ensure_member(user_id)?;

        let length = self
            .documents
            .get(&document_id)
            .map(|d| d.len())
            .ok_or_else(|| {
                CollaborationError::InvalidOperation(format!("unknown document {}", document_id))
            })?;

        let cursor = CursorPosition {
            document_id,
            offset: position.min(length),
        };
        let selection =
            selection.map(|s| Selection::new(s.start.min(length), s.end.min(length)));

        self.presence
            .update_cursor(user_id, cursor.clone(), selection)
            .ok_or(CollaborationError::UnknownUser(*user_id))?;

        self.emit(
            *user_id,
            EventPayload::PresenceUpdated {
                user_id: *user_id,
                cursor: Some(cursor),
                selection,
            },
            Recipients::AllExcept(*user_id),
        );

        Ok(())
    }

    pub fn send_chat(&mut self, user_id: &UserId, text: impl Into<String>) -> Result<()> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(CollaborationError::InvalidRequest(
                "chat message is empty".to_string(),
            ));
        }

        let member = self
            .presence
            .get_mut(user_id)
            .ok_or(CollaborationError::UnknownUser(*user_id))?;
        member.touch();
        let name = member.user.name.clone();

        info!("Chat message from {} in {}", name, self.id);
        self.emit(
            *user_id,
            EventPayload::ChatMessage {
                user_id: *user_id,
                name,
                text,
            },
            Recipients::All,
        );

        Ok(())
    }

    /// Record activity for a member without changing anything else
    pub fn touch_member(&mut self, user_id: &UserId) -> Result<()> {
        self.presence
            .get_mut(user_id)
            .map(Member::touch)
            .ok_or(CollaborationError::UnknownUser(*user_id))
    }

    /// Members with no activity within the configured idle timeout
    pub fn idle_members(&self) -> Vec<UserId> {
        self.presence.idle_members(self.config.idle_timeout())
    }

    pub fn snapshot(&self) -> WorkspaceSnapshot {
        self.get_state()
    }

    pub fn get_state(&self) -> WorkspaceSnapshot {
        let mut documents: Vec<Document> = self.documents.values().cloned().collect();
        documents.sort_by(|a, b| a.id.cmp(&b.id));

        WorkspaceSnapshot {
            workspace_id: self.id.clone(),
            name: self.name.clone(),
            created_at: self.created_at,
            members: self.presence.members().into_iter().cloned().collect(),
            documents,
            clock: self.clock,
            health: self.health.clone(),
            total_operations: self.log.len(),
            total_events: self.events.len(),
        }
    }

    pub fn save_state(&self) -> WorkspaceState {
        let snapshot = self.get_state();
        WorkspaceState {
            id: snapshot.workspace_id,
            name: snapshot.name,
            created_at: snapshot.created_at,
            clock: snapshot.clock,
            members: snapshot.members,
            documents: snapshot.documents,
            log: self.log.clone(),
            events: self.events.clone(),
        }
    }

    /// Rebuild a workspace, refusing state whose log disagrees with its documents
    pub fn load_state(
        state: WorkspaceState,
        config: WorkspaceConfig,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let mut log = state.log;
        log.reindex();

        let documents: HashMap<DocumentId, Document> = state
            .documents
            .into_iter()
            .map(|d| (d.id.clone(), d))
            .collect();

        if let Some(entry) = log
            .entries
            .iter()
            .find(|e| !documents.contains_key(e.document_id()))
        {
            return Err(CollaborationError::WorkspaceUnhealthy(format!(
                "operation {} targets missing document {}",
                entry.operation.id,
                entry.document_id()
            )));
        }

        for document in documents.values() {
            let floor = log.floor(&document.id);
            let versions: Vec<u64> = log.entries_since(&document.id, 0).map(|e| e.version).collect();
            let expected: Vec<u64> = (floor + 1..=document.version).collect();
            if versions != expected {
                return Err(CollaborationError::WorkspaceUnhealthy(format!(
                    "log for {} does not match version {}",
                    document.id, document.version
                )));
            }
        }

        let mut presence = PresenceManager::new();
        for member in state.members {
            presence.insert(member);
        }

        info!(
            "Workspace {} restored: {} documents, {} operations",
            state.id,
            documents.len(),
            log.len()
        );

        Ok(Self {
            id: state.id,
            name: state.name,
            created_at: state.created_at,
            presence,
            documents,
            log,
            events: state.events,
            clock: state.clock,
            health: Health::Healthy,
            config,
            sink,
        })
    }

    fn ensure_healthy(&self) -> Result<()> {
        match &self.health {
            Health::Healthy => Ok(()),
            Health::Unhealthy { reason } => {
                Err(CollaborationError::WorkspaceUnhealthy(reason.clone()))
            }
        }
    }

    fn ensure_member(&self, user_id: &UserId) -> Result<()> {
        if self.presence.contains(user_id) {
            Ok(())
        } else {
            Err(CollaborationError::UnknownUser(*user_id))
        }
    }

    fn mark_unhealthy(&mut self, reason: String) -> CollaborationError {
        error!("Workspace {} marked unhealthy: {}", self.id, reason);
        self.health = Health::Unhealthy {
            reason: reason.clone(),
        };
        CollaborationError::WorkspaceUnhealthy(reason)
    }

    /// Tell the author why their operation was refused
    fn reject(&self, op: &Operation, err: CollaborationError) -> CollaborationError {
        warn!("Operation {} from {} rejected: {}", op.id, op.author, err);
        self.send(
            op.author,
            EventPayload::OperationRejected {
                operation_id: op.id,
                document_id: op.document_id.clone(),
                reason: err.to_string(),
            },
            Recipients::Only(op.author),
        );
        err
    }

    /// Record in the event log, then hand to the sink
    fn emit(&mut self, origin: UserId, payload: EventPayload, recipients: Recipients) {
        let event = CollaborationEvent::new(self.id.clone(), origin, payload);
        self.sink.notify(&self.id, &event, recipients);
        self.events.push(event);
    }

    /// Hand to the sink without recording
    fn send(&self, origin: UserId, payload: EventPayload, recipients: Recipients) {
        let event = CollaborationEvent::new(self.id.clone(), origin, payload);
        self.sink.notify(&self.id, &event, recipients);
    }
}
