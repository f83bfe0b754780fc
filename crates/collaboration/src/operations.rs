/// Text operations submitted by collaborators
/// and the append-only log of operations that were applied
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::transform::Edit;
use crate::{CollaborationError, DocumentId, LamportClock, Result, UserId};

/// Unique operation identifier, reused by clients when retrying delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OperationId(pub uuid::Uuid);

impl OperationId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Kinds of edits a collaborator can make to a plain-text document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationKind {
    Insert { text: String },

    /// `text` is the content being removed
    Delete { text: String },

    /// Atomic delete of `deleted` followed by insert of `inserted` at the same position
    Replace { deleted: String, inserted: String },
}

impl OperationKind {
    pub fn name(&self) -> &'static str {
        match self {
            OperationKind::Insert { .. } => "insert",
            OperationKind::Delete { .. } => "delete",
            OperationKind::Replace { .. } => "replace",
        }
    }

    /// Primary payload: inserted text for inserts and replaces, removed text for deletes
    pub fn content(&self) -> &str {
        match self {
            OperationKind::Insert { text } | OperationKind::Delete { text } => text,
            OperationKind::Replace { inserted, .. } => inserted,
        }
    }
}

/// Total order used to break ties between concurrent operations.
/// Wall-clock time never takes part in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority {
    pub clock: LamportClock,
    pub author: UserId,
    pub id: OperationId,
}

/// An edit to one document, authored against a known document version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Unique operation ID
    pub id: OperationId,

    /// User who created this operation
    pub author: UserId,

    pub document_id: DocumentId,

    /// Character offset into the document the author observed
    pub position: usize,

    pub kind: OperationKind,

    /// Author's Lamport clock when the operation was created
    pub clock: LamportClock,

    /// Document version the author last observed
    pub base_version: u64,

    /// Timestamp when operation was created (informational only)
    pub timestamp: chrono::DateTime<chrono::Utc>,

    pub applied: bool,
}

impl Operation {
    pub fn new(
        author: UserId,
        document_id: DocumentId,
        position: usize,
        kind: OperationKind,
    ) -> Self {
        Self {
            id: OperationId::new(),
            author,
            document_id,
            position,
            kind,
            clock: LamportClock::new(),
            base_version: 0,
            timestamp: chrono::Utc::now(),
            applied: false,
        }
    }

    pub fn insert(
        author: UserId,
        document_id: impl Into<DocumentId>,
        position: usize,
        text: impl Into<String>,
    ) -> Self {
        Self::new(
            author,
            document_id.into(),
            position,
            OperationKind::Insert { text: text.into() },
        )
    }

    pub fn delete(
        author: UserId,
        document_id: impl Into<DocumentId>,
        position: usize,
        text: impl Into<String>,
    ) -> Self {
        Self::new(
            author,
            document_id.into(),
            position,
            OperationKind::Delete { text: text.into() },
        )
    }

    pub fn replace(
        author: UserId,
        document_id: impl Into<DocumentId>,
        position: usize,
        deleted: impl Into<String>,
        inserted: impl Into<String>,
    ) -> Self {
        Self::new(
            author,
            document_id.into(),
            position,
            OperationKind::Replace {
                deleted: deleted.into(),
                inserted: inserted.into(),
            },
        )
    }

    pub fn with_id(mut self, id: OperationId) -> Self {
        self.id = id;
        self
    }

    pub fn with_clock(mut self, clock: LamportClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_base_version(mut self, base_version: u64) -> Self {
        self.base_version = base_version;
        self
    }

    pub fn priority(&self) -> Priority {
        Priority {
            clock: self.clock,
            author: self.author,
            id: self.id,
        }
    }

    /// Reject payloads that would not change the document
    pub fn validate(&self) -> Result<()> {
        let empty = match &self.kind {
            OperationKind::Insert { text } | OperationKind::Delete { text } => text.is_empty(),
            OperationKind::Replace { deleted, inserted } => {
                deleted.is_empty() && inserted.is_empty()
            }
        };

        if empty {
            return Err(CollaborationError::InvalidOperation(format!(
                "{} operation {} has an empty payload",
                self.kind.name(),
                self.id
            )));
        }

        Ok(())
    }

    /// Decompose into primitive edits, in application order
    pub fn edits(&self) -> Vec<Edit> {
        match &self.kind {
            OperationKind::Insert { text } => vec![Edit::insert(self.position, text.clone())],
            OperationKind::Delete { text } => vec![Edit::delete(self.position, text.clone())],
            OperationKind::Replace { deleted, inserted } => {
                let mut edits = Vec::with_capacity(2);
                if !deleted.is_empty() {
                    edits.push(Edit::delete(self.position, deleted.clone()));
                }
                if !inserted.is_empty() {
                    edits.push(Edit::insert(self.position, inserted.clone()));
                }
                edits
            }
        }
    }
}

/// Log entry for an operation that was accepted into a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedOperation {
    /// Operation as submitted, with `applied` set
    pub operation: Operation,

    /// Edits actually applied after transformation against concurrent operations
    pub edits: Vec<Edit>,

    /// Document version this operation produced
    pub version: u64,
}

impl AppliedOperation {
    pub fn document_id(&self) -> &DocumentId {
        &self.operation.document_id
    }
}

/// Append-only operation log shared by all documents of a workspace
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationLog {
    /// Retained operations in application order
    pub entries: Vec<AppliedOperation>,

    /// Every operation id ever accepted, including compacted ones
    seen: HashSet<OperationId>,

    /// Highest version dropped by compaction, per document
    floors: HashMap<DocumentId, u64>,

    /// Index by operation ID for fast lookup
    #[serde(skip)]
    index: HashMap<OperationId, usize>,
}

impl OperationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the lookup index after deserialization
    pub fn reindex(&mut self) {
        self.index.clear();
        for (idx, entry) in self.entries.iter().enumerate() {
            self.index.insert(entry.operation.id, idx);
            self.seen.insert(entry.operation.id);
        }
    }

    pub fn append(&mut self, entry: AppliedOperation) {
        let id = entry.operation.id;
        self.entries.push(entry);
        self.index.insert(id, self.entries.len() - 1);
        self.seen.insert(id);
    }

    pub fn contains(&self, id: &OperationId) -> bool {
        self.seen.contains(id)
    }

    pub fn get(&self, id: &OperationId) -> Option<&AppliedOperation> {
        self.index.get(id).and_then(|&idx| self.entries.get(idx))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Oldest version an operation may be based on and still be transformed
    pub fn floor(&self, document_id: &DocumentId) -> u64 {
        self.floors.get(document_id).copied().unwrap_or(0)
    }

    /// Retained entries of one document that produced a version above `version`
    pub fn entries_since<'a>(
        &'a self,
        document_id: &'a DocumentId,
        version: u64,
    ) -> impl Iterator<Item = &'a AppliedOperation> + 'a {
        self.entries
            .iter()
            .filter(move |e| e.document_id() == document_id && e.version > version)
    }

    pub fn document_len(&self, document_id: &DocumentId) -> usize {
        self.entries
            .iter()
            .filter(|e| e.document_id() == document_id)
            .count()
    }

    /// Drop the oldest entries of a document until at most `keep` remain
    pub fn compact(&mut self, document_id: &DocumentId, keep: usize) -> usize {
        let retained = self.document_len(document_id);
        if retained <= keep {
            return 0;
        }

        let mut to_remove = retained - keep;
        let mut floor = self.floor(document_id);
        self.entries.retain(|e| {
            if to_remove > 0 && e.document_id() == document_id {
                to_remove -= 1;
                floor = floor.max(e.version);
                false
            } else {
                true
            }
        });
        self.floors.insert(document_id.clone(), floor);

        // Rebuild index
        self.index.clear();
        for (idx, entry) in self.entries.iter().enumerate() {
            self.index.insert(entry.operation.id, idx);
        }

        retained - keep
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn applied(document: &str, version: u64) -> AppliedOperation {
        let mut operation = Operation::insert(UserId::new(), document, 0, "x");
        operation.applied = true;
        AppliedOperation {
            edits: operation.edits(),
            operation,
            version,
        }
    }

    #[test]
    fn test_replace_decomposes_into_delete_then_insert() {
        let op = Operation::replace(UserId::new(), "doc", 2, "old", "new");
        assert_eq!(
            op.edits(),
            vec![Edit::delete(2, "old".to_string()), Edit::insert(2, "new".to_string())]
        );

        let pure_insert = Operation::replace(UserId::new(), "doc", 2, "", "new");
        assert_eq!(pure_insert.edits().len(), 1);
    }

    #[test]
    fn test_empty_payload_is_invalid() {
        let op = Operation::insert(UserId::new(), "doc", 0, "");
        assert!(matches!(
            op.validate(),
            Err(CollaborationError::InvalidOperation(_))
        ));
        assert!(Operation::replace(UserId::new(), "doc", 0, "", "").validate().is_err());
        assert!(Operation::delete(UserId::new(), "doc", 0, "a").validate().is_ok());
    }

    #[test]
    fn test_priority_orders_by_clock_then_author() {
        let author = UserId::new();
        let early = Operation::insert(author, "doc", 0, "a").with_clock(LamportClock(1));
        let late = Operation::insert(author, "doc", 0, "b").with_clock(LamportClock(2));
        assert!(early.priority() < late.priority());
    }

    #[test]
    fn test_log_filters_entries_by_document_and_version() {
        let mut log = OperationLog::new();
        log.append(applied("a", 1));
        log.append(applied("b", 1));
        log.append(applied("a", 2));
        log.append(applied("a", 3));

        let doc = DocumentId::from("a");
        let versions: Vec<u64> = log.entries_since(&doc, 1).map(|e| e.version).collect();
        assert_eq!(versions, vec![2, 3]);
        assert_eq!(log.document_len(&doc), 3);
    }

    #[test]
    fn test_compaction_raises_floor_and_keeps_ids() {
        let mut log = OperationLog::new();
        let first = applied("a", 1);
        let first_id = first.operation.id;
        log.append(first);
        log.append(applied("b", 1));
        log.append(applied("a", 2));
        log.append(applied("a", 3));

        let doc = DocumentId::from("a");
        assert_eq!(log.compact(&doc, 1), 2);
        assert_eq!(log.floor(&doc), 2);
        assert_eq!(log.len(), 2);
        assert!(log.contains(&first_id));
        assert!(log.get(&first_id).is_none());
        assert_eq!(log.floor(&DocumentId::from("b")), 0);
    }
}
