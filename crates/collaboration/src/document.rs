use serde::{Deserialize, Serialize};

use crate::transform::{self, Edit};
use crate::{DocumentId, Result};

/// Authoritative plain-text document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub content: String,

    /// Number of operations applied since creation
    pub version: u64,

    pub last_modified: chrono::DateTime<chrono::Utc>,
}

impl Document {
    pub fn new(id: DocumentId, content: impl Into<String>) -> Self {
        Self {
            id,
            content: content.into(),
            version: 0,
            last_modified: chrono::Utc::now(),
        }
    }

    /// Length in chars
    pub fn len(&self) -> usize {
        self.content.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// Apply edits as one new version. Nothing changes if any edit is out of range.
    pub fn apply(&mut self, edits: &[Edit]) -> Result<u64> {
        self.content = transform::apply_all(&self.content, edits)?;
        self.version += 1;
        self.last_modified = chrono::Utc::now();
        Ok(self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_bumps_version_once_per_call() {
        let mut doc = Document::new(DocumentId::from("notes"), "abc");
        let version = doc
            .apply(&[Edit::insert(3, "def"), Edit::delete(0, "a")])
            .unwrap();

        assert_eq!(version, 1);
        assert_eq!(doc.content, "bcdef");
        assert_eq!(doc.len(), 5);
    }

    #[test]
    fn test_failed_apply_leaves_document_untouched() {
        let mut doc = Document::new(DocumentId::from("notes"), "abc");
        let result = doc.apply(&[Edit::insert(1, "x"), Edit::insert(10, "y")]);

        assert!(result.is_err());
        assert_eq!(doc.content, "abc");
        assert_eq!(doc.version, 0);
    }

    #[test]
    fn test_empty_edit_list_still_counts_as_version() {
        let mut doc = Document::new(DocumentId::from("notes"), "");
        assert!(doc.is_empty());
        assert_eq!(doc.apply(&[]).unwrap(), 1);
    }
}
