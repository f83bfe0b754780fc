//! Operational transformation for plain-text edits.
//!
//! Every [`Operation`] decomposes into one or two primitive [`Edit`]s. Transforming
//! an edit against a concurrent edit yields zero, one or two edits:
//!
//! - a delete whose whole range was already deleted disappears;
//! - a delete that straddles a concurrent insert splits around the inserted text;
//! - everything else shifts.
//!
//! For any two concurrent edit lists `a` and `b` on the same text,
//! `apply(apply(s, a), b') == apply(apply(s, b), a')` where `(a', b') = transform(a, b)`.
//! Positions and lengths count `char`s.

use serde::{Deserialize, Serialize};

use crate::{CollaborationError, Operation, Priority, Result};

/// Primitive text edit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Edit {
    Insert { position: usize, text: String },
    Delete { position: usize, text: String },
}

impl Edit {
    pub fn insert(position: usize, text: impl Into<String>) -> Self {
        Edit::Insert {
            position,
            text: text.into(),
        }
    }

    pub fn delete(position: usize, text: impl Into<String>) -> Self {
        Edit::Delete {
            position,
            text: text.into(),
        }
    }

    pub fn position(&self) -> usize {
        match self {
            Edit::Insert { position, .. } | Edit::Delete { position, .. } => *position,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Edit::Insert { text, .. } | Edit::Delete { text, .. } => text,
        }
    }

    /// Length of the payload in chars
    pub fn len(&self) -> usize {
        self.text().chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.text().is_empty()
    }

    fn moved_to(&self, position: usize) -> Self {
        match self {
            Edit::Insert { text, .. } => Edit::insert(position, text.clone()),
            Edit::Delete { text, .. } => Edit::delete(position, text.clone()),
        }
    }

    /// Apply to `content`, failing when the edit falls outside it or a delete
    /// does not match the text it covers
    pub fn apply(&self, content: &mut String) -> Result<()> {
        let length = content.chars().count();
        match self {
            Edit::Insert { position, text } => {
                if *position > length {
                    return Err(out_of_bounds(*position, length));
                }
                let at = byte_offset(content, *position);
                content.insert_str(at, text);
            }
            Edit::Delete { position, text } => {
                let end = position + text.chars().count();
                if end > length {
                    return Err(out_of_bounds(end, length));
                }
                let start = byte_offset(content, *position);
                let stop = byte_offset(content, end);
                if content[start..stop] != **text {
                    return Err(CollaborationError::InvalidOperation(format!(
                        "delete at {} expected {:?} but found {:?}",
                        position,
                        text,
                        &content[start..stop]
                    )));
                }
                content.replace_range(start..stop, "");
            }
        }
        Ok(())
    }
}

fn out_of_bounds(position: usize, length: usize) -> CollaborationError {
    CollaborationError::InvalidOperation(format!(
        "position {} is outside the document (length {})",
        position, length
    ))
}

fn byte_offset(content: &str, chars: usize) -> usize {
    content
        .char_indices()
        .nth(chars)
        .map(|(idx, _)| idx)
        .unwrap_or(content.len())
}

/// Take chars `[from, to)` of `text`
fn slice_chars(text: &str, from: usize, to: usize) -> String {
    text.chars().skip(from).take(to.saturating_sub(from)).collect()
}

/// Apply a list of edits in order, leaving `content` untouched on failure
pub fn apply_all(content: &str, edits: &[Edit]) -> Result<String> {
    let mut next = content.to_string();
    for edit in edits {
        edit.apply(&mut next)?;
    }
    Ok(next)
}

/// Both sides of a transformation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transformed {
    /// First operation rewritten to apply after the second
    pub left: Vec<Edit>,

    /// Second operation rewritten to apply after the first
    pub right: Vec<Edit>,
}

/// Transform two concurrent operations against each other.
///
/// Operations on different documents do not interact and come back unchanged.
pub fn transform(a: &Operation, b: &Operation) -> Transformed {
    if a.document_id != b.document_id {
        return Transformed {
            left: a.edits(),
            right: b.edits(),
        };
    }

    let (left, right) = transform_lists(a.edits(), b.edits(), a.priority() < b.priority());
    Transformed { left, right }
}

/// Rewrite `edits` so they apply after the concurrent `applied` edits
pub fn include(
    edits: Vec<Edit>,
    priority: Priority,
    applied: &[Edit],
    applied_priority: Priority,
) -> Vec<Edit> {
    transform_lists(edits, applied.to_vec(), priority < applied_priority).0
}

/// Transform two concurrent edit lists.
///
/// `left_first` decides which side lands first when both insert at the same offset.
pub fn transform_lists(
    left: Vec<Edit>,
    right: Vec<Edit>,
    left_first: bool,
) -> (Vec<Edit>, Vec<Edit>) {
    if left.is_empty() || right.is_empty() {
        return (left, right);
    }

    if left.len() == 1 && right.len() == 1 {
        return transform_pair(&left[0], &right[0], left_first);
    }

    if left.len() > 1 {
        let mut rest = left;
        let head = rest.remove(0);
        let (mut head_t, right_t) = transform_lists(vec![head], right, left_first);
        let (rest_t, right_t) = transform_lists(rest, right_t, left_first);
        head_t.extend(rest_t);
        return (head_t, right_t);
    }

    let mut rest = right;
    let head = rest.remove(0);
    let (left_t, mut head_t) = transform_lists(left, vec![head], left_first);
    let (left_t, rest_t) = transform_lists(left_t, rest, left_first);
    head_t.extend(rest_t);
    (left_t, head_t)
}

fn transform_pair(a: &Edit, b: &Edit, a_first: bool) -> (Vec<Edit>, Vec<Edit>) {
    (include_one(a, b, a_first), include_one(b, a, !a_first))
}

/// Rewrite `edit` so it applies after `applied`
fn include_one(edit: &Edit, applied: &Edit, edit_first: bool) -> Vec<Edit> {
    match (edit, applied) {
        (Edit::Insert { position, .. }, Edit::Insert { position: other, .. }) => {
            if *position < *other || (*position == *other && edit_first) {
                vec![edit.clone()]
            } else {
                vec![edit.moved_to(position + applied.len())]
            }
        }

        (Edit::Insert { position, .. }, Edit::Delete { position: start, .. }) => {
            let end = start + applied.len();
            if *position <= *start {
                vec![edit.clone()]
            } else if *position >= end {
                vec![edit.moved_to(position - applied.len())]
            } else {
                // The surrounding text is gone; the insert survives where it was
                vec![edit.moved_to(*start)]
            }
        }

        (Edit::Delete { position: start, text }, Edit::Insert { position: at, .. }) => {
            let end = start + edit.len();
            if *at <= *start {
                vec![edit.moved_to(start + applied.len())]
            } else if *at >= end {
                vec![edit.clone()]
            } else {
                // Split around the inserted text
                let split = at - start;
                let before = slice_chars(text, 0, split);
                let after = slice_chars(text, split, edit.len());
                vec![
                    Edit::delete(*start, before),
                    Edit::delete(start + applied.len(), after),
                ]
            }
        }

        (Edit::Delete { position: start, text }, Edit::Delete { position: other, .. }) => {
            let end = start + edit.len();
            let other_end = other + applied.len();
            if end <= *other {
                vec![edit.clone()]
            } else if *start >= other_end {
                vec![edit.moved_to(start - applied.len())]
            } else {
                // Only the part the other delete did not already remove
                let overlap_start = (*start).max(*other) - start;
                let overlap_end = end.min(other_end) - start;
                let mut remaining = slice_chars(text, 0, overlap_start);
                remaining.push_str(&slice_chars(text, overlap_end, edit.len()));
                if remaining.is_empty() {
                    Vec::new()
                } else {
                    vec![Edit::delete((*start).min(*other), remaining)]
                }
            }
        }
    }
}

/// Move a cursor offset through a list of applied edits
pub fn map_position(position: usize, edits: &[Edit]) -> usize {
    edits.iter().fold(position, |pos, edit| match edit {
        Edit::Insert { position: at, .. } => {
            if *at <= pos {
                pos + edit.len()
            } else {
                pos
            }
        }
        Edit::Delete { position: start, .. } => {
            let end = start + edit.len();
            if pos >= end {
                pos - edit.len()
            } else if pos > *start {
                *start
            } else {
                pos
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LamportClock, UserId};

    fn converge(doc: &str, a: &Operation, b: &Operation) -> (String, String) {
        let t = transform(a, b);

        let mut a_then_b = apply_all(doc, &a.edits()).unwrap();
        a_then_b = apply_all(&a_then_b, &t.right).unwrap();

        let mut b_then_a = apply_all(doc, &b.edits()).unwrap();
        b_then_a = apply_all(&b_then_a, &t.left).unwrap();

        (a_then_b, b_then_a)
    }

    #[test]
    fn test_apply_counts_chars_not_bytes() {
        let mut content = "héllo".to_string();
        Edit::insert(2, "y").apply(&mut content).unwrap();
        assert_eq!(content, "héyllo");

        Edit::delete(1, "éy").apply(&mut content).unwrap();
        assert_eq!(content, "hllo");
    }

    #[test]
    fn test_apply_rejects_out_of_range() {
        let mut content = "hello".to_string();
        assert!(Edit::insert(6, "x").apply(&mut content).is_err());
        assert!(Edit::delete(4, "ab").apply(&mut content).is_err());
        assert_eq!(content, "hello");
    }

    #[test]
    fn test_apply_rejects_mismatched_delete() {
        let mut content = "hello".to_string();
        let err = Edit::delete(1, "xy").apply(&mut content).unwrap_err();
        assert!(matches!(err, CollaborationError::InvalidOperation(_)));
        assert_eq!(content, "hello");

        Edit::delete(1, "el").apply(&mut content).unwrap();
        assert_eq!(content, "hlo");
    }

    #[test]
    fn test_insert_insert_shifts_later_position() {
        let x = UserId::new();
        let y = UserId::new();
        let a = Operation::insert(x, "doc", 1, "AA");
        let b = Operation::insert(y, "doc", 4, "B");

        let t = transform(&a, &b);
        assert_eq!(t.left, vec![Edit::insert(1, "AA")]);
        assert_eq!(t.right, vec![Edit::insert(6, "B")]);

        let (one, two) = converge("0123456", &a, &b);
        assert_eq!(one, two);
        assert_eq!(one, "0AA123B456");
    }

    #[test]
    fn test_equal_inserts_order_by_clock() {
        let x = UserId::new();
        let y = UserId::new();
        let hello = Operation::insert(x, "doc", 0, "Hello ").with_clock(LamportClock(1));
        let hi = Operation::insert(y, "doc", 0, "Hi ").with_clock(LamportClock(2));

        let (one, two) = converge("", &hello, &hi);
        assert_eq!(one, "Hello Hi ");
        assert_eq!(two, "Hello Hi ");

        let (three, four) = converge("", &hi, &hello);
        assert_eq!(three, "Hello Hi ");
        assert_eq!(four, "Hello Hi ");
    }

    #[test]
    fn test_disjoint_deletes_converge() {
        let a = Operation::delete(UserId::new(), "doc", 1, "bc");
        let b = Operation::delete(UserId::new(), "doc", 4, "ef");

        let t = transform(&a, &b);
        assert_eq!(t.left, vec![Edit::delete(1, "bc")]);
        assert_eq!(t.right, vec![Edit::delete(2, "ef")]);

        let (one, two) = converge("abcdef", &a, &b);
        assert_eq!(one, "ad");
        assert_eq!(two, "ad");
    }

    #[test]
    fn test_overlapping_deletes_remove_union() {
        let a = Operation::delete(UserId::new(), "doc", 1, "bcd");
        let b = Operation::delete(UserId::new(), "doc", 2, "cdef");

        let t = transform(&a, &b);
        assert_eq!(t.left, vec![Edit::delete(1, "b")]);
        assert_eq!(t.right, vec![Edit::delete(1, "ef")]);

        let (one, two) = converge("abcdefg", &a, &b);
        assert_eq!(one, "ag");
        assert_eq!(two, "ag");
    }

    #[test]
    fn test_identical_deletes_cancel() {
        let a = Operation::delete(UserId::new(), "doc", 2, "cd");
        let b = Operation::delete(UserId::new(), "doc", 2, "cd");

        let t = transform(&a, &b);
        assert!(t.left.is_empty());
        assert!(t.right.is_empty());
    }

    #[test]
    fn test_insert_inside_delete_splits_the_delete() {
        let ins = Operation::insert(UserId::new(), "doc", 3, "X");
        let del = Operation::delete(UserId::new(), "doc", 1, "bcde");

        let t = transform(&ins, &del);
        assert_eq!(t.left, vec![Edit::insert(1, "X")]);
        assert_eq!(
            t.right,
            vec![Edit::delete(1, "bc"), Edit::delete(2, "de")]
        );

        let (one, two) = converge("abcdef", &ins, &del);
        assert_eq!(one, "aXf");
        assert_eq!(two, "aXf");
    }

    #[test]
    fn test_insert_at_delete_boundaries() {
        let at_start = Operation::insert(UserId::new(), "doc", 1, "X");
        let at_end = Operation::insert(UserId::new(), "doc", 3, "Y");
        let del = Operation::delete(UserId::new(), "doc", 1, "bc");

        let (one, two) = converge("abcd", &at_start, &del);
        assert_eq!((one.as_str(), two.as_str()), ("aXd", "aXd"));

        let (one, two) = converge("abcd", &at_end, &del);
        assert_eq!((one.as_str(), two.as_str()), ("aYd", "aYd"));
    }

    #[test]
    fn test_replace_against_overlapping_delete() {
        let replace = Operation::replace(UserId::new(), "doc", 2, "cd", "ZZ");
        let del = Operation::delete(UserId::new(), "doc", 1, "bcd");

        let (one, two) = converge("abcdef", &replace, &del);
        assert_eq!(one, two);
        assert_eq!(one, "aZZef");
    }

    #[test]
    fn test_replace_against_replace_converges() {
        let x = UserId::new();
        let y = UserId::new();
        let a = Operation::replace(x, "doc", 0, "abc", "1").with_clock(LamportClock(1));
        let b = Operation::replace(y, "doc", 1, "bcd", "2").with_clock(LamportClock(2));

        let (one, two) = converge("abcdef", &a, &b);
        assert_eq!(one, two);
        assert_eq!(one, "12ef");
    }

    #[test]
    fn test_different_documents_pass_through() {
        let a = Operation::insert(UserId::new(), "one", 0, "a");
        let b = Operation::delete(UserId::new(), "two", 0, "b");

        let t = transform(&a, &b);
        assert_eq!(t.left, a.edits());
        assert_eq!(t.right, b.edits());
    }

    #[test]
    fn test_map_position_follows_edits() {
        let edits = vec![Edit::insert(0, "ab"), Edit::delete(4, "xyz")];
        assert_eq!(map_position(3, &edits), 4);
        assert_eq!(map_position(6, &edits), 5);
        assert_eq!(map_position(9, &edits), 8);
        assert_eq!(map_position(1, &[Edit::insert(5, "zz")]), 1);
    }
}
