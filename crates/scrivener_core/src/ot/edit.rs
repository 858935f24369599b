//! The closed set of text edits and how they apply to live text.

use ropey::Rope;
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::{Result, ScrivenerError};

/// A positional text edit.
///
/// Positions and lengths count Unicode scalar values, not bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(tag = "kind", rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum Edit {
    /// Insert `text` so that it starts at `position`
    Insert { position: usize, text: String },
    /// Remove `len` characters starting at `position`
    Delete { position: usize, len: usize },
}

impl Edit {
    pub fn insert(position: usize, text: impl Into<String>) -> Self {
        Edit::Insert {
            position,
            text: text.into(),
        }
    }

    pub fn delete(position: usize, len: usize) -> Self {
        Edit::Delete { position, len }
    }

    pub fn position(&self) -> usize {
        match self {
            Edit::Insert { position, .. } | Edit::Delete { position, .. } => *position,
        }
    }

    /// Number of characters inserted or removed.
    pub fn char_len(&self) -> usize {
        match self {
            Edit::Insert { text, .. } => text.chars().count(),
            Edit::Delete { len, .. } => *len,
        }
    }

    /// An empty insert or a zero-length delete.
    pub fn is_noop(&self) -> bool {
        self.char_len() == 0
    }

    /// Change in document length after applying this edit.
    pub fn len_delta(&self) -> isize {
        match self {
            Edit::Insert { .. } => self.char_len() as isize,
            Edit::Delete { len, .. } => -(*len as isize),
        }
    }

    /// Check that the edit addresses a range inside a document of
    /// `doc_len` characters.
    pub fn validate(&self, doc_len: usize) -> Result<()> {
        match self {
            Edit::Insert { position, .. } if *position > doc_len => {
                Err(ScrivenerError::MalformedOp(format!(
                    "insert at {} beyond document length {}",
                    position, doc_len
                )))
            }
            Edit::Delete { position, len } if position.saturating_add(*len) > doc_len => {
                Err(ScrivenerError::MalformedOp(format!(
                    "delete of {}..{} beyond document length {}",
                    position,
                    position.saturating_add(*len),
                    doc_len
                )))
            }
            _ => Ok(()),
        }
    }

    /// Apply the edit to `text`, failing without mutating on an
    /// out-of-bounds range.
    pub fn apply(&self, text: &mut Rope) -> Result<()> {
        self.validate(text.len_chars())?;
        match self {
            Edit::Insert { position, text: s } => text.insert(*position, s),
            Edit::Delete { position, len } => text.remove(*position..*position + *len),
        }
        Ok(())
    }
}

/// Apply a sequence of edits, each expressed against the result of the
/// previous one.
pub fn apply_all<'a>(text: &mut Rope, edits: impl IntoIterator<Item = &'a Edit>) -> Result<()> {
    for edit in edits {
        edit.apply(text)?;
    }
    Ok(())
}

/// Convenience for callers holding plain strings.
pub fn apply_to_str<'a>(text: &str, edits: impl IntoIterator<Item = &'a Edit>) -> Result<String> {
    let mut rope = Rope::from_str(text);
    apply_all(&mut rope, edits)?;
    Ok(rope.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_delete() {
        let mut text = Rope::from_str("Hello World");
        Edit::insert(6, "Beautiful ").apply(&mut text).unwrap();
        assert_eq!(text.to_string(), "Hello Beautiful World");

        Edit::delete(6, 10).apply(&mut text).unwrap();
        assert_eq!(text.to_string(), "Hello World");
    }

    #[test]
    fn test_positions_are_chars() {
        let mut text = Rope::from_str("héllo");
        Edit::insert(2, "✓").apply(&mut text).unwrap();
        assert_eq!(text.to_string(), "hé✓llo");
        assert_eq!(Edit::insert(0, "✓é").char_len(), 2);
    }

    #[test]
    fn test_out_of_bounds_rejected_without_mutation() {
        let mut text = Rope::from_str("abc");
        let err = Edit::insert(4, "x").apply(&mut text).unwrap_err();
        assert!(matches!(err, ScrivenerError::MalformedOp(_)));

        let err = Edit::delete(2, 2).apply(&mut text).unwrap_err();
        assert!(matches!(err, ScrivenerError::MalformedOp(_)));
        assert_eq!(text.to_string(), "abc");

        // Appending at the very end is in bounds
        Edit::insert(3, "d").apply(&mut text).unwrap();
        assert_eq!(text.to_string(), "abcd");
    }

    #[test]
    fn test_noop_and_delta() {
        assert!(Edit::delete(3, 0).is_noop());
        assert!(Edit::insert(0, "").is_noop());
        assert_eq!(Edit::insert(0, "ab").len_delta(), 2);
        assert_eq!(Edit::delete(0, 5).len_delta(), -5);
    }

    #[test]
    fn test_apply_sequence() {
        let edits = [Edit::insert(5, ", world"), Edit::delete(12, 1)];
        assert_eq!(apply_to_str("Hello!", &edits).unwrap(), "Hello, world");
    }
}
