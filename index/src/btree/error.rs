//! Errors surfaced by tree operations.

use std::fmt::Debug;

use crate::btree::value::ScalarError;
use crate::storage::StoreError;

/// Errors that can occur during tree operations.
///
/// Validation errors (`KeyOutOfRange`, `ValueOutOfRange`, `KeyExists`,
/// `NotFound`, `Conflict`) are raised before any node is modified.
#[derive(Debug)]
pub enum TreeError<K> {
    /// Input cannot be represented as a key.
    KeyOutOfRange(String),
    /// Input cannot be represented as a value, is not an integer, or a
    /// weighted computation overflowed.
    ValueOutOfRange(String),
    /// Insert without replace on a present key.
    KeyExists(K),
    /// Lookup or delete on an absent key.
    NotFound(K),
    /// Reconciliation found a delete racing a modification.
    Conflict(K),
    /// Detected corrupt ordering or a capacity breach. Indicates a bug.
    InvariantViolation(String),
    /// The store could not materialize or persist a node.
    Adapter(StoreError),
}

impl<K: Debug> TreeError<K> {
    pub(crate) fn invariant(message: impl Into<String>) -> Self {
        Self::InvariantViolation(message.into())
    }

    pub(crate) fn from_key_scalar(input: &impl std::fmt::Display, error: ScalarError) -> Self {
        match error {
            ScalarError::OutOfRange => Self::KeyOutOfRange(input.to_string()),
            ScalarError::NotInteger => Self::ValueOutOfRange(format!("expected integer key, got {input}")),
        }
    }

    pub(crate) fn from_value_scalar(input: &impl std::fmt::Display, error: ScalarError) -> Self {
        match error {
            ScalarError::OutOfRange => Self::ValueOutOfRange(input.to_string()),
            ScalarError::NotInteger => Self::ValueOutOfRange(format!("expected integer value, got {input}")),
        }
    }
}

impl<K: Debug> std::fmt::Display for TreeError<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::KeyOutOfRange(input) => write!(f, "key out of range: {input}"),
            Self::ValueOutOfRange(input) => write!(f, "value out of range: {input}"),
            Self::KeyExists(key) => write!(f, "key already exists: {key:?}"),
            Self::NotFound(key) => write!(f, "key not found: {key:?}"),
            Self::Conflict(key) => write!(f, "conflicting changes for key {key:?}"),
            Self::InvariantViolation(msg) => write!(f, "invariant violation: {msg}"),
            Self::Adapter(e) => write!(f, "store error: {e}"),
        }
    }
}

impl<K: Debug> std::error::Error for TreeError<K> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Adapter(e) => Some(e),
            _ => None,
        }
    }
}

impl<K> From<StoreError> for TreeError<K> {
    fn from(e: StoreError) -> Self {
        Self::Adapter(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let e: TreeError<i32> = TreeError::KeyExists(5);
        assert_eq!(e.to_string(), "key already exists: 5");

        let e: TreeError<i32> = TreeError::Adapter(StoreError::Missing(3));
        assert_eq!(e.to_string(), "store error: node 3 not found in store");
        assert!(std::error::Error::source(&e).is_some());
    }

    #[test]
    fn test_scalar_mapping() {
        let e: TreeError<i32> = TreeError::from_key_scalar(&"99999999999", ScalarError::OutOfRange);
        assert!(matches!(e, TreeError::KeyOutOfRange(_)));

        let e: TreeError<i32> = TreeError::from_key_scalar(&"1.5", ScalarError::NotInteger);
        assert!(matches!(e, TreeError::ValueOutOfRange(_)));
    }
}
