use core::fmt;

/// Errors surfaced by map operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableError {
    /// Two keys of incompatible kinds were compared for equality.
    ///
    /// Treating such a pair as "not equal" would let two logically equal keys
    /// coexist, so the operation is aborted instead.
    TypeMismatch {
        /// Kind of the key already resident in the map (or the left operand).
        left: &'static str,
        /// Kind of the key supplied by the caller (or the right operand).
        right: &'static str,
    },
}

impl fmt::Display for TableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableError::TypeMismatch { left, right } => {
                write!(f, "Key type mismatch: cannot compare {} with {}", left, right)
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for TableError {}
