//! The key capability consumed by the map.
//!
//! A key supplies a stable 32-bit hash and a fallible equality. Equality is
//! fallible so that keys of incompatible kinds (see [`DynKey`]) are reported
//! as [`TableError::TypeMismatch`] rather than silently treated as distinct.

use alloc::boxed::Box;
use alloc::string::String;
use core::hash::{BuildHasher, Hash};
use foldhash::fast::FixedState;

use crate::error::TableError;

/// A key storable in a [`SplitMap`](crate::SplitMap).
///
/// Implementations must uphold:
///
/// - `key_hash` is pure and never changes for the lifetime of the key.
/// - `key_eq` is reflexive and symmetric, and `Ok(true)` implies equal
///   hashes.
/// - Comparing keys of incompatible kinds returns `Err`, never `Ok(false)`.
pub trait Key: Send + Sync + 'static {
    /// Stable 32-bit hash of the key.
    fn key_hash(&self) -> u32;

    /// Compares two keys.
    fn key_eq(&self, other: &Self) -> Result<bool, TableError>;
}

#[inline(always)]
fn fold(h: u64) -> u32 {
    (h ^ (h >> 32)) as u32
}

#[inline]
fn fixed_hash<T: Hash + ?Sized>(value: &T) -> u32 {
    fold(FixedState::default().hash_one(value))
}

impl Key for u32 {
    #[inline]
    fn key_hash(&self) -> u32 {
        *self
    }

    #[inline]
    fn key_eq(&self, other: &Self) -> Result<bool, TableError> {
        Ok(self == other)
    }
}

impl Key for i32 {
    #[inline]
    fn key_hash(&self) -> u32 {
        *self as u32
    }

    #[inline]
    fn key_eq(&self, other: &Self) -> Result<bool, TableError> {
        Ok(self == other)
    }
}

impl Key for u64 {
    #[inline]
    fn key_hash(&self) -> u32 {
        fold(*self)
    }

    #[inline]
    fn key_eq(&self, other: &Self) -> Result<bool, TableError> {
        Ok(self == other)
    }
}

impl Key for i64 {
    #[inline]
    fn key_hash(&self) -> u32 {
        fold(*self as u64)
    }

    #[inline]
    fn key_eq(&self, other: &Self) -> Result<bool, TableError> {
        Ok(self == other)
    }
}

impl Key for usize {
    #[inline]
    fn key_hash(&self) -> u32 {
        fold(*self as u64)
    }

    #[inline]
    fn key_eq(&self, other: &Self) -> Result<bool, TableError> {
        Ok(self == other)
    }
}

impl Key for String {
    #[inline]
    fn key_hash(&self) -> u32 {
        fixed_hash(self.as_str())
    }

    #[inline]
    fn key_eq(&self, other: &Self) -> Result<bool, TableError> {
        Ok(self == other)
    }
}

impl Key for &'static str {
    #[inline]
    fn key_hash(&self) -> u32 {
        fixed_hash(*self)
    }

    #[inline]
    fn key_eq(&self, other: &Self) -> Result<bool, TableError> {
        Ok(self == other)
    }
}

impl Key for Box<str> {
    #[inline]
    fn key_hash(&self) -> u32 {
        fixed_hash(&**self)
    }

    #[inline]
    fn key_eq(&self, other: &Self) -> Result<bool, TableError> {
        Ok(self == other)
    }
}

/// A key that is either an integer or a string.
///
/// Integer keys hash to themselves; string keys hash exactly like
/// [`String`]. Comparing an integer with a string is a type mismatch.
///
/// # Examples
///
/// ```
/// use kovan_splitmap::{DynKey, Key, TableError};
///
/// let a = DynKey::Int(7);
/// let b = DynKey::from("seven");
///
/// assert_eq!(a.key_eq(&DynKey::Int(7)), Ok(true));
/// assert!(matches!(a.key_eq(&b), Err(TableError::TypeMismatch { .. })));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DynKey {
    /// Identity-hashed integer key.
    Int(u32),
    /// String key.
    Str(String),
}

impl DynKey {
    /// Name of the key's kind, as reported in [`TableError::TypeMismatch`].
    pub fn kind(&self) -> &'static str {
        match self {
            DynKey::Int(_) => "int",
            DynKey::Str(_) => "str",
        }
    }
}

impl Key for DynKey {
    fn key_hash(&self) -> u32 {
        match self {
            DynKey::Int(v) => v.key_hash(),
            DynKey::Str(s) => s.key_hash(),
        }
    }

    fn key_eq(&self, other: &Self) -> Result<bool, TableError> {
        match (self, other) {
            (DynKey::Int(a), DynKey::Int(b)) => Ok(a == b),
            (DynKey::Str(a), DynKey::Str(b)) => Ok(a == b),
            _ => Err(TableError::TypeMismatch {
                left: self.kind(),
                right: other.kind(),
            }),
        }
    }
}

impl From<u32> for DynKey {
    fn from(v: u32) -> Self {
        DynKey::Int(v)
    }
}

impl From<&str> for DynKey {
    fn from(s: &str) -> Self {
        DynKey::Str(String::from(s))
    }
}

impl From<String> for DynKey {
    fn from(s: String) -> Self {
        DynKey::Str(s)
    }
}

/// Adapter that turns any `Hash + Eq` value into a [`Key`].
///
/// The hash is computed with a fixed-seed hasher, so it is stable across
/// calls and processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Hashed<T>(pub T);

impl<T> Key for Hashed<T>
where
    T: Hash + Eq + Send + Sync + 'static,
{
    #[inline]
    fn key_hash(&self) -> u32 {
        fixed_hash(&self.0)
    }

    #[inline]
    fn key_eq(&self, other: &Self) -> Result<bool, TableError> {
        Ok(self.0 == other.0)
    }
}
