//! Lock-free split-ordered hash map using kovan memory reclamation
//!
//! This crate provides a concurrent hash map built on split-ordered lists:
//! every entry lives in one sorted, lock-free linked list, and buckets are
//! shortcuts into that list. Growing the table never moves an entry; it only
//! widens the number of hash bits used to pick a bucket.
//!
//! # Features
//!
//! - **Lock-Free**: No mutexes, spinlocks, or blocking operations
//! - **Incremental Resize**: Capacity doubles without rehashing; new buckets
//!   are linked lazily on first use
//! - **Safe Memory Reclamation**: Deleted nodes, replaced values and old
//!   bucket directories are retired through kovan
//! - **Typed Key Errors**: Keys of mixed kinds report a mismatch instead of
//!   silently comparing unequal
//!
//! # Example
//!
//! ```rust
//! use kovan_splitmap::SplitMap;
//!
//! let map = SplitMap::new();
//!
//! map.put("testing", 100).unwrap();
//! map.put("textmate", 200).unwrap();
//!
//! assert_eq!(map.get(&"testing").unwrap(), Some(100));
//! assert_eq!(map.insert("testing", 150).unwrap(), Some(100));
//!
//! map.delete(&"textmate").unwrap();
//! assert_eq!(map.len(), 1);
//! ```

#![warn(missing_docs)]
#![no_std]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

mod bits;
mod directory;
mod error;
mod key;
mod list;
mod table;

pub use bits::{MAX_BITS, reverse};
pub use error::TableError;
pub use key::{DynKey, Hashed, Key};
pub use table::{DEFAULT_GROWTH_RATIO, DEFAULT_INITIAL_BITS, Iter, SplitMap, SplitMapBuilder};
