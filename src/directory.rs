//! Bucket directory.
//!
//! Maps a bucket index to its sentinel in the [`SplitList`]. The backing
//! array is an immutable-length snapshot published through a single atomic
//! pointer: growth copies the entries into a longer snapshot and swaps it in,
//! and the old snapshot is retired through kovan. Slots only cache sentinel
//! addresses, so an entry written into a snapshot that was just replaced is
//! merely lost from the cache and gets resolved again on the next access.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;
use kovan::{Atomic, Guard, RetiredNode, Shared, pin, retire};

use crate::bits::{self, MAX_BITS};
use crate::error::TableError;
use crate::key::Key;
use crate::list::{Node, Resident, SplitList};

#[repr(C)]
struct Snapshot<K, V> {
    retired: RetiredNode,
    slots: Box<[Atomic<Node<K, V>>]>,
}

impl<K, V> Snapshot<K, V> {
    fn empty(len: usize) -> Vec<Atomic<Node<K, V>>> {
        let mut slots = Vec::with_capacity(len);
        for _ in 0..len {
            slots.push(Atomic::null());
        }
        slots
    }

    fn boxed(slots: Vec<Atomic<Node<K, V>>>) -> *mut Self {
        Box::into_raw(Box::new(Self {
            retired: RetiredNode::new(),
            slots: slots.into_boxed_slice(),
        }))
    }

    #[inline]
    fn get<'g>(&self, idx: u32, guard: &'g Guard) -> Option<&'g Node<K, V>> {
        let slot = self.slots.get(idx as usize)?;
        let sentinel = slot.load(Ordering::Acquire, guard);
        // SAFETY: sentinels are never unlinked; they live as long as the list.
        unsafe { sentinel.as_ref() }
    }
}

/// Growable index from bucket number to sentinel.
pub(crate) struct Directory<K, V> {
    current: Atomic<Snapshot<K, V>>,
}

impl<K, V> Directory<K, V>
where
    K: Key,
    V: Send + Sync + 'static,
{
    /// Creates a directory of `len` slots whose bucket 0 is `head`.
    pub(crate) fn new(len: usize, head: &Node<K, V>) -> Self {
        let slots = Snapshot::empty(len.max(1));
        slots[0].store(
            // SAFETY: `head` is owned by the list and outlives the directory's use.
            unsafe { Shared::from_raw(head as *const Node<K, V> as *mut Node<K, V>) },
            Ordering::Relaxed,
        );
        Self {
            current: Atomic::new(Snapshot::boxed(slots)),
        }
    }

    #[inline]
    fn snapshot<'g>(&self, guard: &'g Guard) -> &'g Snapshot<K, V> {
        // SAFETY: the current snapshot is never null; replaced snapshots are
        // retired, so the guard keeps them alive.
        unsafe { self.current.load(Ordering::Acquire, guard).deref() }
    }

    /// Number of addressable slots in the current snapshot.
    pub(crate) fn len(&self, guard: &Guard) -> usize {
        self.snapshot(guard).slots.len()
    }

    /// Number of slots holding a sentinel in the current snapshot.
    pub(crate) fn initialized(&self, guard: &Guard) -> usize {
        self.snapshot(guard)
            .slots
            .iter()
            .filter(|slot| !slot.load(Ordering::Acquire, guard).is_null())
            .count()
    }

    /// Makes sure the current snapshot addresses at least `len` buckets.
    ///
    /// Snapshots at least double, so a burst of growth requests publishes
    /// few intermediate arrays.
    pub(crate) fn ensure_len(&self, len: usize, guard: &Guard) {
        loop {
            let current = self.current.load(Ordering::Acquire, guard);
            // SAFETY: see `snapshot`.
            let snapshot = unsafe { current.deref() };
            let old_len = snapshot.slots.len();
            if old_len >= len {
                return;
            }

            let new_len = len.max(old_len * 2).min(1 << MAX_BITS);
            let mut slots = Snapshot::empty(new_len);
            for (dst, src) in slots.iter_mut().zip(snapshot.slots.iter()) {
                *dst = Atomic::new(src.load(Ordering::Acquire, guard).as_raw());
            }
            let grown = Snapshot::boxed(slots);

            match self.current.compare_exchange(
                current,
                // SAFETY: `grown` is a fresh allocation.
                unsafe { Shared::from_raw(grown) },
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(_) => {
                    // SAFETY: the old snapshot is unreachable for new readers.
                    unsafe { retire(current.as_raw()) };
                    return;
                }
                Err(_) => {
                    // SAFETY: the CAS failed, `grown` was never published.
                    unsafe { drop(Box::from_raw(grown)) };
                }
            }
        }
    }

    /// Records `sentinel` as bucket `idx` in the latest snapshot.
    fn publish(&self, idx: u32, sentinel: &Node<K, V>, guard: &Guard) {
        if let Some(slot) = self.snapshot(guard).slots.get(idx as usize) {
            slot.store(
                // SAFETY: sentinels are never freed while the list lives.
                unsafe { Shared::from_raw(sentinel as *const Node<K, V> as *mut Node<K, V>) },
                Ordering::Release,
            );
        }
    }

    /// Returns the sentinel of bucket `idx` if it is cached, else that of
    /// its closest cached ancestor. Never links anything.
    ///
    /// A scan from an ancestor covers `idx`'s keys: the ancestor's sentinel
    /// precedes them in split order, and lookups pass over sentinels.
    pub(crate) fn nearest<'g>(
        &self,
        list: &'g SplitList<K, V>,
        idx: u32,
        guard: &'g Guard,
    ) -> &'g Node<K, V> {
        let snapshot = self.snapshot(guard);
        let mut cursor = idx;
        while cursor != 0 {
            if let Some(sentinel) = snapshot.get(cursor, guard) {
                return sentinel;
            }
            cursor = bits::parent(cursor);
        }
        list.head()
    }

    /// Returns the sentinel of bucket `idx`, linking it (and any missing
    /// ancestors) into `list` first if needed.
    ///
    /// Ancestors are resolved iteratively: climb through parents until one
    /// is already in the directory (bucket 0 always is), then link the
    /// missing sentinels top-down, each scan starting at its parent.
    pub(crate) fn get_or_init<'g>(
        &self,
        list: &'g SplitList<K, V>,
        idx: u32,
        guard: &'g Guard,
    ) -> Result<&'g Node<K, V>, TableError> {
        self.ensure_len(idx as usize + 1, guard);
        let snapshot = self.snapshot(guard);

        if let Some(sentinel) = snapshot.get(idx, guard) {
            debug_assert_eq!(sentinel.order(), bits::sentinel_order(idx));
            return Ok(sentinel);
        }

        // A parent chain is at most one entry per set bit.
        let mut pending = [0u32; MAX_BITS as usize + 1];
        let mut depth = 0;
        let mut cursor = idx;
        let mut anchor = loop {
            pending[depth] = cursor;
            depth += 1;
            cursor = bits::parent(cursor);
            if cursor == 0 {
                break list.head();
            }
            if let Some(sentinel) = snapshot.get(cursor, guard) {
                break sentinel;
            }
        };

        while depth > 0 {
            depth -= 1;
            let bucket = pending[depth];
            let sentinel = match list.insert(anchor, Node::sentinel(bucket), guard)? {
                Resident::Linked(node) | Resident::Existing(node) => node,
                Resident::Replaced(_) => unreachable!("sentinel insert replaced a value"),
            };
            assert_eq!(
                sentinel.order(),
                bits::sentinel_order(bucket),
                "bucket {} resolved to a foreign sentinel",
                bucket
            );
            self.publish(bucket, sentinel, guard);
            anchor = sentinel;
        }

        Ok(anchor)
    }
}

impl<K, V> Drop for Directory<K, V> {
    fn drop(&mut self) {
        let guard = pin();
        let current = self.current.load(Ordering::Acquire, &guard);
        // SAFETY: `&mut self`; slots do not own the sentinels they point to.
        unsafe { drop(Box::from_raw(current.as_raw())) };
    }
}
