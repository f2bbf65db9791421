//! The split-ordered list.
//!
//! A single singly-linked chain holds every sentinel and every data node of
//! the map, sorted by order key. Buckets are nothing more than entry points
//! into this chain.
//!
//! # Deletion
//!
//! Removing a data node is three steps:
//!
//! 1. **Take**: swap the node's value cell to null. This is the
//!    linearization point. The thread whose swap returns the cell owns the
//!    removed value; a node with a null cell is invisible to readers and can
//!    no longer have its value replaced.
//! 2. **Mark**: set bit 0 of the node's `next` pointer, freezing it.
//! 3. **Unlink**: CAS the predecessor's `next` from the victim to `succ`.
//!
//! Any thread that meets a taken node may perform steps 2 and 3 for it.
//!
//! Exactly one thread wins the unlink CAS for a given node and hands it to
//! [`kovan::retire`]; kovan frees it once no guard can still observe it.
//! Sentinels are never deleted, so every scan may restart from the sentinel
//! it started at.

use alloc::boxed::Box;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};
use crossbeam_utils::Backoff;
use kovan::{Atomic, Guard, RetiredNode, Shared, pin, retire};

use crate::bits;
use crate::error::TableError;
use crate::key::Key;

/// Deletion mark, stored in the low bit of `next`.
const MARK: usize = 1;

#[inline(always)]
fn is_marked<T>(p: Shared<'_, T>) -> bool {
    p.as_raw() as usize & MARK != 0
}

#[inline(always)]
fn unmarked<'g, T>(p: Shared<'g, T>) -> Shared<'g, T> {
    // SAFETY: clears a tag bit we set ourselves; the address is unchanged.
    unsafe { Shared::from_raw((p.as_raw() as usize & !MARK) as *mut T) }
}

#[inline(always)]
fn marked<'g, T>(p: Shared<'g, T>) -> Shared<'g, T> {
    // SAFETY: nodes are 8-byte aligned (RetiredNode), bit 0 is free.
    unsafe { Shared::from_raw((p.as_raw() as usize | MARK) as *mut T) }
}

/// Heap cell holding a value; replaced wholesale on overwrite.
#[repr(C)]
struct ValueCell<V> {
    retired: RetiredNode,
    value: V,
}

impl<V> ValueCell<V> {
    fn boxed(value: V) -> *mut Self {
        Box::into_raw(Box::new(Self {
            retired: RetiredNode::new(),
            value,
        }))
    }
}

/// Payload of a data node.
pub(crate) struct Entry<K, V> {
    key: K,
    /// Current value cell. Null once the entry has been removed.
    value: AtomicPtr<ValueCell<V>>,
}

impl<K, V> Entry<K, V> {
    #[inline]
    pub(crate) fn key(&self) -> &K {
        &self.key
    }

    /// Current value, or `None` if the entry was removed.
    #[inline]
    pub(crate) fn value<'g>(&self, _guard: &'g Guard) -> Option<&'g V> {
        let cell = self.value.load(Ordering::Acquire);
        // SAFETY: replaced and removed cells are retired, so the guard keeps
        // this one alive.
        unsafe { cell.as_ref() }.map(|cell| &cell.value)
    }
}

impl<K, V: 'static> Entry<K, V> {
    /// Takes the value cell, logically removing the entry.
    ///
    /// Returns `None` if another thread removed it first.
    fn take<'g>(&self, _guard: &'g Guard) -> Option<&'g V> {
        let cell = self.value.swap(ptr::null_mut(), Ordering::AcqRel);
        if cell.is_null() {
            return None;
        }
        // SAFETY: the swap made us the only owner of the cell; it is retired
        // once, and the caller's guard was pinned before the retirement.
        unsafe {
            retire(cell);
            Some(&(*cell).value)
        }
    }

    /// Installs `incoming`'s cell in place of the current one.
    ///
    /// Fails with `None` once the entry has been removed; `incoming` keeps
    /// its cell in that case.
    fn replace<'g>(&self, incoming: &Entry<K, V>, _guard: &'g Guard) -> Option<&'g V> {
        let cell = incoming.value.load(Ordering::Relaxed);
        let mut current = self.value.load(Ordering::Acquire);

        loop {
            if current.is_null() {
                return None;
            }
            match self.value.compare_exchange_weak(
                current,
                cell,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    incoming.value.store(ptr::null_mut(), Ordering::Relaxed);
                    // SAFETY: the old cell is no longer reachable from the
                    // entry; readers that loaded it are covered by their
                    // guards, and the caller's guard predates the retirement.
                    unsafe {
                        retire(current);
                        return Some(&(*current).value);
                    }
                }
                Err(actual) => current = actual,
            }
        }
    }
}

impl<K, V> Drop for Entry<K, V> {
    fn drop(&mut self) {
        let cell = *self.value.get_mut();
        if !cell.is_null() {
            // SAFETY: the installed cell is owned by the entry.
            unsafe { drop(Box::from_raw(cell)) };
        }
    }
}

/// A node of the split-ordered list.
///
/// `RetiredNode` must stay the first field: kovan reinterprets the node's
/// address as a `RetiredNode` when it is retired.
#[repr(C)]
pub(crate) struct Node<K, V> {
    retired: RetiredNode,
    order: u32,
    next: Atomic<Node<K, V>>,
    /// `None` for sentinels.
    entry: Option<Entry<K, V>>,
}

impl<K, V> Node<K, V> {
    pub(crate) fn sentinel(bucket: u32) -> Box<Self> {
        Box::new(Self {
            retired: RetiredNode::new(),
            order: bits::sentinel_order(bucket),
            next: Atomic::null(),
            entry: None,
        })
    }

    pub(crate) fn data(hash: u32, key: K, value: V) -> Box<Self> {
        Box::new(Self {
            retired: RetiredNode::new(),
            order: bits::data_order(hash),
            next: Atomic::null(),
            entry: Some(Entry {
                key,
                value: AtomicPtr::new(ValueCell::boxed(value)),
            }),
        })
    }

    #[inline]
    pub(crate) fn order(&self) -> u32 {
        self.order
    }

    #[inline]
    pub(crate) fn entry(&self) -> Option<&Entry<K, V>> {
        self.entry.as_ref()
    }

    /// Whether the node has been marked for unlinking.
    #[cfg(test)]
    pub(crate) fn is_deleted(&self, guard: &Guard) -> bool {
        is_marked(self.next.load(Ordering::Acquire, guard))
    }

    /// The following node, marked or not.
    #[inline]
    pub(crate) fn successor<'g>(&self, guard: &'g Guard) -> Option<&'g Node<K, V>> {
        let next = unmarked(self.next.load(Ordering::Acquire, guard));
        // SAFETY: reachable nodes are only freed through kovan.
        unsafe { next.as_ref() }
    }

    /// Sets the mark on `next` and returns the successor it froze.
    fn mark<'g>(&self, guard: &'g Guard) -> Shared<'g, Node<K, V>> {
        let mut succ = self.next.load(Ordering::Acquire, guard);
        while !is_marked(succ) {
            match self.next.compare_exchange(
                succ,
                marked(succ),
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(_) => return succ,
                Err(actual) => succ = actual,
            }
        }
        unmarked(succ)
    }
}

/// Where an insertion landed.
pub(crate) enum Resident<'g, K, V> {
    /// The new node was linked into the chain.
    Linked(&'g Node<K, V>),
    /// An equal sentinel was already linked; the new one was discarded.
    Existing(&'g Node<K, V>),
    /// A live node with an equal key was already linked; its value was
    /// replaced and the previous value is returned.
    Replaced(&'g V),
}

/// The chain itself. Owns the bucket-0 sentinel, which is its head.
pub(crate) struct SplitList<K, V> {
    head: *mut Node<K, V>,
}

impl<K, V> SplitList<K, V>
where
    K: Key,
    V: Send + Sync + 'static,
{
    pub(crate) fn new() -> Self {
        Self {
            head: Box::into_raw(Node::sentinel(0)),
        }
    }

    #[inline]
    pub(crate) fn head(&self) -> &Node<K, V> {
        // SAFETY: the head is allocated in `new` and freed only in `drop`.
        unsafe { &*self.head }
    }

    /// Unlinks the marked node `curr` from behind `prev`.
    ///
    /// Returns `false` when `prev` changed underneath us and the scan has to
    /// restart.
    #[inline]
    fn help_unlink<'g>(
        prev: &'g Node<K, V>,
        curr: Shared<'g, Node<K, V>>,
        succ: Shared<'g, Node<K, V>>,
        guard: &'g Guard,
    ) -> bool {
        match prev.next.compare_exchange(
            curr,
            unmarked(succ),
            Ordering::AcqRel,
            Ordering::Acquire,
            guard,
        ) {
            Ok(_) => {
                // SAFETY: we won the unlink; the node is unreachable and is
                // retired exactly once.
                unsafe { retire(curr.as_raw()) };
                true
            }
            Err(_) => false,
        }
    }

    /// Links `new` into the chain, scanning forward from `from`.
    ///
    /// `from` must be a sentinel whose order key does not exceed `new`'s.
    ///
    /// - an equal sentinel already linked is returned as is;
    /// - a live data node with an equal key gets `new`'s value;
    /// - a removed data node with an equal key is unlinked first;
    /// - data nodes sharing `new`'s order key with a different key are
    ///   skipped, so `new` lands after the whole tied group.
    pub(crate) fn insert<'g>(
        &self,
        from: &'g Node<K, V>,
        mut new: Box<Node<K, V>>,
        guard: &'g Guard,
    ) -> Result<Resident<'g, K, V>, TableError> {
        debug_assert!(from.entry.is_none() && from.order <= new.order);
        debug_assert_eq!(bits::is_data_order(new.order), new.entry.is_some());
        let backoff = Backoff::new();
        let mut start = from;

        'retry: loop {
            let mut prev = start;
            let mut curr = prev.next.load(Ordering::Acquire, guard);
            if is_marked(curr) {
                // `start` was deleted since we last confirmed it.
                start = from;
                backoff.spin();
                continue 'retry;
            }

            // SAFETY (loop): every node reached here was linked while our
            // guard was held, so kovan has not freed it.
            while let Some(node) = unsafe { curr.as_ref() } {
                let succ = node.next.load(Ordering::Acquire, guard);
                if is_marked(succ) {
                    if Self::help_unlink(prev, curr, succ, guard) {
                        curr = unmarked(succ);
                        continue;
                    }
                    start = from;
                    backoff.spin();
                    continue 'retry;
                }

                if node.order > new.order {
                    break;
                }

                if node.order == new.order {
                    let same = match (&node.entry, &new.entry) {
                        (None, None) => return Ok(Resident::Existing(node)),
                        (Some(resident), Some(incoming)) => {
                            resident.key.key_eq(&incoming.key)?
                        }
                        _ => unreachable!(
                            "sentinel and data node share order key {:#010x}",
                            new.order
                        ),
                    };

                    if same {
                        if let (Some(target), Some(incoming)) = (&node.entry, &new.entry) {
                            if let Some(old) = target.replace(incoming, guard) {
                                return Ok(Resident::Replaced(old));
                            }
                        }

                        // Removed under us: finish unlinking it, then link
                        // `new` as a fresh node.
                        let succ = node.mark(guard);
                        if Self::help_unlink(prev, curr, succ, guard) {
                            curr = succ;
                            continue;
                        }
                        start = from;
                        backoff.spin();
                        continue 'retry;
                    }
                }

                prev = node;
                curr = succ;
            }

            new.next.store(curr, Ordering::Relaxed);
            let raw = Box::into_raw(new);

            // SAFETY: `raw` comes from `Box::into_raw` just above.
            match prev.next.compare_exchange(
                curr,
                unsafe { Shared::from_raw(raw) },
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                // SAFETY: linked nodes are only freed through kovan.
                Ok(_) => return Ok(Resident::Linked(unsafe { &*raw })),
                Err(actual) => {
                    // SAFETY: the CAS failed, nobody else saw `raw`.
                    new = unsafe { Box::from_raw(raw) };
                    // Resume from the last confirmed node unless it was
                    // deleted meanwhile.
                    start = if is_marked(actual) { from } else { prev };
                    backoff.spin();
                }
            }
        }
    }

    /// Looks up `key` among the data nodes at `order`, starting at `from`.
    ///
    /// Read-only: removed nodes are skipped, not unlinked. Sentinels met on
    /// the way are passed over, which keeps lookups correct for callers
    /// that resolved their bucket under an older, narrower capacity.
    pub(crate) fn find<'g>(
        &self,
        from: &'g Node<K, V>,
        order: u32,
        key: &K,
        guard: &'g Guard,
    ) -> Result<Option<&'g V>, TableError> {
        let mut curr = unmarked(from.next.load(Ordering::Acquire, guard));

        // SAFETY: see `insert`.
        while let Some(node) = unsafe { curr.as_ref() } {
            if node.order > order {
                break;
            }

            let succ = node.next.load(Ordering::Acquire, guard);
            if node.order == order && !is_marked(succ) {
                if let Some(entry) = &node.entry {
                    if entry.key.key_eq(key)? {
                        if let Some(value) = entry.value(guard) {
                            return Ok(Some(value));
                        }
                    }
                }
            }
            curr = unmarked(succ);
        }

        Ok(None)
    }

    /// Deletes the data node holding `key`, returning its last value.
    pub(crate) fn delete<'g>(
        &self,
        from: &'g Node<K, V>,
        order: u32,
        key: &K,
        guard: &'g Guard,
    ) -> Result<Option<&'g V>, TableError> {
        debug_assert!(from.entry.is_none());
        let backoff = Backoff::new();

        'retry: loop {
            let mut prev = from;
            let mut curr = prev.next.load(Ordering::Acquire, guard);

            // SAFETY: see `insert`.
            while let Some(node) = unsafe { curr.as_ref() } {
                let succ = node.next.load(Ordering::Acquire, guard);
                if is_marked(succ) {
                    if Self::help_unlink(prev, curr, succ, guard) {
                        curr = unmarked(succ);
                        continue;
                    }
                    backoff.spin();
                    continue 'retry;
                }

                if node.order > order {
                    return Ok(None);
                }

                if node.order == order {
                    if let Some(entry) = &node.entry {
                        if entry.key.key_eq(key)? {
                            let taken = entry.take(guard);
                            let succ = node.mark(guard);
                            if !Self::help_unlink(prev, curr, succ, guard) {
                                self.purge(from, order, guard);
                            }
                            match taken {
                                Some(value) => return Ok(Some(value)),
                                // Removed by someone else; a fresh node for
                                // the same key may follow.
                                None => {
                                    backoff.spin();
                                    continue 'retry;
                                }
                            }
                        }
                    }
                }

                prev = node;
                curr = succ;
            }

            return Ok(None);
        }
    }

    /// Unlinks every marked node between `from` and `order`.
    fn purge<'g>(&self, from: &'g Node<K, V>, order: u32, guard: &'g Guard) {
        let backoff = Backoff::new();

        'retry: loop {
            let mut prev = from;
            let mut curr = prev.next.load(Ordering::Acquire, guard);

            // SAFETY: see `insert`.
            while let Some(node) = unsafe { curr.as_ref() } {
                let succ = node.next.load(Ordering::Acquire, guard);
                if is_marked(succ) {
                    if Self::help_unlink(prev, curr, succ, guard) {
                        curr = unmarked(succ);
                        continue;
                    }
                    backoff.spin();
                    continue 'retry;
                }
                if node.order > order {
                    return;
                }
                prev = node;
                curr = succ;
            }
            return;
        }
    }
}

impl<K, V> Drop for SplitList<K, V> {
    fn drop(&mut self) {
        let guard = pin();
        let mut current = self.head;

        while !current.is_null() {
            // SAFETY: `&mut self` means no other thread can reach the chain;
            // every node still linked is owned by it. Nodes that were
            // unlinked are owned by kovan and are not reachable from here.
            unsafe {
                let next = unmarked((*current).next.load(Ordering::Relaxed, &guard));
                drop(Box::from_raw(current));
                current = next.as_raw();
            }
        }
    }
}
