//! Bit-level helpers for split ordering.
//!
//! Every node in the list is ordered by the bit-reversed value of its hash.
//! Reversal turns the low, bucket-selecting bits of a hash into the most
//! significant bits of its order key, so the nodes of bucket `i` stay
//! contiguous with the nodes of `i + 2^bits` when the table doubles.

/// Highest supported capacity exponent.
///
/// Bucket indices must keep bit 31 clear so that `reverse(idx)` keeps its
/// low bit clear; that bit is reserved for the data-node flag.
pub const MAX_BITS: u32 = 31;

/// Low bit of an order key: set on data nodes, clear on sentinels.
pub(crate) const DATA_FLAG: u32 = 1;

/// Reverses the bit order of a 32-bit word.
///
/// Bit `i` of the input ends up at bit `31 - i` of the output.
///
/// # Examples
///
/// ```
/// use kovan_splitmap::reverse;
///
/// assert_eq!(reverse(0x0000_00FF), 0xFF00_0000);
/// assert_eq!(reverse(reverse(0xDEAD_BEEF)), 0xDEAD_BEEF);
/// ```
#[inline]
pub const fn reverse(mut v: u32) -> u32 {
    v = ((v >> 1) & 0x5555_5555) | ((v & 0x5555_5555) << 1);
    v = ((v >> 2) & 0x3333_3333) | ((v & 0x3333_3333) << 2);
    v = ((v >> 4) & 0x0F0F_0F0F) | ((v & 0x0F0F_0F0F) << 4);
    v = ((v >> 8) & 0x00FF_00FF) | ((v & 0x00FF_00FF) << 8);
    (v >> 16) | (v << 16)
}

/// Order key of the sentinel that opens bucket `idx`.
#[inline(always)]
pub(crate) const fn sentinel_order(idx: u32) -> u32 {
    reverse(idx) & !DATA_FLAG
}

/// Order key of a data node whose key hashes to `hash`.
#[inline(always)]
pub(crate) const fn data_order(hash: u32) -> u32 {
    reverse(hash) | DATA_FLAG
}

#[inline(always)]
pub(crate) const fn is_data_order(order: u32) -> bool {
    order & DATA_FLAG != 0
}

/// Bucket whose sentinel must exist before `idx`'s sentinel is linked.
///
/// Clearing the most significant set bit yields the bucket that `idx` split
/// off from, whose sentinel precedes `idx`'s in split order.
#[inline]
pub(crate) const fn parent(idx: u32) -> u32 {
    if idx == 0 {
        0
    } else {
        idx & !(1 << (31 - idx.leading_zeros()))
    }
}

/// Mask selecting the low `bits` bits of a hash.
#[inline(always)]
pub(crate) const fn mask(bits: u32) -> u32 {
    if bits >= 32 { u32::MAX } else { (1 << bits) - 1 }
}
