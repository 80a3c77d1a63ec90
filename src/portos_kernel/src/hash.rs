//! Bucketed value-to-list index.
//!
//! Each bucket holds a singly-linked *trunk* of key nodes sorted by
//! wrap-around signed comparison (see [`wrap_cmp`]), and every key node
//! owns a circular list of the items filed under that value, in insertion
//! order. The index therefore supports timestamp-like keys that roll over:
//! walking a trunk always yields values in wrap-around ascending order.
//!
//! Trunk walks are bounded without an explicit length check: every trunk
//! ends at a per-table *dummy node*, and a lookup first stores
//! `value + 1` into the dummy so the sorted scan is guaranteed to stop
//! there.
//!
//! The signal subsystem files its waiters here, keyed by signal value. The
//! embedding object serializes all access (for signal groups, the group
//! priority ceiling), so the index itself takes `&mut self` and never
//! locks.
use alloc::{boxed::Box, vec};
use core::{mem::offset_of, ptr};

use crate::{error::ErrorCode, list, list::ListNode};

/// Wrap-around signed comparison: positive if `a > b`, zero if equal,
/// negative if `a < b`, where the order treats the value space as a ring.
/// For instance `0x7FFF_FFFF` sorts below `0x8000_0000u32 as i32`.
///
/// `a - b < 0` is a modulo operation on two's-complement machines, while
/// `a < b` is not, which is exactly the distinction this helper pins down.
#[inline]
pub(crate) fn wrap_cmp(a: i32, b: i32) -> i32 {
    a.wrapping_sub(b)
}

/// A trunk entry owning the items filed under one value.
#[repr(C)]
pub(crate) struct HashNode {
    next: *mut HashNode,
    value: i32,
    /// Sentinel of the circular item list.
    items: ListNode,
}

/// The index. See the module documentation.
pub(crate) struct HashIndex {
    /// `size - 1` for power-of-two sizes, else `-1`, in which case values
    /// index buckets directly and the caller keeps them in `0..size`.
    mask: i32,
    /// One trunk head per bucket; empty trunks point at `dummy`.
    buckets: Box<[*mut HashNode]>,
    /// Shared trunk terminator. Only its `value` field is meaningful, and
    /// only during a lookup that just primed it.
    dummy: Box<HashNode>,
}

// Safety: the raw pointers only refer to heap nodes owned by this index;
// moving the index between threads moves their ownership with it.
unsafe impl Send for HashIndex {}

impl HashIndex {
    /// Create an index with `size` buckets and the given bucket mask.
    ///
    /// The caller chooses the mask: `size - 1` when `size` is a power of
    /// two, or `-1` for direct indexing with range-checked values.
    pub(crate) fn with_mask(size: i32, mask: i32) -> Self {
        let mut this = Self {
            mask,
            buckets: vec![ptr::null_mut(); size as usize].into_boxed_slice(),
            dummy: Box::new(HashNode {
                next: ptr::null_mut(),
                value: 0,
                items: ListNode::UNLINKED,
            }),
        };
        let dummy: *mut HashNode = &mut *this.dummy;
        for slot in this.buckets.iter_mut() {
            *slot = dummy;
        }
        this
    }

    /// Create an index with `size` buckets. `size` must be a positive
    /// power of two (error 300 territory).
    #[cfg(test)]
    pub(crate) fn new(size: i32) -> Self {
        debug_assert!(
            size >= 1 && size & (size - 1) == 0,
            "hash size not a power of two (error 300)"
        );
        Self::with_mask(size, size - 1)
    }

    /// File `item` under `value`, after any items already filed there.
    ///
    /// # Safety
    ///
    /// `item` must be unlinked and must stay valid until it is removed.
    pub(crate) unsafe fn insert(&mut self, value: i32, item: *mut ListNode) {
        // Prime the terminator so the sorted scan below must stop.
        let dummy: *mut HashNode = &mut *self.dummy;
        unsafe {
            (*dummy).value = value.wrapping_add(1);
        }
        let slot: *mut *mut HashNode = &mut self.buckets[(value & self.mask) as usize];
        unsafe {
            let (slot, cur, delta) = trunk_seek(slot, value);
            if delta == 0 {
                // A node for this value exists; keep insertion order.
                list::push_tail(&mut (*cur).items, item);
            } else {
                // First item for this value; splice a node before `cur`
                // (possibly the dummy).
                let node = new_node(value, cur);
                list::push_tail(&mut (*node).items, item);
                *slot = node;
            }
        }
    }

    /// Unfile every item under `value`, returning the owning node, or null
    /// if the value is absent. The caller walks the returned node's item
    /// list and then releases the node with [`free_branch`].
    pub(crate) unsafe fn remove(&mut self, value: i32) -> *mut HashNode {
        let dummy: *mut HashNode = &mut *self.dummy;
        unsafe {
            (*dummy).value = value.wrapping_add(1);
        }
        let slot: *mut *mut HashNode = &mut self.buckets[(value & self.mask) as usize];
        unsafe {
            let (slot, cur, delta) = trunk_seek(slot, value);
            if delta == 0 {
                *slot = (*cur).next;
                cur
            } else {
                ptr::null_mut()
            }
        }
    }

    /// Unfile a single item. Releases the owning node if this was the last
    /// item filed under its value.
    ///
    /// # Safety
    ///
    /// `item` must currently be filed in this index.
    pub(crate) unsafe fn remove_item(&mut self, item: *mut ListNode) -> Result<(), ErrorCode> {
        unsafe {
            if !list::is_single(item) {
                list::pop(item);
                return Ok(());
            }
            // `item` is the last one under its value: the only other ring
            // member is the owning node's sentinel. Re-locating the node
            // through its value keeps this robust against a stale `item`.
            let node = owner_of((*item).next);
            let value = (*node).value;
            let dummy: *mut HashNode = &mut *self.dummy;
            (*dummy).value = value.wrapping_add(1);
            let slot: *mut *mut HashNode = &mut self.buckets[(value & self.mask) as usize];
            let (slot, cur, delta) = trunk_seek(slot, value);
            if delta == 0 {
                *slot = (*cur).next;
                drop(Box::from_raw(cur));
                Ok(())
            } else {
                Err(ErrorCode::HashNodeNotInTable)
            }
        }
    }

    #[cfg(test)]
    fn bucket_values(&mut self, bucket: usize) -> Vec<i32> {
        let dummy: *mut HashNode = &mut *self.dummy;
        let mut out = Vec::new();
        let mut cur = self.buckets[bucket];
        while cur != dummy {
            unsafe {
                out.push((*cur).value);
                cur = (*cur).next;
            }
        }
        out
    }
}

impl Drop for HashIndex {
    fn drop(&mut self) {
        // Items are owned elsewhere; only the trunk nodes are ours.
        let dummy: *mut HashNode = &mut *self.dummy;
        for slot in self.buckets.iter_mut() {
            let mut cur = *slot;
            while cur != dummy {
                // Safety: trunk nodes are exclusively owned by the index.
                let next = unsafe { (*cur).next };
                drop(unsafe { Box::from_raw(cur) });
                cur = next;
            }
        }
    }
}

/// The item-list sentinel of `node`.
pub(crate) unsafe fn branch_items(node: *mut HashNode) -> *mut ListNode {
    unsafe { &mut (*node).items }
}

/// Release a node returned by [`HashIndex::remove`] once its items have
/// been drained.
pub(crate) unsafe fn free_branch(node: *mut HashNode) {
    drop(unsafe { Box::from_raw(node) });
}

fn new_node(value: i32, next: *mut HashNode) -> *mut HashNode {
    let node = Box::into_raw(Box::new(HashNode {
        next,
        value,
        items: ListNode::UNLINKED,
    }));
    // The sentinel can only self-link once the node has its final address.
    unsafe {
        list::init(&mut (*node).items);
    }
    node
}

/// Walk the trunk at `slot` until a value not below `value` is met. The
/// dummy node must have been primed with `value + 1` first. Returns the
/// link that points at the stopping node, the stopping node, and the final
/// comparison result (`0` for an exact match).
unsafe fn trunk_seek(
    slot: *mut *mut HashNode,
    value: i32,
) -> (*mut *mut HashNode, *mut HashNode, i32) {
    unsafe {
        let mut slot = slot;
        let mut cur = *slot;
        let mut delta = wrap_cmp(value, (*cur).value);
        while delta > 0 {
            slot = &mut (*cur).next;
            cur = (*cur).next;
            delta = wrap_cmp(value, (*cur).value);
        }
        (slot, cur, delta)
    }
}

unsafe fn owner_of(sentinel: *mut ListNode) -> *mut HashNode {
    unsafe { sentinel.cast::<u8>().sub(offset_of!(HashNode, items)).cast() }
}
