//! Signals: pfuncs that wait for a named event.
//!
//! A [`SignalGroup`] files pfuncs under an integer key; posting the key
//! releases every pfunc filed under it, in attachment order, each at its
//! own priority. A caller-owned [`SignalHandle`] can cancel a waiting
//! pfunc or test whether it is still pending.
//!
//! # Serialization
//!
//! The bodies of attach, post, and detach run *as pfuncs at the group's
//! priority*. That single level is the group's lock: the waiter index is
//! only ever touched from it, so posting can walk the index without
//! masking interrupts. Pfuncs filed in a group should use priorities at or
//! below the group's; above it, delivery order is not well defined.
//!
//! # The handle protocol
//!
//! Cancellation races with posting by design. The internal handle and the
//! user handle point at each other while the attachment is live, and both
//! sides fall back to a shared dummy sentinel instead of null, so either
//! side can unlink first without leaving the other a dangling pointer and
//! [`SignalHandle::is_active`] stays a plain pointer comparison. The
//! mutable pointer fields are relaxed atomics; each has a single writer at
//! any instant, and the posting path re-reads them exactly where a racing
//! detach could have changed them.
use alloc::boxed::Box;
use core::{
    fmt,
    marker::PhantomData,
    ptr,
    sync::atomic::{AtomicPtr, Ordering},
};

use crate::{
    error::{fatal, ErrorCode},
    hash::{self, HashIndex},
    list::{self, ListNode},
    pfunc::{new_frame, FrameHdr},
    utils::RawCell,
    Kernel, Priority, System,
};

/// The group-owned side of one attachment.
///
/// Lives on the heap from attach until either the invoke wrapper or a
/// successful detach frees it. `node` must stay the first field: the
/// waiter index hands back `*mut ListNode`s that are cast to the owning
/// handle.
#[repr(C)]
pub(crate) struct SigHandleInt {
    /// Link in the waiter index. A null `prev` means the handle has been
    /// posted and is on its way to the invoke wrapper.
    node: ListNode,
    /// The waiting pfunc's invocation frame. Nilled by a detach that lost
    /// the race against post, telling the invoke wrapper to skip the call.
    frame: AtomicPtr<FrameHdr>,
    /// The caller's handle, or the dummy when none was supplied.
    user: AtomicPtr<SignalHandle>,
    /// The waiting pfunc's own priority.
    priority: Priority,
    /// The key this handle is filed under.
    key: i32,
    /// The owning group, type-erased; only the monomorphic entries below
    /// cast it back.
    group: *const (),
    /// Monomorphic detach dispatcher, so [`SignalHandle::detach`] needs no
    /// knowledge of the kernel instance.
    detach_shim: unsafe fn(*const SignalHandle),
}

// Safety: shared access is confined to the atomic fields; everything else
// is either written once before the handle is published or guarded by the
// owning group's priority ceiling. The static dummy's non-atomic fields
// are never written at all.
unsafe impl Sync for SigHandleInt {}

/// A caller-owned handle on one attachment.
///
/// Constructed inactive; becomes active when passed to
/// [`SignalGroup::attach_h`] (or a timer variant) and inactive again once
/// the pfunc has run or been detached. A handle must outlive its
/// attachment, which in practice means static storage.
pub struct SignalHandle {
    /// The internal handle, the dummy sentinel, or null before the first
    /// attach.
    inner: AtomicPtr<SigHandleInt>,
}

impl SignalHandle {
    /// A handle that is attached to nothing.
    #[inline]
    pub const fn new() -> Self {
        Self {
            inner: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Whether the attachment is still pending: the pfunc has neither run
    /// nor been detached. Lock-free.
    #[inline]
    pub fn is_active(&self) -> bool {
        let p = self.inner.load(Ordering::Relaxed);
        !p.is_null() && !ptr::eq(p, dummy_int())
    }

    /// Try to cancel the attached pfunc.
    ///
    /// Best-effort against a concurrent post: when this returns, the pfunc
    /// either already ran in full or will never run, and the handle reads
    /// inactive either way.
    ///
    /// That guarantee holds when the detach is issued at or above the
    /// waiting pfunc's priority, which keeps the delivery wrapper from
    /// completing in the middle of the hand-off below. A detach from
    /// underneath the waiter's level is exposed to the delivery in
    /// progress, like any state machine that polls its own cancellation
    /// from below.
    pub fn detach(&self) {
        let p = self.inner.load(Ordering::Relaxed);
        if p.is_null() {
            // Never attached.
            return;
        }
        // Safety: `p` is the internal handle or the dummy; both carry a
        // valid dispatcher, and nothing can free `p` between the load
        // above and the call (preemption only happens at probe points).
        let shim = unsafe { (*p).detach_shim };
        unsafe { shim(self) };
    }
}

impl Default for SignalHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SignalHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalHandle")
            .field("active", &self.is_active())
            .finish()
    }
}

/// The shared "not attached" sentinel. Real handles point here instead of
/// at null so the hot paths can write through their pointers without
/// branching; the sentinel absorbs those writes in its atomic fields.
static DUMMY_INT: SigHandleInt = SigHandleInt {
    node: ListNode::UNLINKED,
    frame: AtomicPtr::new(ptr::null_mut()),
    user: AtomicPtr::new(ptr::null_mut()),
    priority: 0,
    key: 0,
    group: ptr::null(),
    detach_shim: detach_noop,
};

/// Absorbs the user-handle write of invoke wrappers whose attachment had
/// no caller-supplied handle.
static DUMMY_USER: SignalHandle = SignalHandle {
    inner: AtomicPtr::new(ptr::null_mut()),
};

#[inline]
fn dummy_int() -> *mut SigHandleInt {
    (&DUMMY_INT as *const SigHandleInt).cast_mut()
}

#[inline]
fn dummy_user() -> *mut SignalHandle {
    (&DUMMY_USER as *const SignalHandle).cast_mut()
}

unsafe fn detach_noop(_user: *const SignalHandle) {}

/// A group of signals: an integer-keyed index of waiting pfuncs.
///
/// `hash_size` buckets spread the keys; any key is accepted when
/// `hash_size` is a power of two, otherwise keys are restricted to
/// `0..hash_size`. See the module documentation for the serialization
/// model.
pub struct SignalGroup<Traits: Kernel> {
    /// The level at which the group's own bodies run.
    priority: Priority,
    hash_size: i32,
    /// `hash_size - 1`, or `-1` when `hash_size` is not a power of two.
    mask: i32,
    /// Waiters, keyed by signal value. Only touched at `priority`.
    index: RawCell<HashIndex>,
    _marker: PhantomData<Traits>,
}

impl<Traits: Kernel> SignalGroup<Traits> {
    /// Create a group whose bodies run at `priority`.
    pub fn new(priority: Priority, hash_size: i32) -> Self {
        debug_assert!(hash_size >= 1);
        let mask = if hash_size & (hash_size - 1) == 0 {
            hash_size - 1
        } else {
            -1
        };
        Self {
            priority,
            hash_size,
            mask,
            index: RawCell::new(HashIndex::with_mask(hash_size, mask)),
            _marker: PhantomData,
        }
    }

    /// The level at which attach, post, and detach bodies execute.
    #[inline]
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Schedule `body` to run as a pfunc at `priority` once `key` is
    /// posted. Without a handle the attachment cannot be cancelled.
    pub fn attach(&'static self, key: i32, priority: Priority, body: impl FnOnce() + Send + 'static) {
        self.attach_with(key, priority, ptr::null_mut(), new_frame("signal.pfunc", body));
    }

    /// As [`attach`](Self::attach), also binding `handle` so the caller
    /// can cancel or poll the attachment.
    pub fn attach_h(
        &'static self,
        key: i32,
        priority: Priority,
        handle: &'static SignalHandle,
        body: impl FnOnce() + Send + 'static,
    ) {
        if cfg!(debug_assertions) {
            let cur = handle.inner.load(Ordering::Relaxed);
            if !cur.is_null() && !ptr::eq(cur, dummy_int()) {
                // Safety: an active handle's target is live.
                let back = unsafe { (*cur).user.load(Ordering::Relaxed) };
                if !ptr::eq(back, handle as *const _) {
                    fatal::<Traits>(ErrorCode::SigCorruptHandle);
                } else {
                    fatal::<Traits>(ErrorCode::SigMultipleAttach);
                }
            }
        }
        self.attach_with(
            key,
            priority,
            (handle as *const SignalHandle).cast_mut(),
            new_frame("signal.pfunc", body),
        );
    }

    fn attach_with(
        &'static self,
        key: i32,
        priority: Priority,
        user: *mut SignalHandle,
        frame: *mut FrameHdr,
    ) {
        if cfg!(debug_assertions) && self.mask == -1 && (key < 0 || key >= self.hash_size) {
            fatal::<Traits>(ErrorCode::SigAttachOutOfRange);
        }
        let h = Box::into_raw(Box::new(SigHandleInt {
            node: ListNode::UNLINKED,
            frame: AtomicPtr::new(frame),
            user: AtomicPtr::new(if user.is_null() { dummy_user() } else { user }),
            priority,
            key,
            group: (self as *const Self).cast(),
            detach_shim: detach_shim::<Traits>,
        }));
        // The handle pair is linked right away, so `is_active` holds from
        // the caller's point of view even while the filing below is still
        // queued behind the group level.
        if !user.is_null() {
            // Safety: the caller guarantees the handle outlives the
            // attachment.
            unsafe { (*user).inner.store(h, Ordering::Relaxed) };
        }
        let sframe = service_frame("signal.attach", attach_entry::<Traits>, h);
        // Safety: the frame was just allocated and is unowned.
        unsafe { System::<Traits>::call_frame(sframe, self.priority) };
    }

    /// Post `key`: every pfunc filed under it is released now, in
    /// attachment order, each subject to normal priority dispatch.
    pub fn post(&'static self, key: i32) {
        let frame = Box::into_raw(Box::new(PostFrame {
            hdr: FrameHdr {
                next: ptr::null_mut(),
                entry: post_entry::<Traits>,
                drop_fn: post_frame_drop,
                name: "signal.post",
            },
            key,
            group: (self as *const Self).cast(),
        }));
        // Safety: the frame was just allocated and is unowned.
        unsafe { System::<Traits>::call_frame(frame.cast(), self.priority) };
    }

    /// The post body. Runs at the group priority, the sole level from
    /// which the index is touched.
    fn post_body(&self, key: i32) {
        if cfg!(debug_assertions) && self.mask == -1 && (key < 0 || key >= self.hash_size) {
            fatal::<Traits>(ErrorCode::SigPostOutOfRange);
        }
        unsafe {
            // Safety: group-priority ceiling; see `RawCell`.
            let index = &mut *self.index.get();
            let branch = index.remove(key);
            if branch.is_null() {
                return;
            }
            // Unfile every waiter before dispatching any of them, so a
            // detach arriving mid-delivery finds the null `prev` marker
            // and takes the already-posted path rather than the index.
            let items = hash::branch_items(branch);
            let mut head: *mut SigHandleInt = ptr::null_mut();
            let mut tail: *mut SigHandleInt = ptr::null_mut();
            while !list::is_empty(items) {
                let n = list::pop_head(items);
                (*n).prev = ptr::null_mut();
                (*n).next = ptr::null_mut();
                // `node` is the first field of the handle.
                let h = n.cast::<SigHandleInt>();
                if tail.is_null() {
                    head = h;
                } else {
                    (*tail).node.next = n;
                }
                tail = h;
            }
            hash::free_branch(branch);

            // Deliver in attachment order. Handles above the group level
            // run inline here; the rest queue behind it.
            let mut h = head;
            while !h.is_null() {
                // The invoke wrapper frees `h`; read the link first.
                let next = (*h).node.next.cast::<SigHandleInt>();
                let frame = service_frame("signal.invoke", invoke_entry::<Traits>, h);
                System::<Traits>::call_frame(frame, (*h).priority);
                h = next;
            }
        }
    }
}

impl<Traits: Kernel> fmt::Debug for SignalGroup<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalGroup")
            .field("priority", &self.priority)
            .field("hash_size", &self.hash_size)
            .finish_non_exhaustive()
    }
}

/// Service frame carrying one internal handle to a group-priority body.
#[repr(C)]
struct SigFrame {
    hdr: FrameHdr,
    h: *mut SigHandleInt,
}

fn service_frame(
    name: &'static str,
    entry: unsafe fn(*mut FrameHdr),
    h: *mut SigHandleInt,
) -> *mut FrameHdr {
    Box::into_raw(Box::new(SigFrame {
        hdr: FrameHdr {
            next: ptr::null_mut(),
            entry,
            drop_fn: sig_frame_drop,
            name,
        },
        h,
    }))
    .cast()
}

unsafe fn sig_frame_drop(hdr: *mut FrameHdr) {
    drop(unsafe { Box::from_raw(hdr.cast::<SigFrame>()) });
}

/// Service frame carrying a post request.
#[repr(C)]
struct PostFrame {
    hdr: FrameHdr,
    key: i32,
    group: *const (),
}

unsafe fn post_frame_drop(hdr: *mut FrameHdr) {
    drop(unsafe { Box::from_raw(hdr.cast::<PostFrame>()) });
}

/// Attach body: file the handle. Runs at the group priority.
unsafe fn attach_entry<Traits: Kernel>(hdr: *mut FrameHdr) {
    unsafe {
        let frame = Box::from_raw(hdr.cast::<SigFrame>());
        let h = frame.h;
        drop(frame);
        let group = &*(*h).group.cast::<SignalGroup<Traits>>();
        // Safety: group-priority ceiling.
        let index = &mut *group.index.get();
        index.insert((*h).key, &mut (*h).node);
    }
}

unsafe fn post_entry<Traits: Kernel>(hdr: *mut FrameHdr) {
    unsafe {
        let frame = Box::from_raw(hdr.cast::<PostFrame>());
        let key = frame.key;
        let group = &*frame.group.cast::<SignalGroup<Traits>>();
        drop(frame);
        group.post_body(key);
    }
}

/// The indirection between a post and the user's pfunc. Runs at the
/// waiter's own priority, which keeps the window between the two as small
/// as the scheduler allows; a detach that lands inside the window is still
/// honored through the nilled frame pointer.
unsafe fn invoke_entry<Traits: Kernel>(hdr: *mut FrameHdr) {
    unsafe {
        let frame = Box::from_raw(hdr.cast::<SigFrame>());
        let h = frame.h;
        drop(frame);
        // Disconnect the user handle first. From here on the attachment
        // can no longer be detached and the handle reads inactive.
        let user = (*h).user.load(Ordering::Relaxed);
        (*user).inner.store(dummy_int(), Ordering::Relaxed);
        Traits::preempt_probe();
        // A detach that won the race nilled this; read it once, after the
        // disconnect above.
        let pfunc = (*h).frame.load(Ordering::Relaxed);
        drop(Box::from_raw(h));
        if !pfunc.is_null() {
            // Already at the right level; enter the frame directly.
            ((*pfunc).entry)(pfunc);
        }
    }
}

/// Detach body. Runs at the group priority, serialized against post.
unsafe fn detach_entry<Traits: Kernel>(hdr: *mut FrameHdr) {
    unsafe {
        let frame = Box::from_raw(hdr.cast::<SigFrame>());
        let h = frame.h;
        drop(frame);
        let group = &*(*h).group.cast::<SignalGroup<Traits>>();
        let pfunc = (*h).frame.load(Ordering::Relaxed);
        if pfunc.is_null() {
            // The invoke wrapper got here first and will skip the call;
            // the handle is its to free.
            return;
        }
        // We won: the pfunc never runs.
        ((*pfunc).drop_fn)(pfunc);
        if !(*h).node.prev.is_null() {
            // Still filed; the post for this key has not come through.
            // Safety: group-priority ceiling.
            let index = &mut *group.index.get();
            if index.remove_item(&mut (*h).node).is_err() {
                fatal::<Traits>(ErrorCode::HashNodeNotInTable);
            }
            drop(Box::from_raw(h));
        } else {
            // Posted but not yet invoked; leave the skip marker for the
            // invoke wrapper, which frees the handle.
            (*h).frame.store(ptr::null_mut(), Ordering::Relaxed);
        }
    }
}

/// Caller-context half of a detach; the monomorphic target of
/// [`SignalHandle::detach`].
unsafe fn detach_shim<Traits: Kernel>(user: *const SignalHandle) {
    unsafe {
        let h = (*user).inner.load(Ordering::Relaxed);
        // Sever the internal handle's back link. Writing through the dummy
        // when the attachment is already gone is harmless by construction.
        (*h).user.store(dummy_user(), Ordering::Relaxed);
        Traits::preempt_probe();
        // The attachment may have completed in a volatile way just before
        // the store above; read the handle again.
        let h = (*user).inner.load(Ordering::Relaxed);
        Traits::preempt_probe();
        // The user handle is detached from here on and can be reused.
        (*user).inner.store(dummy_int(), Ordering::Relaxed);
        if !ptr::eq(h, dummy_int()) {
            Traits::preempt_probe();
            let group = &*(*h).group.cast::<SignalGroup<Traits>>();
            let frame = service_frame("signal.detach", detach_entry::<Traits>, h);
            System::<Traits>::call_frame(frame, group.priority);
        }
    }
}
