//! The priority-function scheduler.
//!
//! # Data structure
//!
//! The scheduler's database is a bitmap with one bit per priority level,
//! set when the level has pending invocation frames. The frames of one
//! level form a singly-linked FIFO addressed by a `first`/`last` pointer
//! pair, so enqueueing at the tail and draining from the head are both
//! O(1). The bitmap bit is set before an enqueue completes and cleared
//! only after a drain has observed the level empty; a stale set bit is
//! harmless because the drain re-checks the list.
//!
//! # Dispatch
//!
//! [`System::call`] runs the pfunc immediately, as a plain nested call on
//! the one shared stack, when its priority is above the running level.
//! Otherwise the frame is queued and runs when the level drops back, in
//! [`System::restore_pri`]'s drain loop. The drain never holds the
//! interrupt lock across a pfunc body: it detaches a whole pending chain
//! under the lock, walks it as its exclusive owner, and lets preempting
//! interrupts build a fresh chain in the meantime.
//!
//! The running level itself is tracked in `curpri`, and `maxpri` caches
//! the highest level that may have pending frames. `maxpri` is a hint: it
//! is cheap to read without the lock and is always re-confirmed against
//! the bitmap before a bit is retired.
use alloc::boxed::Box;
use core::{
    fmt,
    mem::ManuallyDrop,
    ptr,
    sync::atomic::{AtomicI32, AtomicUsize, Ordering},
};

use crate::{
    error::{fatal, ErrorCode},
    klock::{self, IntLockCell},
    utils::{msb, Init},
    Kernel, Platform, Priority, System, MAX_PRIORITY_LEVELS, PRI_BASE,
};

/// The head of an invocation frame.
///
/// A frame is a heap record carrying everything needed to run one pfunc
/// later: the scheduler link, the entry that un-marshals the arguments and
/// runs the body, and a destructor used when the invocation is cancelled
/// instead of run. Concrete frames embed this header as their first field.
///
/// Ownership moves along allocator → caller → scheduler or service →
/// `entry`/`drop_fn`, which free the frame.
#[repr(C)]
pub struct FrameHdr {
    /// Scheduler FIFO link. Meaningful only while the scheduler owns the
    /// frame.
    pub(crate) next: *mut FrameHdr,
    /// Consume the frame and run the pfunc body.
    pub(crate) entry: unsafe fn(*mut FrameHdr),
    /// Consume the frame without running the body.
    pub(crate) drop_fn: unsafe fn(*mut FrameHdr),
    /// Debug label.
    pub(crate) name: &'static str,
}

impl fmt::Debug for FrameHdr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameHdr").field("name", &self.name).finish()
    }
}

/// A frame whose payload is a closure.
#[repr(C)]
struct ClosureFrame<F> {
    hdr: FrameHdr,
    body: ManuallyDrop<F>,
}

unsafe fn closure_entry<F: FnOnce()>(hdr: *mut FrameHdr) {
    // Safety: `hdr` heads the `ClosureFrame<F>` this entry was minted for.
    let mut frame = unsafe { Box::from_raw(hdr.cast::<ClosureFrame<F>>()) };
    // Move the body out and release the frame before running it, so the
    // allocation is not held across a long pfunc.
    let body = unsafe { ManuallyDrop::take(&mut frame.body) };
    drop(frame);
    body();
}

unsafe fn closure_drop<F: FnOnce()>(hdr: *mut FrameHdr) {
    let mut frame = unsafe { Box::from_raw(hdr.cast::<ClosureFrame<F>>()) };
    // Safety: the body was never taken; dropped exactly once here.
    unsafe { ManuallyDrop::drop(&mut frame.body) };
    drop(frame);
}

/// Allocate an invocation frame for `body`.
pub(crate) fn new_frame<F: FnOnce() + Send + 'static>(
    name: &'static str,
    body: F,
) -> *mut FrameHdr {
    let frame = Box::new(ClosureFrame {
        hdr: FrameHdr {
            next: ptr::null_mut(),
            entry: closure_entry::<F>,
            drop_fn: closure_drop::<F>,
            name,
        },
        body: ManuallyDrop::new(body),
    });
    Box::into_raw(frame).cast()
}

/// One priority level's pending-frame FIFO.
///
/// Empty is both pointers null; otherwise `first` heads the chain and
/// `last` addresses the tail for O(1) append. Only ever touched under the
/// interrupt lock, or after the whole chain has been detached into a
/// local.
pub(crate) struct LevelQueue {
    pub(crate) first: *mut FrameHdr,
    pub(crate) last: *mut FrameHdr,
}

// Safety: the pointers refer to heap frames whose ownership rides with the
// queue; the interrupt lock serializes every access.
unsafe impl Send for LevelQueue {}

impl Init for LevelQueue {
    const INIT: Self = Self {
        first: ptr::null_mut(),
        last: ptr::null_mut(),
    };
}

/// The scheduler's singleton state. A port instantiates one per kernel
/// instance; see [`KernelStatic`](crate::KernelStatic).
pub struct KernelState<Traits: Platform> {
    /// The currently running priority, or [`PRI_BASE`]. Single writer at
    /// any instant; read and written without the lock.
    pub(crate) curpri: AtomicI32,
    /// Hint for the highest level that may have pending frames. Kept from
    /// under-shooting while a drain is in progress; re-confirmed against
    /// `bitmap` before trusting it downwards.
    pub(crate) maxpri: AtomicI32,
    /// One bit per level with pending frames. Mutated under the lock,
    /// readable without it.
    pub(crate) bitmap: AtomicUsize,
    pub(crate) levels: [IntLockCell<Traits, LevelQueue>; MAX_PRIORITY_LEVELS],
}

impl<Traits: Platform> Init for KernelState<Traits> {
    const INIT: Self = Self {
        curpri: AtomicI32::new(PRI_BASE),
        maxpri: AtomicI32::new(PRI_BASE),
        bitmap: AtomicUsize::new(0),
        levels: Init::INIT,
    };
}

impl<Traits: Platform> fmt::Debug for KernelState<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelState")
            .field("curpri", &self.curpri)
            .field("maxpri", &self.maxpri)
            .field("bitmap", &self.bitmap)
            .finish_non_exhaustive()
    }
}

impl<Traits: Kernel> System<Traits> {
    /// The priority of the running pfunc, or [`PRI_BASE`] outside any
    /// pfunc context.
    #[inline]
    pub fn current_pri() -> Priority {
        Traits::state().curpri.load(Ordering::Relaxed)
    }

    /// Whether the caller is inside a pfunc context.
    #[inline]
    pub fn in_pfunc_context() -> bool {
        Self::current_pri() >= 0
    }

    /// The pending-level bitmap. At quiescence this is zero.
    #[inline]
    pub fn pending_bitmap() -> usize {
        Traits::state().bitmap.load(Ordering::Relaxed)
    }

    /// Invoke `body` as a pfunc at `priority`: immediately if `priority`
    /// is above the running level, queued for later otherwise.
    pub fn call(priority: Priority, body: impl FnOnce() + Send + 'static) {
        let frame = new_frame("pfunc", body);
        // Safety: the frame was just allocated and is unowned.
        unsafe { Self::call_frame(frame, priority) }
    }

    /// Queue `body` for deferred invocation at `priority`, even if that
    /// level is above the running one. It runs at the next drain.
    pub fn later(priority: Priority, body: impl FnOnce() + Send + 'static) {
        let frame = new_frame("pfunc", body);
        // Safety: the frame was just allocated and is unowned.
        unsafe { Self::later_frame(frame, priority) }
    }

    /// Dispatch an invocation frame at `priority`.
    ///
    /// The comparison against the running level is unsigned, which makes
    /// [`PRI_BASE`] sort above every level: outside any pfunc context
    /// nothing runs inline. Instead the frame is queued and the platform
    /// is asked to enter the dispatch context (a software-interrupt post
    /// whose handler calls [`Self::resume`]).
    ///
    /// # Safety
    ///
    /// `frame` must be a live frame owned by the caller; ownership moves
    /// to the scheduler.
    pub(crate) unsafe fn call_frame(frame: *mut FrameHdr, priority: Priority) {
        Self::check_priority(priority);
        let state = Traits::state();
        let curpri = state.curpri.load(Ordering::Relaxed);

        if (priority as u32) > (curpri as u32) {
            // Preempt the caller: a plain nested call on the shared stack.
            state.curpri.store(priority, Ordering::Relaxed);
            // Safety: ownership of `frame` moves to the entry, which
            // frees it.
            unsafe { ((*frame).entry)(frame) };
            Self::restore_pri(curpri);
        } else {
            // Safety: forwarded ownership.
            unsafe { Self::later_frame(frame, priority) };
            if curpri == PRI_BASE {
                // Called from outside any pfunc context; have the
                // platform enter one.
                Traits::request_context();
            }
        }
    }

    /// Queue an invocation frame at `priority` without dispatching.
    ///
    /// # Safety
    ///
    /// As [`Self::call_frame`].
    pub(crate) unsafe fn later_frame(frame: *mut FrameHdr, priority: Priority) {
        Self::check_priority(priority);
        let state = Traits::state();
        unsafe {
            (*frame).next = ptr::null_mut();
        }
        Traits::preempt_probe();
        {
            // The tail pointer and the bitmap bit must change atomically
            // with respect to a preempting drain, or the drain could see
            // the bit set while the list still looks empty.
            let mut lock = klock::lock_int::<Traits>();
            if priority > state.maxpri.load(Ordering::Relaxed) {
                state.maxpri.store(priority, Ordering::Relaxed);
            }
            state.bitmap.fetch_or(1 << priority, Ordering::Relaxed);
            let queue = state.levels[priority as usize].write(&mut *lock);
            if queue.last.is_null() {
                queue.first = frame;
            } else {
                // Safety: `last` is the live tail of this level's chain.
                unsafe { (*queue.last).next = frame };
            }
            queue.last = frame;
        }
        Traits::preempt_probe();
    }

    /// Raise the running level to `priority` without building a frame, and
    /// return the previous level for [`Self::restore_pri`].
    ///
    /// This is the priority-ceiling primitive: until the matching restore,
    /// pfuncs at or below `priority` cannot run. Requesting a level below
    /// the current one is a contract violation (error 401).
    pub fn raise_pri(priority: Priority) -> Priority {
        let state = Traits::state();
        let prev = state.curpri.load(Ordering::Relaxed);
        if priority >= prev {
            state.curpri.store(priority, Ordering::Relaxed);
        } else {
            fatal::<Traits>(ErrorCode::InvalidRaisePri);
        }
        prev
    }

    /// Drop the running level back to `prev` and run every pending pfunc
    /// above it.
    pub fn restore_pri(prev: Priority) {
        Self::drain_above(prev);
    }

    /// The platform's dispatch-context entry: run everything pending above
    /// the preempted level. Called from the software-interrupt trampoline
    /// requested via [`Platform::request_context`].
    pub fn resume() {
        Self::drain_above(Self::current_pri());
    }

    /// Bracket the start of an interrupt service routine.
    ///
    /// The running level is parked one above the highest pfunc level, so
    /// every call the handler makes is deferred instead of running on the
    /// interrupt stack frame. The matching [`Self::interrupt_exit`]
    /// dispatches the deferred work in priority order.
    pub fn interrupt_enter() -> Priority {
        let state = Traits::state();
        let prev = state.curpri.load(Ordering::Relaxed);
        state
            .curpri
            .store(Traits::NUM_PRIORITY_LEVELS, Ordering::Relaxed);
        prev
    }

    /// Bracket the end of an interrupt service routine: restore the
    /// preempted level and run everything queued above it.
    pub fn interrupt_exit(prev: Priority) {
        Self::drain_above(prev);
    }

    /// Execute all pending frames above `prev`, then leave the running
    /// level at `prev`.
    fn drain_above(prev: Priority) {
        let state = Traits::state();

        // Drop the level first, then look. A preempting interrupt that
        // lands in between takes care of everything above `prev` on its
        // own exit path, so the hint read below may legitimately miss it.
        state.curpri.store(prev, Ordering::Relaxed);
        Traits::preempt_probe();
        let mut maxpri = state.maxpri.load(Ordering::Relaxed);
        Traits::preempt_probe();

        if maxpri <= prev {
            // Common case: nothing above us.
            return;
        }

        // There are, or recently were, higher frames to run. They may have
        // vanished in the meantime; the list re-reads below decide.
        loop {
            let level = &state.levels[maxpri as usize];
            state.curpri.store(maxpri, Ordering::Relaxed);
            Traits::preempt_probe();

            loop {
                // Detach the whole chain under the lock. It is now
                // exclusively ours; arrivals that preempt the walk start a
                // fresh chain (and in particular the tail frame cannot be
                // freed while the tail pointer still aims at it).
                let mut frame = {
                    let mut lock = klock::lock_int::<Traits>();
                    let queue = level.write(&mut *lock);
                    let first = queue.first;
                    queue.first = ptr::null_mut();
                    queue.last = ptr::null_mut();
                    first
                };
                if frame.is_null() {
                    break;
                }
                while !frame.is_null() {
                    Traits::preempt_probe();
                    // Read the link before the entry consumes the frame.
                    let next = unsafe { (*frame).next };
                    // Safety: we own the detached chain; the entry frees
                    // the frame.
                    unsafe { ((*frame).entry)(frame) };
                    Traits::preempt_probe();
                    frame = next;
                }
            }

            // Lower the level before retiring the bit, so the recomputed
            // maximum cannot be invalidated by whoever we preempt next.
            state.curpri.store(prev, Ordering::Relaxed);
            Traits::preempt_probe();

            let next_max = {
                let mut lock = klock::lock_int::<Traits>();
                let queue = level.write(&mut *lock);
                if !queue.first.is_null() {
                    // A preempting enqueue revived the level.
                    None
                } else {
                    state
                        .bitmap
                        .fetch_and(!(1usize << maxpri), Ordering::Relaxed);
                    let recomputed = msb(state.bitmap.load(Ordering::Relaxed));
                    // Never publish a hint below `prev`; preempting
                    // interrupts rely on it not under-shooting.
                    state
                        .maxpri
                        .store(recomputed.max(prev), Ordering::Relaxed);
                    Some(recomputed)
                }
            };
            Traits::preempt_probe();

            match next_max {
                // Drain the same level again.
                None => {}
                Some(m) if m <= prev => return,
                Some(m) => maxpri = m,
            }
        }
    }

    /// Out-of-range levels are a caller contract violation (error 400);
    /// release builds elide the check.
    #[inline]
    fn check_priority(priority: Priority) {
        if cfg!(debug_assertions)
            && (priority < 0
                || priority >= Traits::NUM_PRIORITY_LEVELS
                || Traits::NUM_PRIORITY_LEVELS as usize > MAX_PRIORITY_LEVELS)
        {
            fatal::<Traits>(ErrorCode::BadPriority);
        }
    }
}
