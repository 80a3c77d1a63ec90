//! Queues: counting semaphores that gate pfunc entry.
//!
//! A queue admits at most `n_servers` pfuncs at a time. [`Queue::push`]
//! either takes a token and dispatches the pfunc right away, or files the
//! frame in a FIFO. A pfunc that finishes its guarded work calls
//! [`Queue::next`], which hands its token to the longest-waiting pfunc or,
//! with nobody waiting, returns it to the pool.
//!
//! Unlike signal groups, queues have no serialization level of their own:
//! the counter and the FIFO are guarded by the interrupt lock, so both
//! operations may be called from any context.
use alloc::boxed::Box;
use core::{fmt, marker::PhantomData};

use crate::{
    klock::{self, IntLockCell},
    list::{self, ListNode},
    pfunc::{new_frame, FrameHdr},
    Kernel, Priority, System,
};

/// A parked submission. `node` must stay the first field so FIFO nodes
/// cast back to their waiter.
#[repr(C)]
struct Waiter {
    node: ListNode,
    frame: *mut FrameHdr,
    priority: Priority,
}

/// Token counter and waiter FIFO, guarded by the interrupt lock.
struct QueueInner {
    /// Available tokens. `count > 0` means that many servers are idle.
    count: i32,
    /// Sentinel of the waiter FIFO. Self-linked once armed; both pointers
    /// null until first use (the sentinel cannot point at itself before
    /// the queue has its final address).
    waiters: ListNode,
}

// Safety: the FIFO nodes are heap waiters owned by the queue; the
// interrupt lock serializes every access.
unsafe impl Send for QueueInner {}

/// A counting semaphore over pfunc invocations. See the module
/// documentation.
pub struct Queue<Traits: Kernel> {
    n_servers: i32,
    inner: IntLockCell<Traits, QueueInner>,
    _marker: PhantomData<Traits>,
}

impl<Traits: Kernel> Queue<Traits> {
    /// Create a queue admitting `n_servers` simultaneous pfuncs.
    pub fn new(n_servers: i32) -> Self {
        debug_assert!(n_servers >= 1);
        Self {
            n_servers,
            inner: IntLockCell::new(QueueInner {
                count: n_servers,
                waiters: ListNode::UNLINKED,
            }),
            _marker: PhantomData,
        }
    }

    /// The number of simultaneous admissions.
    #[inline]
    pub fn n_servers(&self) -> i32 {
        self.n_servers
    }

    /// Submit `body` at `priority`. It is dispatched immediately if a
    /// server is free, and filed behind the earlier arrivals otherwise.
    pub fn push(&'static self, priority: Priority, body: impl FnOnce() + Send + 'static) {
        // Build the waiter up front; the critical section below must stay
        // O(1) and allocation-free.
        let waiter = Box::into_raw(Box::new(Waiter {
            node: ListNode::UNLINKED,
            frame: new_frame("queue.pfunc", body),
            priority,
        }));
        let admitted = {
            let mut lock = klock::lock_int::<Traits>();
            let inner = self.inner.write(&mut *lock);
            if inner.count > 0 {
                inner.count -= 1;
                true
            } else {
                unsafe {
                    arm(&mut inner.waiters);
                    list::push_tail(&mut inner.waiters, &mut (*waiter).node);
                }
                false
            }
        };
        if admitted {
            // Safety: the waiter never reached the FIFO, so it is still
            // exclusively ours.
            let waiter = unsafe { Box::from_raw(waiter) };
            let frame = waiter.frame;
            let priority = waiter.priority;
            drop(waiter);
            // Dispatch outside the lock; the pfunc may run inline here.
            // Safety: ownership of the frame moves to the scheduler.
            unsafe { System::<Traits>::call_frame(frame, priority) };
        }
    }

    /// Release a token. The longest-waiting submission, if any, is
    /// dispatched with it; otherwise the token returns to the pool.
    pub fn next(&'static self) {
        let released = {
            let mut lock = klock::lock_int::<Traits>();
            let inner = self.inner.write(&mut *lock);
            unsafe { arm(&mut inner.waiters) };
            if unsafe { !list::is_empty(&mut inner.waiters) } {
                let node = unsafe { list::pop_head(&mut inner.waiters) };
                Some(node.cast::<Waiter>())
            } else {
                inner.count += 1;
                debug_assert!(inner.count <= self.n_servers);
                None
            }
        };
        if let Some(waiter) = released {
            // Safety: the waiter was exclusively ours from the moment it
            // left the FIFO.
            let waiter = unsafe { Box::from_raw(waiter) };
            let frame = waiter.frame;
            let priority = waiter.priority;
            drop(waiter);
            // Safety: ownership of the frame moves to the scheduler.
            unsafe { System::<Traits>::call_frame(frame, priority) };
        }
    }
}

impl<Traits: Kernel> Drop for Queue<Traits> {
    fn drop(&mut self) {
        // Tear down submissions that never ran.
        let mut lock = klock::lock_int::<Traits>();
        let inner = self.inner.write(&mut *lock);
        if inner.waiters.next.is_null() {
            return;
        }
        unsafe {
            while !list::is_empty(&mut inner.waiters) {
                let node = list::pop_head(&mut inner.waiters);
                let waiter = Box::from_raw(node.cast::<Waiter>());
                ((*waiter.frame).drop_fn)(waiter.frame);
            }
        }
    }
}

impl<Traits: Kernel> fmt::Debug for Queue<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("n_servers", &self.n_servers)
            .finish_non_exhaustive()
    }
}

/// Self-link the FIFO sentinel on first use.
#[inline]
unsafe fn arm(sentinel: *mut ListNode) {
    unsafe {
        if (*sentinel).next.is_null() {
            list::init(sentinel);
        }
    }
}
