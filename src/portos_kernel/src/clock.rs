//! Clocks and timers, a thin layer over signal groups.
//!
//! A clock is a monotonic counter wired to its own [`SignalGroup`], keyed
//! by time. [`Clock::tick`] advances the counter by one and posts the new
//! value, releasing every pfunc scheduled for that instant. A timer is
//! nothing but an attachment to a future tick value; cancellation and
//! status checks are the signal-handle primitives under other names.
//!
//! Several clocks can coexist, for instance one counting frames and a
//! finer one counting slots. Tick values may wrap: the group's index
//! orders keys by wrap-around comparison.
use core::{
    fmt,
    sync::atomic::{AtomicI32, Ordering},
};

use crate::{signal::SignalGroup, Kernel, Priority, SignalHandle};

/// A handle on a pending timer.
pub type TimerHandle = SignalHandle;

/// A monotonic counter posting a signal per tick. See the module
/// documentation.
pub struct Clock<Traits: Kernel> {
    time: AtomicI32,
    group: SignalGroup<Traits>,
}

impl<Traits: Kernel> Clock<Traits> {
    /// Create a clock whose delivery bodies run at `priority`, spreading
    /// timers over `hash_size` buckets.
    ///
    /// With a power-of-two `hash_size` any tick value is valid; otherwise
    /// time is confined to `0..hash_size`.
    pub fn new(priority: Priority, hash_size: i32) -> Self {
        Self {
            time: AtomicI32::new(0),
            group: SignalGroup::new(priority, hash_size),
        }
    }

    /// The current time.
    #[inline]
    pub fn get(&self) -> i32 {
        self.time.load(Ordering::Relaxed)
    }

    /// Advance time by one and run every timer that just expired.
    pub fn tick(&'static self) {
        let now = self.get().wrapping_add(1);
        self.time.store(now, Ordering::Relaxed);
        self.group.post(now);
    }

    /// Set the time, usually to wrap it back to zero, and run the timers
    /// of the new instant.
    ///
    /// This must not stand in for repeated ticks: jumping the counter by
    /// two skips the timers of the instant jumped over. Call
    /// [`tick`](Self::tick) twice instead.
    pub fn set(&'static self, time: i32) {
        self.time.store(time, Ordering::Relaxed);
        self.group.post(time);
    }

    /// Schedule `body` to run as a pfunc at `priority` when the clock
    /// reaches `time`. Without a handle the timer cannot be cancelled.
    pub fn at(&'static self, time: i32, priority: Priority, body: impl FnOnce() + Send + 'static) {
        self.group.attach(time, priority, body);
    }

    /// As [`at`](Self::at), also binding `handle` for cancellation and
    /// status checks.
    pub fn at_h(
        &'static self,
        time: i32,
        priority: Priority,
        handle: &'static TimerHandle,
        body: impl FnOnce() + Send + 'static,
    ) {
        self.group.attach_h(time, priority, handle, body);
    }

    /// Cancel a timer. A rename of [`SignalHandle::detach`].
    #[inline]
    pub fn cancel(handle: &TimerHandle) {
        handle.detach();
    }

    /// Whether a timer is still pending. A rename of
    /// [`SignalHandle::is_active`].
    #[inline]
    pub fn is_active(handle: &TimerHandle) -> bool {
        handle.is_active()
    }

    /// The underlying signal group.
    #[inline]
    pub fn group(&self) -> &SignalGroup<Traits> {
        &self.group
    }
}

impl<Traits: Kernel> fmt::Debug for Clock<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clock")
            .field("time", &self.get())
            .field("group", &self.group)
            .finish()
    }
}
