//! Interrupt-lock state cells.
//!
//! The scheduler's shared lists and the queue counters may only be touched
//! while preemption is masked. [`IntLockCell`] makes that discipline
//! compile-checked: the contents are only reachable through an
//! [`IntLockToken`], and the sole way to obtain a token is [`lock_int`],
//! which masks preemption for the lifetime of the returned guard.
//!
//! Every kernel critical section is a leaf: it is O(1), contains no
//! preemption probes, and never calls back into code that could take the
//! lock again. `lock_int` relies on that invariant; it must not be called
//! while a guard is alive.
use core::ops;

use tokenlock::UnsyncTokenLock;

use crate::{utils::Init, Platform};

pub struct IntLockTag<Traits>(Traits);

/// The key that "unlocks" [`IntLockCell`].
pub(crate) type IntLockToken<Traits> = tokenlock::UnsyncSingletonToken<IntLockTag<Traits>>;

/// The keyhole type for [`UnsyncTokenLock`] that can be "unlocked" by
/// [`IntLockToken`].
pub(crate) type IntLockKeyhole<Traits> = tokenlock::SingletonTokenId<IntLockTag<Traits>>;

/// Cell type that can be accessed by [`IntLockToken`] (which can be
/// obtained by [`lock_int`]).
pub struct IntLockCell<Traits, T: ?Sized>(UnsyncTokenLock<T, IntLockKeyhole<Traits>>);

impl<Traits, T> IntLockCell<Traits, T> {
    pub(crate) const fn new(x: T) -> Self {
        Self(UnsyncTokenLock::new(<IntLockKeyhole<Traits> as Init>::INIT, x))
    }
}

impl<Traits, T: Init> Init for IntLockCell<Traits, T> {
    const INIT: Self = Self(Init::INIT);
}

impl<Traits, T> ops::Deref for IntLockCell<Traits, T> {
    type Target = UnsyncTokenLock<T, IntLockKeyhole<Traits>>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Mask preemption and get an RAII guard whose token unlocks
/// [`IntLockCell`]s.
///
/// Calling this while another guard is alive would mint a second token for
/// the same singleton. The leaf-section invariant described in the module
/// documentation is what rules that out.
#[inline]
pub(crate) fn lock_int<Traits: Platform>() -> IntLockGuard<Traits> {
    // Safety: the matching `interrupt_restore` is issued by the guard's
    // `Drop` with the state saved here.
    let state = unsafe { Traits::interrupt_disable() };
    IntLockGuard {
        // Safety: preemption is now masked and, per the leaf-section
        // invariant, no other guard (and hence no other token) exists.
        token: unsafe { IntLockToken::new_unchecked() },
        state,
    }
}

/// RAII guard for a masked-preemption section.
///
/// [`IntLockToken`] can be borrowed from this type.
pub(crate) struct IntLockGuard<Traits: Platform> {
    token: IntLockToken<Traits>,
    state: usize,
}

impl<Traits: Platform> Drop for IntLockGuard<Traits> {
    fn drop(&mut self) {
        // Safety: `state` was produced by the `interrupt_disable` call that
        // created this guard.
        unsafe {
            Traits::interrupt_restore(self.state);
        }
    }
}

impl<Traits: Platform> ops::Deref for IntLockGuard<Traits> {
    type Target = IntLockToken<Traits>;
    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl<Traits: Platform> ops::DerefMut for IntLockGuard<Traits> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.token
    }
}
