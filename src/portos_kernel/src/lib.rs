//! The Portos kernel: a cooperative, priority-preemptive real-time kernel
//! built around *priority functions* (pfuncs).
//!
//! A pfunc is a short, run-to-completion work item tagged with an integer
//! priority. There is exactly one stack: a pfunc invoked with a priority
//! higher than the running level executes immediately as a nested call,
//! preempting its caller; otherwise it is queued and runs once the level
//! drops. "Waiting" never blocks. Instead, a pfunc is attached to one of
//! the kernel services, which holds its invocation frame until a release
//! condition fires:
//!
//!  - [`SignalGroup`] releases attached pfuncs when a matching integer
//!    event is posted;
//!  - [`Clock`] is a signal group keyed by a monotonic tick counter,
//!    turning attachments into timers;
//!  - [`Queue`] is a counting semaphore that admits at most `n_servers`
//!    pfuncs at a time and releases the rest in FIFO order.
//!
//! # Ports
//!
//! The kernel is generic over a *port*, the type that binds it to an
//! execution environment. A port implements [`Platform`] (critical
//! sections, the context request, the error trap) and [`KernelStatic`]
//! (storage for the singleton [`KernelState`]). The blanket [`Kernel`]
//! trait combines them and is what the kernel modules bound on.
//!
//! All kernel entry points are associated functions of [`System`]`<Traits>`
//! so that one program can host several independent kernel instances, each
//! with its own port type.
#![cfg_attr(not(test), no_std)] // Link `std` only when building a test (`cfg(test)`)

extern crate alloc;

pub mod clock;
pub mod error;
pub(crate) mod hash;
pub(crate) mod klock;
pub(crate) mod list;
pub mod pfunc;
pub mod queue;
pub mod signal;
pub mod utils;

pub use self::{
    clock::Clock,
    error::ErrorCode,
    pfunc::KernelState,
    queue::Queue,
    signal::{SignalGroup, SignalHandle},
};

use core::marker::PhantomData;

/// A priority level, or [`PRI_BASE`].
///
/// Valid levels are `0..NUM_PRIORITY_LEVELS`, higher value meaning higher
/// priority.
pub type Priority = i32;

/// The sentinel priority meaning "no priority function is running".
pub const PRI_BASE: Priority = -1;

/// The hard upper bound on priority levels. The pending-level bitmap is a
/// single machine word, one bit per level.
pub const MAX_PRIORITY_LEVELS: usize = usize::BITS as usize;

/// Numeric configuration of a kernel instance.
pub trait KernelCfg: 'static + Sized {
    /// The number of priority levels, at most [`MAX_PRIORITY_LEVELS`].
    const NUM_PRIORITY_LEVELS: Priority;
}

/// Implemented by a port. Binds the kernel to an execution environment:
/// interrupt masking, the deferred-context request, and the terminal error
/// trap.
///
/// # Safety
///
/// Implementing this trait is unsafe because the kernel's critical sections
/// are only sound if `interrupt_disable` really prevents preemption until
/// the matching `interrupt_restore`. These methods are only meant to be
/// called by the kernel.
pub unsafe trait Platform: KernelCfg {
    /// Disable preemption and return the previous mask state. Nestable.
    ///
    /// # Safety
    ///
    /// The caller must pass the returned state to a matching
    /// [`interrupt_restore`](Self::interrupt_restore) call.
    unsafe fn interrupt_disable() -> usize;

    /// Restore the preemption mask saved by
    /// [`interrupt_disable`](Self::interrupt_disable).
    ///
    /// # Safety
    ///
    /// `state` must come from the matching `interrupt_disable` call.
    unsafe fn interrupt_restore(state: usize);

    /// Request that the platform call [`System::resume`] from its
    /// priority-function trampoline, commonly by posting a software
    /// interrupt. Invoked when work is queued from outside any pfunc
    /// context.
    fn request_context();

    /// Terminal error handler. Receives the numeric code so host-side
    /// tooling can decode it.
    fn error_trap(code: error::ErrorCode) -> !;

    /// A point at which the environment may deliver pending interrupts.
    ///
    /// The kernel calls this at every spot where it can tolerate
    /// preemption. Hardware ports leave it empty (interrupts arrive on
    /// their own); the simulation port uses it to inject interrupts at
    /// randomized points.
    #[inline]
    fn preempt_probe() {}
}

/// Provides the kernel with its singleton state.
///
/// A port defines `static STATE: KernelState<PortTy> = Init::INIT;` and
/// returns a reference to it here.
///
/// # Safety
///
/// `state` must return the same object on every call, and that object must
/// not be accessed except through the kernel.
pub unsafe trait KernelStatic: Platform {
    fn state() -> &'static KernelState<Self>;
}

/// The combined bound the kernel modules use. Automatically implemented.
pub trait Kernel: KernelStatic {}
impl<T: KernelStatic> Kernel for T {}

/// The facade through which all kernel operations are invoked.
///
/// `Traits` is the port type. See the crate documentation for the overall
/// model and [`pfunc`] for the scheduler entry points.
pub struct System<Traits>(PhantomData<Traits>);
