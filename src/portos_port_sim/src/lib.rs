//! Simulation environment for running the Portos kernel on a hosted
//! target.
//!
//! Everything runs on the host's one thread. "Interrupts" are delivered
//! at the kernel's preemption probes by [`SimCtl`]: at every probe, a
//! registered handler fires with a configurable probability, reentering
//! the kernel exactly where a hardware interrupt could have. The
//! interrupt-disable state is a plain nesting counter that the probe
//! respects, and the context request is served by calling the kernel's
//! resume entry inline, standing in for a software-interrupt post.
//!
//! [`use_sim!`] mints a port type: the trait impls, the kernel state
//! static, and a [`SimCtl`] of its own. Every invocation creates a fully
//! independent kernel instance, so each test (or binary) can own one:
//!
//! ```
//! portos_port_sim::use_sim!(unsafe struct SimKernel, levels = 8);
//!
//! type Sys = portos_port_sim::portos_kernel::System<SimKernel>;
//!
//! fn main() {
//!     Sys::call(3, || {});
//!     assert_eq!(Sys::current_pri(), portos_port_sim::portos_kernel::PRI_BASE);
//! }
//! ```
pub use portos_kernel;

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use spin::Mutex;

/// Deterministic xorshift generator used to pace interrupt injection.
/// Shareable; state advances with relaxed atomics, which is exact on the
/// simulation's single thread.
pub struct SimRng(AtomicU64);

impl SimRng {
    pub const fn new(seed: u64) -> Self {
        Self(AtomicU64::new(if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed }))
    }

    pub fn reseed(&self, seed: u64) {
        self.0
            .store(if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed }, Ordering::Relaxed);
    }

    pub fn next(&self) -> u64 {
        let mut x = self.0.load(Ordering::Relaxed);
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0.store(x, Ordering::Relaxed);
        x
    }

    /// A sample from `lo..hi`.
    pub fn uniform(&self, lo: i32, hi: i32) -> i32 {
        debug_assert!(lo < hi);
        lo + (self.next() % (hi - lo) as u64) as i32
    }
}

/// The simulated interrupt controller backing one port type.
///
/// The handler registered with [`set_handler`](Self::set_handler) plays
/// the part of every interrupt service routine at once. It runs only when
/// injection is enabled, interrupts are not masked, and no handler is
/// already running (the simulation does not nest interrupts).
pub struct SimCtl {
    /// Interrupt-disable nesting depth; nonzero masks delivery.
    depth: AtomicU32,
    in_handler: AtomicBool,
    enabled: AtomicBool,
    /// Probability, in percent, of delivery at each probe.
    percent: AtomicU32,
    rng: SimRng,
    handler: Mutex<Option<Box<dyn FnMut() + Send>>>,
}

impl SimCtl {
    pub const fn new() -> Self {
        Self {
            depth: AtomicU32::new(0),
            in_handler: AtomicBool::new(false),
            enabled: AtomicBool::new(false),
            percent: AtomicU32::new(1),
            rng: SimRng::new(0),
            handler: Mutex::new(None),
        }
    }

    /// Mask delivery, returning the previous nesting depth.
    pub fn interrupt_disable(&self) -> usize {
        self.depth.fetch_add(1, Ordering::Relaxed) as usize
    }

    /// Restore the nesting depth saved by
    /// [`interrupt_disable`](Self::interrupt_disable).
    pub fn interrupt_restore(&self, state: usize) {
        self.depth.store(state as u32, Ordering::Relaxed);
    }

    /// Install the interrupt handler.
    pub fn set_handler(&self, handler: impl FnMut() + Send + 'static) {
        *self.handler.lock() = Some(Box::new(handler));
    }

    pub fn clear_handler(&self) {
        *self.handler.lock() = None;
    }

    /// Turn injection on or off.
    pub fn enable_interrupts(&self, on: bool) {
        self.enabled.store(on, Ordering::Relaxed);
    }

    /// Set the per-probe delivery probability, in percent.
    pub fn set_fire_percent(&self, percent: u32) {
        self.percent.store(percent, Ordering::Relaxed);
    }

    pub fn seed(&self, seed: u64) {
        self.rng.reseed(seed);
    }

    pub fn rng(&self) -> &SimRng {
        &self.rng
    }

    /// Decide whether an interrupt fires at this probe. On `true` the
    /// caller owns a delivery: it brackets the kernel's interrupt
    /// reentry, calls [`run_handler`](Self::run_handler), and finishes
    /// with [`end_interrupt`](Self::end_interrupt). The simulation does
    /// not nest deliveries.
    pub fn poll_interrupt(&self) -> bool {
        if !self.enabled.load(Ordering::Relaxed)
            || self.depth.load(Ordering::Relaxed) != 0
            || self.in_handler.load(Ordering::Relaxed)
        {
            return false;
        }
        if self.rng.uniform(0, 100) as u32 >= self.percent.load(Ordering::Relaxed) {
            return false;
        }
        !self.in_handler.swap(true, Ordering::Relaxed)
    }

    /// Run the registered handler once.
    pub fn run_handler(&self) {
        // Take the handler out for the duration of the call so the
        // handler's own kernel activity cannot deadlock on the slot.
        let handler = self.handler.lock().take();
        if let Some(mut f) = handler {
            log::trace!("delivering simulated interrupt");
            f();
            let mut slot = self.handler.lock();
            if slot.is_none() {
                *slot = Some(f);
            }
        }
    }

    /// Close the delivery claimed by [`poll_interrupt`](Self::poll_interrupt).
    pub fn end_interrupt(&self) {
        self.in_handler.store(false, Ordering::Relaxed);
    }
}

impl Default for SimCtl {
    fn default() -> Self {
        Self::new()
    }
}

/// Initialize test logging. Safe to call more than once.
pub fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Define a simulation port type.
///
/// The macro defines `$SystemTraits`, implements the kernel's port traits
/// for it, and gives it a dedicated kernel state and [`SimCtl`]
/// (reachable as `$SystemTraits::sim()`). The `unsafe` keyword is a
/// reminder that the expansion contains `unsafe impl`s whose soundness
/// rests on the one-port-type-per-invocation rule.
#[macro_export]
macro_rules! use_sim {
    (unsafe $vis:vis struct $SystemTraits:ident, levels = $levels:expr) => {
        $vis struct $SystemTraits;

        mod sim_port_impl {
            use super::$SystemTraits;
            use $crate::portos_kernel::{
                utils::Init, ErrorCode, KernelCfg, KernelState, KernelStatic, Platform, Priority,
                System,
            };

            static CTL: $crate::SimCtl = $crate::SimCtl::new();
            static STATE: KernelState<$SystemTraits> = Init::INIT;

            impl KernelCfg for $SystemTraits {
                const NUM_PRIORITY_LEVELS: Priority = $levels;
            }

            unsafe impl Platform for $SystemTraits {
                unsafe fn interrupt_disable() -> usize {
                    CTL.interrupt_disable()
                }

                unsafe fn interrupt_restore(state: usize) {
                    CTL.interrupt_restore(state)
                }

                fn request_context() {
                    // Enter the dispatch context inline, standing in for a
                    // software-interrupt post.
                    System::<$SystemTraits>::resume()
                }

                fn error_trap(code: ErrorCode) -> ! {
                    panic!("portos error {}", code)
                }

                fn preempt_probe() {
                    if CTL.poll_interrupt() {
                        // Interrupt reentry: park the level above every
                        // pfunc so the handler's calls defer, then
                        // dispatch what it queued on the way out.
                        let prev = System::<$SystemTraits>::interrupt_enter();
                        CTL.run_handler();
                        System::<$SystemTraits>::interrupt_exit(prev);
                        CTL.end_interrupt();
                    }
                }
            }

            unsafe impl KernelStatic for $SystemTraits {
                fn state() -> &'static KernelState<$SystemTraits> {
                    &STATE
                }
            }

            impl $SystemTraits {
                /// The simulated interrupt controller driving this kernel.
                pub fn sim() -> &'static $crate::SimCtl {
                    &CTL
                }
            }
        }
    };
}
