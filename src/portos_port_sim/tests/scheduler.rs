//! Scheduler dispatch semantics on the simulation port.
//!
//! Each test module mints its own port type, and with it its own kernel
//! instance, so the tests can run in parallel without sharing state.
use portos_kernel::{System, PRI_BASE};

mod immediate_preemption {
    use super::*;
    use std::sync::Mutex;

    portos_port_sim::use_sim!(unsafe struct K, levels = 8);
    type Sys = System<K>;

    static EVENTS: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

    /// A call from outside any pfunc context enters the dispatch context;
    /// a nested lower-priority call waits for its caller.
    #[test]
    fn run() {
        Sys::call(5, || {
            EVENTS.lock().unwrap().push("hi:enter");
            assert_eq!(Sys::current_pri(), 5);
            Sys::call(2, || {
                assert_eq!(Sys::current_pri(), 2);
                EVENTS.lock().unwrap().push("lo");
            });
            // 2 < 5: the call above was queued, not run.
            EVENTS.lock().unwrap().push("hi:exit");
        });
        assert_eq!(Sys::current_pri(), PRI_BASE);
        assert_eq!(*EVENTS.lock().unwrap(), ["hi:enter", "hi:exit", "lo"]);
    }
}

mod nested_higher_runs_inline {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    portos_port_sim::use_sim!(unsafe struct K, levels = 8);
    type Sys = System<K>;

    static RAN: AtomicBool = AtomicBool::new(false);

    /// From level 3, a call at level 7 preempts the caller on the spot.
    #[test]
    fn run() {
        Sys::call(3, || {
            Sys::call(7, || {
                assert_eq!(Sys::current_pri(), 7);
                RAN.store(true, Ordering::Relaxed);
            });
            assert!(RAN.load(Ordering::Relaxed), "level 7 must not wait");
            assert_eq!(Sys::current_pri(), 3);
        });
        assert_eq!(Sys::current_pri(), PRI_BASE);
    }
}

mod deferred_lower_waits {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    portos_port_sim::use_sim!(unsafe struct K, levels = 8);
    type Sys = System<K>;

    static LO_RAN: AtomicBool = AtomicBool::new(false);
    static HI_DONE: AtomicBool = AtomicBool::new(false);

    /// From level 7, a call at level 3 runs only after the level-7 pfunc
    /// returns.
    #[test]
    fn run() {
        Sys::call(7, || {
            Sys::call(3, || {
                assert!(HI_DONE.load(Ordering::Relaxed));
                LO_RAN.store(true, Ordering::Relaxed);
            });
            assert!(!LO_RAN.load(Ordering::Relaxed));
            HI_DONE.store(true, Ordering::Relaxed);
        });
        assert!(LO_RAN.load(Ordering::Relaxed));
    }
}

mod fifo_within_level {
    use super::*;
    use std::sync::Mutex;

    portos_port_sim::use_sim!(unsafe struct K, levels = 8);
    type Sys = System<K>;

    static ORDER: Mutex<Vec<u32>> = Mutex::new(Vec::new());

    #[test]
    fn run() {
        let prev = Sys::raise_pri(6);
        for tag in 0..4 {
            Sys::call(2, move || ORDER.lock().unwrap().push(tag));
        }
        assert!(ORDER.lock().unwrap().is_empty());
        Sys::restore_pri(prev);
        assert_eq!(*ORDER.lock().unwrap(), [0, 1, 2, 3]);
    }
}

mod strict_priority_across_levels {
    use super::*;
    use std::sync::Mutex;

    portos_port_sim::use_sim!(unsafe struct K, levels = 8);
    type Sys = System<K>;

    static ORDER: Mutex<Vec<i32>> = Mutex::new(Vec::new());

    #[test]
    fn run() {
        let prev = Sys::raise_pri(7);
        for pri in [2, 5, 3, 5, 1] {
            Sys::call(pri, move || ORDER.lock().unwrap().push(pri));
        }
        Sys::restore_pri(prev);
        assert_eq!(*ORDER.lock().unwrap(), [5, 5, 3, 2, 1]);
    }
}

mod priority_ceiling {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    portos_port_sim::use_sim!(unsafe struct K, levels = 8);
    type Sys = System<K>;

    static RAN: AtomicBool = AtomicBool::new(false);

    /// `raise_pri` holds back peers at or below the ceiling without
    /// building a frame.
    #[test]
    fn run() {
        let prev = Sys::raise_pri(6);
        assert_eq!(prev, PRI_BASE);
        assert_eq!(Sys::current_pri(), 6);
        Sys::call(5, || RAN.store(true, Ordering::Relaxed));
        assert!(!RAN.load(Ordering::Relaxed));
        Sys::restore_pri(prev);
        assert!(RAN.load(Ordering::Relaxed));
        assert_eq!(Sys::current_pri(), PRI_BASE);
    }
}

mod later_defers_even_higher {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    portos_port_sim::use_sim!(unsafe struct K, levels = 8);
    type Sys = System<K>;

    static RAN: AtomicBool = AtomicBool::new(false);

    #[test]
    fn run() {
        Sys::call(2, || {
            // `later` never dispatches, not even for a higher level.
            Sys::later(6, || RAN.store(true, Ordering::Relaxed));
            assert!(!RAN.load(Ordering::Relaxed));
            assert_ne!(Sys::pending_bitmap() & (1 << 6), 0);
        });
        // The deferred frame ran during the drain back to base.
        assert!(RAN.load(Ordering::Relaxed));
    }
}

mod quiescence {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    portos_port_sim::use_sim!(unsafe struct K, levels = 8);
    type Sys = System<K>;

    static COUNT: AtomicU32 = AtomicU32::new(0);

    /// After everything pending has drained, the bitmap is clean and the
    /// running level is back at base.
    #[test]
    fn run() {
        Sys::call(4, || {
            for pri in [1, 3, 3, 6, 2] {
                Sys::call(pri, || {
                    COUNT.fetch_add(1, Ordering::Relaxed);
                });
            }
            Sys::later(4, || {
                COUNT.fetch_add(1, Ordering::Relaxed);
            });
        });
        assert_eq!(COUNT.load(Ordering::Relaxed), 6);
        assert_eq!(Sys::current_pri(), PRI_BASE);
        assert_eq!(Sys::pending_bitmap(), 0);
        assert!(!Sys::in_pfunc_context());
    }
}

mod bad_priority_traps {
    use super::*;

    portos_port_sim::use_sim!(unsafe struct K, levels = 8);
    type Sys = System<K>;

    #[test]
    #[should_panic(expected = "portos error 400")]
    fn run() {
        Sys::call(8, || {});
    }
}

mod bad_raise_traps {
    use super::*;

    portos_port_sim::use_sim!(unsafe struct K, levels = 8);
    type Sys = System<K>;

    #[test]
    #[should_panic(expected = "portos error 401")]
    fn run() {
        Sys::call(5, || {
            Sys::raise_pri(2);
        });
    }
}
