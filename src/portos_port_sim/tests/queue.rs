//! Queue admission and fairness on the simulation port.
use once_cell::sync::Lazy;
use portos_kernel::{Queue, System, PRI_BASE};

mod single_server_fifo {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Mutex;

    portos_port_sim::use_sim!(unsafe struct K, levels = 8);
    type Sys = System<K>;

    static QUEUE: Lazy<Queue<K>> = Lazy::new(|| Queue::new(1));
    static ORDER: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());
    static IN_FLIGHT: AtomicI32 = AtomicI32::new(0);
    static PEAK: AtomicI32 = AtomicI32::new(0);

    fn serve(name: &'static str, queue: &'static Queue<K>) -> impl FnOnce() + Send + 'static {
        move || {
            let now = IN_FLIGHT.fetch_add(1, Ordering::Relaxed) + 1;
            PEAK.fetch_max(now, Ordering::Relaxed);
            ORDER.lock().unwrap().push(name);
            IN_FLIGHT.fetch_sub(1, Ordering::Relaxed);
            queue.next();
        }
    }

    /// One server: admissions happen strictly one at a time, waiters run
    /// in arrival order on release, regardless of their priorities.
    #[test]
    fn run() {
        let queue: &'static Queue<K> = &QUEUE;
        let prev = Sys::raise_pri(7);
        queue.push(2, serve("f1", queue));
        queue.push(5, serve("f2", queue));
        queue.push(3, serve("f3", queue));
        assert!(ORDER.lock().unwrap().is_empty());
        Sys::restore_pri(prev);

        assert_eq!(*ORDER.lock().unwrap(), ["f1", "f2", "f3"]);
        assert_eq!(PEAK.load(Ordering::Relaxed), 1);
        assert_eq!(IN_FLIGHT.load(Ordering::Relaxed), 0);
        assert_eq!(Sys::current_pri(), PRI_BASE);
        assert_eq!(Sys::pending_bitmap(), 0);
    }
}

mod token_pool_refills {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    portos_port_sim::use_sim!(unsafe struct K, levels = 8);
    type Sys = System<K>;

    static QUEUE: Lazy<Queue<K>> = Lazy::new(|| Queue::new(1));
    static RUNS: AtomicI32 = AtomicI32::new(0);

    /// A release with nobody waiting returns the token, and a later push
    /// takes it straight away.
    #[test]
    fn run() {
        let queue: &'static Queue<K> = &QUEUE;
        queue.push(2, move || {
            RUNS.fetch_add(1, Ordering::Relaxed);
            queue.next();
        });
        assert_eq!(RUNS.load(Ordering::Relaxed), 1);
        queue.push(2, move || {
            RUNS.fetch_add(1, Ordering::Relaxed);
            queue.next();
        });
        assert_eq!(RUNS.load(Ordering::Relaxed), 2);
        assert_eq!(Sys::pending_bitmap(), 0);
    }
}

mod two_servers_admit_two {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Mutex;

    portos_port_sim::use_sim!(unsafe struct K, levels = 8);
    type Sys = System<K>;

    static QUEUE: Lazy<Queue<K>> = Lazy::new(|| Queue::new(2));
    static ORDER: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());
    static HOLDING: AtomicI32 = AtomicI32::new(0);
    static PEAK: AtomicI32 = AtomicI32::new(0);

    /// Two servers: the first two submissions are admitted without a
    /// release; the third waits for one.
    #[test]
    fn run() {
        let queue: &'static Queue<K> = &QUEUE;
        let prev = Sys::raise_pri(7);
        for name in ["a", "b", "c"] {
            queue.push(3, move || {
                let now = HOLDING.fetch_add(1, Ordering::Relaxed) + 1;
                PEAK.fetch_max(now, Ordering::Relaxed);
                ORDER.lock().unwrap().push(name);
                HOLDING.fetch_sub(1, Ordering::Relaxed);
            });
        }
        Sys::restore_pri(prev);

        // "a" and "b" hold the two tokens; "c" is parked.
        assert_eq!(*ORDER.lock().unwrap(), ["a", "b"]);
        queue.next();
        assert_eq!(*ORDER.lock().unwrap(), ["a", "b", "c"]);
        assert!(PEAK.load(Ordering::Relaxed) <= 2);
        assert_eq!(Sys::pending_bitmap(), 0);
    }
}

mod release_dispatches_at_waiter_priority {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    portos_port_sim::use_sim!(unsafe struct K, levels = 8);
    type Sys = System<K>;

    static QUEUE: Lazy<Queue<K>> = Lazy::new(|| Queue::new(1));
    static SEEN_PRI: AtomicI32 = AtomicI32::new(-2);

    /// A waiter released from a lower level preempts it, like any call at
    /// a higher priority.
    #[test]
    fn run() {
        let queue: &'static Queue<K> = &QUEUE;
        // Take the only token and park a high-priority waiter.
        let prev = Sys::raise_pri(7);
        queue.push(1, || {});
        queue.push(6, || {
            SEEN_PRI.store(Sys::current_pri(), Ordering::Relaxed);
        });
        Sys::restore_pri(prev);
        // The level-1 pfunc ran and kept the token; the waiter is parked.
        assert_eq!(SEEN_PRI.load(Ordering::Relaxed), -2);

        Sys::call(2, move || {
            queue.next();
            // 6 > 2: the waiter ran inline during `next`.
            assert_eq!(SEEN_PRI.load(Ordering::Relaxed), 6);
        });
        assert_eq!(Sys::current_pri(), PRI_BASE);
    }
}
