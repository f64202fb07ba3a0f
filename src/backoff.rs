//! Pluggable back-off / wait strategies.
//!
//! Every spinning protocol in this crate (HP scans, DHP guard allocation,
//! the Treiber stack, the Michael and Lazy lists) takes its back-off
//! strategy as a type parameter or a boxed trait object rather than hard
//! coding `std::hint::spin_loop`. The flat-combining kernel additionally
//! needs a *park-based* wait for a combiner response, which is a distinct
//! capability ([`WaitStrategy`]) from busy-spinning ([`Backoff`]) — a thread
//! waiting on a combiner is not making progress on its own, so parking is
//! appropriate in a way it would not be for a lock-free CAS retry loop.

use parking_lot::{Condvar, Mutex};
use std::hint;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// A retry-loop back-off strategy.
///
/// Implementors are cheap to construct and are typically recreated at the
/// top of every retry loop; `spin` is called once per failed attempt.
pub trait Backoff: Default {
    /// Performs one unit of back-off. Called after a failed CAS or a failed
    /// validation, before retrying.
    fn spin(&mut self);

    /// Resets any accumulated state (e.g. the exponential strategy's current
    /// delay) back to its initial value. Called at the start of a fresh
    /// logical operation.
    fn reset(&mut self) {}
}

/// Never waits; the caller retries immediately. Appropriate only when
/// contention is expected to be vanishingly brief.
#[derive(Default)]
pub struct Empty;

impl Backoff for Empty {
    fn spin(&mut self) {}
}

/// Issues a single CPU "spin" hint (`PAUSE` on x86, `YIELD` on ARM) per
/// retry. The default choice for lock-free retry loops in this crate.
#[derive(Default)]
pub struct Pause;

impl Backoff for Pause {
    fn spin(&mut self) {
        hint::spin_loop();
    }
}

/// Yields the current thread's remaining timeslice to the scheduler.
#[derive(Default)]
pub struct Yield;

impl Backoff for Yield {
    fn spin(&mut self) {
        thread::yield_now();
    }
}

/// Spins with a doubling number of `PAUSE` hints, bounded below and above.
pub struct Exponential {
    min: u32,
    max: u32,
    cur: u32,
}

impl Exponential {
    pub fn new(min: u32, max: u32) -> Self {
        assert!(min >= 1 && min <= max);
        Self { min, max, cur: min }
    }
}

impl Default for Exponential {
    fn default() -> Self {
        Self::new(4, 1024)
    }
}

impl Backoff for Exponential {
    fn spin(&mut self) {
        for _ in 0..self.cur {
            hint::spin_loop();
        }
        self.cur = (self.cur * 2).min(self.max);
    }

    fn reset(&mut self) {
        self.cur = self.min;
    }
}

/// Sleeps a fixed duration per retry, taking a [`Duration`] directly rather
/// than committing to a fixed unit like microseconds or iteration count.
pub struct DelayOfN(pub Duration);

impl Default for DelayOfN {
    fn default() -> Self {
        Self(Duration::from_micros(50))
    }
}

impl Backoff for DelayOfN {
    fn spin(&mut self) {
        thread::sleep(self.0);
    }
}

/// Park-based waiting used by a flat-combining waiter that has lost the
/// combiner election and must wait for the combiner to service its
/// publication record.
///
/// Unlike [`Backoff`], a `WaitStrategy` instance is shared (it owns the
/// synchronization primitive woken threads block on) rather than owned
/// per-retry.
pub trait WaitStrategy: Send + Sync {
    /// Prepares to wait: called by the waiter immediately before checking
    /// whether its condition has already become true, to avoid a lost
    /// wakeup race.
    fn prepare(&self) {}

    /// Blocks the calling thread until [`WaitStrategy::notify`] is called,
    /// or `deadline` elapses. Returns `true` if woken, `false` on timeout.
    fn wait(&self, deadline: Option<Instant>) -> bool;

    /// Wakes exactly one waiter (used by the combiner after servicing a
    /// single record).
    fn wakeup_one(&self);

    /// Wakes every waiter (used after a combiner pass completes, to let
    /// losers re-contend for the combiner lock).
    fn wakeup_all(&self);
}

/// A single mutex/condvar pair shared by every waiter on a kernel instance.
/// Matches the source's `single_mutex_single_condvar` wait strategy: simple,
/// but every notify wakes every waiter regardless of which record
/// completed.
pub struct SingleMutexCondvar {
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl Default for SingleMutexCondvar {
    fn default() -> Self {
        Self {
            mutex: Mutex::new(()),
            condvar: Condvar::new(),
        }
    }
}

impl WaitStrategy for SingleMutexCondvar {
    fn wait(&self, deadline: Option<Instant>) -> bool {
        let mut guard = self.mutex.lock();
        match deadline {
            None => {
                self.condvar.wait(&mut guard);
                true
            }
            Some(when) => {
                let now = Instant::now();
                if when <= now {
                    return false;
                }
                !self.condvar.wait_for(&mut guard, when - now).timed_out()
            }
        }
    }

    fn wakeup_one(&self) {
        self.condvar.notify_one();
    }

    fn wakeup_all(&self) {
        self.condvar.notify_all();
    }
}

/// A condvar private to a single publication record, paired with a flag so
/// spurious wakeups and late notifications are never lost. Matches the
/// source's per-thread `single_mutex_multi_condvar` record strategy: only
/// the thread that owns the record is ever woken by its notify.
pub struct PerRecordCondvar {
    mutex: Mutex<bool>,
    condvar: Condvar,
    woken: AtomicBool,
}

impl Default for PerRecordCondvar {
    fn default() -> Self {
        Self {
            mutex: Mutex::new(false),
            condvar: Condvar::new(),
            woken: AtomicBool::new(false),
        }
    }
}

impl WaitStrategy for PerRecordCondvar {
    fn prepare(&self) {
        self.woken.store(false, Ordering::Release);
    }

    fn wait(&self, deadline: Option<Instant>) -> bool {
        if self.woken.load(Ordering::Acquire) {
            return true;
        }
        let mut guard = self.mutex.lock();
        while !*guard {
            match deadline {
                None => self.condvar.wait(&mut guard),
                Some(when) => {
                    let now = Instant::now();
                    if when <= now {
                        return false;
                    }
                    if self.condvar.wait_for(&mut guard, when - now).timed_out() {
                        return *guard;
                    }
                }
            }
        }
        true
    }

    fn wakeup_one(&self) {
        self.woken.store(true, Ordering::Release);
        let mut guard = self.mutex.lock();
        *guard = true;
        self.condvar.notify_one();
    }

    fn wakeup_all(&self) {
        self.wakeup_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles_and_clamps() {
        let mut b = Exponential::new(1, 4);
        assert_eq!(b.cur, 1);
        b.spin();
        assert_eq!(b.cur, 2);
        b.spin();
        assert_eq!(b.cur, 4);
        b.spin();
        assert_eq!(b.cur, 4);
        b.reset();
        assert_eq!(b.cur, 1);
    }

    #[test]
    fn per_record_condvar_wakes_waiter() {
        use std::sync::Arc;
        let ws = Arc::new(PerRecordCondvar::default());
        ws.prepare();
        let ws2 = Arc::clone(&ws);
        let handle = thread::spawn(move || {
            ws2.wakeup_one();
        });
        assert!(ws.wait(None));
        handle.join().unwrap();
    }
}
