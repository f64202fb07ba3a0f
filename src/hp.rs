//! Hazard pointers: a safe-memory-reclamation scheme where a reader
//! publishes the address it is about to dereference before dereferencing
//! it, and a reclaimer checks every published address before freeing
//! anything.
//!
//! Grounded on `stacc_lockfree_hp.rs`'s bounded `[AtomicPtr<Node<T>>;
//! MAX_THREADS]` hazard table and scan loop, generalized from one hazard
//! slot per thread to a configurable number of slots per thread, and from
//! a single container's retired list to a shared, type-erased
//! [`crate::retired::RetiredBatch`] any container can retire through. The
//! untyped `AtomicPtr<()>` hazard cells follow the `Hazard`/`Protected`
//! split in `oliver-giersch-hazptr`'s hazard module: the domain does not
//! need to know what type a hazard protects, only its address.
//!
//! # Contract
//!
//! 1. A reader publishes a pointer in one of its [`Guard`]s via [`protect`]
//!    (store, then re-validate the source location — loop until stable).
//! 2. The reader may dereference the pointer until it drops the guard.
//! 3. [`retire`] buffers a pointer a thread has unlinked.
//! 4. Once a thread's retired batch exceeds the configured threshold, it
//!    scans every hazard cell of every thread and reclaims the retired
//!    pointers absent from that snapshot.

use crate::error::{CdsError, Result};
use crate::registry::{self, SlotId};
use crate::retired::{RetiredBatch, RetiredPtr};
use parking_lot::Mutex;
use std::cell::RefCell;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::OnceLock;

/// Default hazard slots per thread.
pub const DEFAULT_HAZARDS_PER_THREAD: usize = 8;

/// Tuning knobs for the hazard-pointer domain, collected into a single
/// value constructed through a builder.
#[derive(Clone, Copy, Debug)]
pub struct HpConfig {
    max_threads: usize,
    hazards_per_thread: usize,
    retire_threshold: usize,
}

impl HpConfig {
    pub fn new() -> Self {
        let max_threads = registry::DEFAULT_MAX_THREADS;
        let hazards_per_thread = DEFAULT_HAZARDS_PER_THREAD;
        Self {
            max_threads,
            hazards_per_thread,
            retire_threshold: 2 * max_threads * hazards_per_thread,
        }
    }

    pub fn with_max_threads(mut self, n: usize) -> Self {
        self.max_threads = n;
        self
    }

    pub fn with_hazards_per_thread(mut self, k: usize) -> Self {
        self.hazards_per_thread = k;
        self
    }

    pub fn with_retire_threshold(mut self, r: usize) -> Self {
        self.retire_threshold = r;
        self
    }
}

impl Default for HpConfig {
    fn default() -> Self {
        Self::new()
    }
}

struct Domain {
    hazards: Vec<Box<[AtomicPtr<()>]>>,
    retired: Vec<Mutex<RetiredBatch>>,
    hazards_per_thread: usize,
    retire_threshold: usize,
}

impl Domain {
    fn new(config: HpConfig) -> Self {
        let hazards = (0..config.max_threads)
            .map(|_| {
                (0..config.hazards_per_thread)
                    .map(|_| AtomicPtr::new(std::ptr::null_mut()))
                    .collect::<Vec<_>>()
                    .into_boxed_slice()
            })
            .collect();
        let retired = (0..config.max_threads)
            .map(|_| Mutex::new(RetiredBatch::new()))
            .collect();

        Self {
            hazards,
            retired,
            hazards_per_thread: config.hazards_per_thread,
            retire_threshold: config.retire_threshold,
        }
    }

    fn snapshot(&self) -> Vec<*const ()> {
        let mut v: Vec<*const ()> = self
            .hazards
            .iter()
            .flat_map(|row| row.iter())
            .map(|h| h.load(Ordering::SeqCst) as *const ())
            .filter(|p| !p.is_null())
            .collect();
        v.sort_unstable();
        v
    }

    fn scan(&self, slot: SlotId) {
        let snapshot = self.snapshot();
        let mut batch = self.retired[slot].lock();
        let before = batch.len();
        // SAFETY: `snapshot` is a sequentially-consistent read of every
        // hazard cell taken immediately before the scan; any pointer not in
        // it cannot become hazardous again because hazard publication
        // always precedes the validating reload in `protect`.
        unsafe {
            batch.scan(|addr| snapshot.binary_search(&addr).is_ok());
        }
        let after = batch.len();
        tracing::debug!(slot, reclaimed = before - after, retained = after, "hp scan");
    }
}

static DOMAIN: OnceLock<Domain> = OnceLock::new();

/// Initializes the global hazard-pointer domain. Process-wide, must be
/// called before any thread attaches to take effect; a redundant call (or
/// omitting it) falls back to [`HpConfig::default`].
pub fn init(config: HpConfig) {
    let _ = DOMAIN.set(Domain::new(config));
}

fn domain() -> &'static Domain {
    DOMAIN.get_or_init(|| Domain::new(HpConfig::default()))
}

thread_local! {
    static IN_USE: RefCell<Vec<bool>> = RefCell::new(Vec::new());
    static CLEANUP_REGISTERED: std::cell::Cell<bool> = std::cell::Cell::new(false);
}

fn ensure_cleanup_registered(slot: SlotId) {
    CLEANUP_REGISTERED.with(|flag| {
        if flag.get() {
            return;
        }
        flag.set(true);
        // Best-effort: shrink this slot's retired batch before the slot is
        // recycled, so a new owner does not inherit an unbounded backlog.
        let _ = registry::register_cleanup(move || domain().scan(slot));
    });
}

/// A single published hazard slot, owned by the thread that acquired it.
/// Dropping the guard clears its hazard cell (relaxed: the owning thread is
/// now solely responsible for the formerly-protected memory).
pub struct Guard {
    slot: SlotId,
    index: usize,
}

impl Guard {
    /// Acquires a free hazard slot for the calling thread.
    ///
    /// # Errors
    ///
    /// Returns [`CdsError::NotAttached`] if the calling thread has not
    /// called [`crate::registry::attach`], and
    /// [`CdsError::OutOfHazardSlots`] if it already holds
    /// `hazards_per_thread` guards simultaneously.
    pub fn acquire() -> Result<Self> {
        let slot = registry::current()?;
        ensure_cleanup_registered(slot);
        let dom = domain();

        IN_USE.with(|cell| {
            let mut in_use = cell.borrow_mut();
            if in_use.is_empty() {
                in_use.resize(dom.hazards_per_thread, false);
            }
            let index = in_use
                .iter()
                .position(|used| !used)
                .ok_or(CdsError::OutOfHazardSlots)?;
            in_use[index] = true;
            Ok(Self { slot, index })
        })
    }

    /// Publishes `ptr` in this hazard slot. Uses `SeqCst` for the store
    /// because the validating reload after it must observe every prior
    /// publication, exactly as `stacc_lockfree_hp`'s own comment on this
    /// store explains — weaker orderings admit a reorder that lets a
    /// concurrent `retire` miss the publication.
    pub fn set(&self, ptr: *mut ()) {
        domain().hazards[self.slot][self.index].store(ptr, Ordering::SeqCst);
    }

    /// Clears this hazard slot, relinquishing protection of whatever it
    /// held.
    pub fn clear(&self) {
        domain().hazards[self.slot][self.index].store(std::ptr::null_mut(), Ordering::Release);
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        self.clear();
        IN_USE.with(|cell| {
            cell.borrow_mut()[self.index] = false;
        });
    }
}

/// Publishes and validates a load from `location`: publishes the current
/// value in `guard`, re-reads `location`, and retries until the published
/// value matches the freshest read. Packages the publish-then-validate
/// protocol as a single helper so every caller gets it right.
pub fn protect<T>(guard: &Guard, location: &AtomicPtr<T>) -> *mut T {
    let mut ptr = location.load(Ordering::Acquire);
    loop {
        guard.set(ptr as *mut ());
        let current = location.load(Ordering::SeqCst);
        if current == ptr {
            return ptr;
        }
        ptr = current;
    }
}

/// Buffers `boxed` for reclamation once no hazard slot anywhere protects
/// it, triggering a scan if the calling thread's retired batch has grown
/// past the configured threshold.
pub fn retire<T>(boxed: Box<T>) -> Result<()> {
    let slot = registry::current()?;
    ensure_cleanup_registered(slot);
    let dom = domain();
    let record = RetiredPtr::from_box(boxed);

    let len = {
        let mut batch = dom.retired[slot].lock();
        batch.push(record);
        batch.len()
    };

    if len >= dom.retire_threshold {
        dom.scan(slot);
    }
    Ok(())
}

/// Forces an immediate scan of the calling thread's retired batch, without
/// waiting for the threshold. Exposed for tests and for callers that want
/// deterministic reclamation at a quiescent point.
pub fn force_scan() -> Result<()> {
    let slot = registry::current()?;
    domain().scan(slot);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry;
    use std::sync::atomic::{AtomicUsize, Ordering as O};
    use std::sync::Arc;

    #[test]
    fn retire_is_deferred_while_hazardous_and_freed_once_cleared() {
        registry::attach().unwrap();

        struct Counted(Arc<AtomicUsize>);
        impl Drop for Counted {
            fn drop(&mut self) {
                self.0.fetch_add(1, O::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let boxed = Box::new(Counted(Arc::clone(&drops)));
        let raw: *mut Counted = Box::into_raw(boxed);
        let location: AtomicPtr<Counted> = AtomicPtr::new(raw);

        let guard = Guard::acquire().unwrap();
        let protected = protect(&guard, &location);
        assert_eq!(protected, raw);

        // Retire while still hazardous: must not be reclaimed yet.
        retire(unsafe { Box::from_raw(raw) }).unwrap();
        force_scan().unwrap();
        assert_eq!(drops.load(O::SeqCst), 0, "still protected, must not be freed");

        drop(guard);
        force_scan().unwrap();
        assert_eq!(drops.load(O::SeqCst), 1, "no longer protected, must be freed");

        registry::detach();
    }

    #[test]
    fn out_of_hazard_slots_is_reported() {
        registry::attach().unwrap();
        let config_guards = DEFAULT_HAZARDS_PER_THREAD;
        let mut guards = Vec::new();
        for _ in 0..config_guards {
            guards.push(Guard::acquire().unwrap());
        }
        match Guard::acquire() {
            Err(CdsError::OutOfHazardSlots) => {}
            other => panic!("expected OutOfHazardSlots, got {:?}", other.is_ok()),
        }
        drop(guards);
        registry::detach();
    }
}
