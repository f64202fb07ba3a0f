//! Thread registry.
//!
//! Every thread that touches a container in this crate must call
//! [`attach`] once, and [`detach`] before exiting (or before the thread
//! stops using any container, if it is reused for unrelated work
//! afterwards). Forgetting to `detach` leaks that slot's resources until
//! process exit. Rust *can* run code on thread exit via `thread_local!`
//! destructors, but this crate requires an explicit `detach()` call and
//! documents it as a precondition rather than relying on one, so that
//! reclamation state is never silently mutated from a destructor racing
//! other cleanup.
//!
//! A slot's lifecycle: free → attached (bound to exactly one live thread)
//! → free again after `detach` runs the slot's registered cleanup hooks.
//! SMR schemes ([`crate::hp`], [`crate::dhp`]) register their own
//! per-thread teardown (flushing retired batches, freeing guards) via
//! [`register_cleanup`] rather than the registry knowing about them.

use crate::error::{CdsError, Result};
use parking_lot::Mutex;
use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

/// Default slot capacity used if [`init`] is never called before the first
/// `attach`.
pub const DEFAULT_MAX_THREADS: usize = 128;

/// Opaque index identifying a registry slot. Stable for the lifetime of the
/// owning thread's attachment; may be recycled after `detach`.
pub type SlotId = usize;

const NO_OWNER: usize = usize::MAX;

struct Slot {
    owner: AtomicUsize,
    cleanups: Mutex<Vec<Box<dyn FnMut() + Send>>>,
}

impl Slot {
    fn new() -> Self {
        Self {
            owner: AtomicUsize::new(NO_OWNER),
            cleanups: Mutex::new(Vec::new()),
        }
    }
}

/// The process-wide thread registry. Constructed once, lazily or via
/// [`init`].
pub struct Registry {
    slots: Vec<Slot>,
    free: Mutex<Vec<SlotId>>,
    next_thread_id: AtomicUsize,
}

impl Registry {
    fn new(capacity: usize) -> Self {
        let slots = (0..capacity).map(|_| Slot::new()).collect();
        let free = Mutex::new((0..capacity).rev().collect());
        Self {
            slots,
            free,
            next_thread_id: AtomicUsize::new(0),
        }
    }

    /// Total number of slots this registry was sized with.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

static REGISTRY: OnceLock<Registry> = OnceLock::new();

thread_local! {
    static CURRENT_SLOT: Cell<Option<SlotId>> = Cell::new(None);
}

/// Initializes the process-wide thread registry with room for `max_threads`
/// concurrently attached threads. Must be called before any thread calls
/// [`attach`] to take effect; a later call, or omitting the call entirely,
/// falls back to [`DEFAULT_MAX_THREADS`].
pub fn init(max_threads: usize) {
    let _ = REGISTRY.set(Registry::new(max_threads));
}

/// Returns the global registry, lazily creating it with
/// [`DEFAULT_MAX_THREADS`] capacity if [`init`] was never called.
pub fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| Registry::new(DEFAULT_MAX_THREADS))
}

/// Binds the calling thread to a registry slot, allocating one if this is
/// the thread's first call. Idempotent: a thread that is already attached
/// gets back its existing slot.
///
/// # Errors
///
/// Returns [`CdsError::RegistryExhausted`] if every slot is already taken
/// by other concurrently attached threads, rather than panicking. Size the
/// registry via [`init`] to the true maximum thread count to avoid this in
/// practice.
pub fn attach() -> Result<SlotId> {
    CURRENT_SLOT.with(|cell| {
        if let Some(slot_id) = cell.get() {
            return Ok(slot_id);
        }

        let reg = registry();
        let slot_id = reg.free.lock().pop().ok_or(CdsError::RegistryExhausted)?;

        let thread_id = reg.next_thread_id.fetch_add(1, Ordering::Relaxed) + 1;
        reg.slots[slot_id].owner.store(thread_id, Ordering::Release);
        cell.set(Some(slot_id));
        tracing::debug!(slot = slot_id, thread = thread_id, "thread attached");
        Ok(slot_id)
    })
}

/// Releases the calling thread's slot, running every cleanup hook
/// registered via [`register_cleanup`] first (in registration order). A
/// no-op if the calling thread is not attached.
pub fn detach() {
    CURRENT_SLOT.with(|cell| {
        let Some(slot_id) = cell.take() else {
            return;
        };

        let reg = registry();
        let mut cleanups = reg.slots[slot_id].cleanups.lock();
        for hook in cleanups.iter_mut() {
            hook();
        }
        cleanups.clear();
        drop(cleanups);

        reg.slots[slot_id].owner.store(NO_OWNER, Ordering::Release);
        reg.free.lock().push(slot_id);
        tracing::debug!(slot = slot_id, "thread detached");
    });
}

/// Returns the calling thread's slot, or [`CdsError::NotAttached`] if it
/// has not called [`attach`].
pub fn current() -> Result<SlotId> {
    CURRENT_SLOT
        .with(|cell| cell.get())
        .ok_or(CdsError::NotAttached)
}

/// Registers a cleanup hook to run on the calling thread's slot when it
/// next calls [`detach`]. Used by SMR schemes to flush a thread's retired
/// batch or release its guards without the registry needing to know their
/// concrete types.
pub fn register_cleanup<F>(hook: F) -> Result<()>
where
    F: FnMut() + Send + 'static,
{
    let slot_id = current()?;
    registry().slots[slot_id].cleanups.lock().push(Box::new(hook));
    Ok(())
}
