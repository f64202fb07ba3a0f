//! Dynamic hazard pointers (pass-the-buck): a hazard-pointer variant where
//! guards are allocated from a shared pool rather than fixed one-per-slot,
//! so a thread can hold as many outstanding guards as it needs at once.
//!
//! The guard pool and its batched refill are grounded on
//! `cds/gc/dhp/dhp.h`'s `guard_allocator` (a global free list behind a
//! lock, refilled in blocks to amortize lock acquisition); the
//! epoch-tagged reclamation bucket is grounded on `stacc_lockfree_ebr.rs`'s
//! four-bucket `limbo` array, generalized from a single node type to the
//! crate's type-erased [`crate::retired::RetiredPtr`]. Each bucket is
//! itself a lock-free intrusive stack built on [`crate::treiber`]'s
//! push/pop CAS loop rather than a `Mutex`-guarded `Vec`: the guard pool's
//! free list is the one place this scheme names a lock as acceptable, and
//! retired storage should not borrow that exception.
//!
//! # Epoch tagging
//!
//! Every retired record is stamped with the epoch active at retire time. A
//! scan only reclaims records at least two epochs behind the current one,
//! and only if no published guard anywhere still holds their address. This
//! prevents the scan itself from racing a guard allocated and published
//! concurrently with the scan: such a guard cannot have protected anything
//! retired before the *previous* epoch boundary, so it is guaranteed
//! visible no later than the epoch after next.

use crate::error::Result;
use crate::registry;
use crate::retired::RetiredPtr;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::OnceLock;

const EPOCH_BUCKETS: usize = 4;

/// Default number of outstanding retired records across all epoch buckets
/// before [`retire`] forces a scan.
pub const DEFAULT_RETIRE_THRESHOLD: usize = 64;

/// Tuning knobs for the DHP guard pool.
#[derive(Clone, Copy, Debug)]
pub struct DhpConfig {
    /// Guards moved between the global free list and a thread's local free
    /// list per refill, amortizing the spinlock/mutex acquisition so
    /// allocation never blocks on more than an O(1) list split.
    guard_batch_size: usize,
    /// Total retired records outstanding (summed over every epoch bucket)
    /// before a [`retire`] call triggers a scan.
    retire_threshold: usize,
}

impl DhpConfig {
    pub fn new() -> Self {
        Self {
            guard_batch_size: 16,
            retire_threshold: DEFAULT_RETIRE_THRESHOLD,
        }
    }

    pub fn with_guard_batch_size(mut self, n: usize) -> Self {
        assert!(n >= 1);
        self.guard_batch_size = n;
        self
    }

    pub fn with_retire_threshold(mut self, n: usize) -> Self {
        assert!(n >= 1);
        self.retire_threshold = n;
        self
    }
}

impl Default for DhpConfig {
    fn default() -> Self {
        Self::new()
    }
}

struct GuardNode {
    protected: AtomicPtr<()>,
    next_allocated: AtomicPtr<GuardNode>,
}

struct GarbageNode {
    record: RetiredPtr,
    next: AtomicPtr<GarbageNode>,
}

/// A lock-free intrusive stack of retired records for one epoch bucket.
/// `push`/`push_node` follow [`crate::treiber`]'s CAS-loop idiom; `take_all`
/// detaches the whole chain in a single swap so a scan never holds a lock
/// over the O(n) walk that follows.
struct GarbageStack {
    head: AtomicPtr<GarbageNode>,
}

impl GarbageStack {
    fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn push_node(&self, node: *mut GarbageNode) {
        loop {
            let head = self.head.load(Ordering::Acquire);
            // SAFETY: `node` is not reachable from any other thread until
            // the compare_exchange below publishes it.
            unsafe { (*node).next.store(head, Ordering::Relaxed) };
            if self
                .head
                .compare_exchange_weak(head, node, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    fn push(&self, record: RetiredPtr) {
        let node = Box::into_raw(Box::new(GarbageNode {
            record,
            next: AtomicPtr::new(ptr::null_mut()),
        }));
        self.push_node(node);
    }

    /// Detaches every node currently on the stack in one O(1) swap, handing
    /// ownership of the whole chain to the caller.
    fn take_all(&self) -> *mut GarbageNode {
        self.head.swap(ptr::null_mut(), Ordering::AcqRel)
    }
}

impl Drop for GarbageStack {
    fn drop(&mut self) {
        let mut cur = *self.head.get_mut();
        while !cur.is_null() {
            // SAFETY: `&mut self` proves exclusive access to the chain.
            let boxed = unsafe { Box::from_raw(cur) };
            cur = boxed.next.load(Ordering::Relaxed);
            // SAFETY: the domain is being torn down; nothing can still
            // hold a hazard on a record it owns.
            unsafe { boxed.record.reclaim() };
        }
    }
}

struct Domain {
    allocated_head: AtomicPtr<GuardNode>,
    global_free: Mutex<Vec<*mut GuardNode>>,
    global_epoch: AtomicUsize,
    garbage: [GarbageStack; EPOCH_BUCKETS],
    pending: AtomicUsize,
    guard_batch_size: usize,
    retire_threshold: usize,
}

// SAFETY: `GuardNode` pointers are heap-allocated once and never freed for
// the life of the process (the allocated list is append-only); every
// field accessed across threads is an atomic, and `global_free` is behind
// a lock, so sharing raw `*mut GuardNode` between threads through `Domain`
// is sound.
unsafe impl Send for Domain {}
unsafe impl Sync for Domain {}

impl Domain {
    fn new(config: DhpConfig) -> Self {
        Self {
            allocated_head: AtomicPtr::new(ptr::null_mut()),
            global_free: Mutex::new(Vec::new()),
            global_epoch: AtomicUsize::new(0),
            garbage: [
                GarbageStack::new(),
                GarbageStack::new(),
                GarbageStack::new(),
                GarbageStack::new(),
            ],
            pending: AtomicUsize::new(0),
            guard_batch_size: config.guard_batch_size,
            retire_threshold: config.retire_threshold,
        }
    }

    fn new_node(&self) -> *mut GuardNode {
        let node = Box::into_raw(Box::new(GuardNode {
            protected: AtomicPtr::new(ptr::null_mut()),
            next_allocated: AtomicPtr::new(ptr::null_mut()),
        }));

        loop {
            let head = self.allocated_head.load(Ordering::Acquire);
            // SAFETY: `node` was just allocated and is not yet reachable
            // from any other thread.
            unsafe { (*node).next_allocated.store(head, Ordering::Relaxed) };
            if self
                .allocated_head
                .compare_exchange_weak(head, node, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return node;
            }
        }
    }

    /// Drains up to `guard_batch_size` guards from the global free list,
    /// topping up with freshly allocated nodes if the global list was
    /// short.
    fn refill_batch(&self) -> Vec<*mut GuardNode> {
        let mut global = self.global_free.lock();
        let take = self.guard_batch_size.min(global.len());
        let split_at = global.len() - take;
        let mut batch: Vec<*mut GuardNode> = global.split_off(split_at);
        drop(global);

        while batch.len() < self.guard_batch_size {
            batch.push(self.new_node());
        }
        batch
    }

    fn snapshot_guards(&self) -> Vec<*const ()> {
        let mut v = Vec::new();
        let mut cur = self.allocated_head.load(Ordering::Acquire);
        while !cur.is_null() {
            // SAFETY: nodes on the allocated list are never freed or
            // moved.
            let node = unsafe { &*cur };
            let protected = node.protected.load(Ordering::SeqCst);
            if !protected.is_null() {
                v.push(protected as *const ());
            }
            cur = node.next_allocated.load(Ordering::Acquire);
        }
        v.sort_unstable();
        v
    }

    /// Buffers `record` in the current epoch's bucket, returning the total
    /// number of records outstanding across every bucket afterward.
    fn retire(&self, record: RetiredPtr) -> usize {
        let epoch = self.global_epoch.load(Ordering::SeqCst);
        self.garbage[epoch % EPOCH_BUCKETS].push(record);
        self.pending.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn scan(&self) {
        let epoch = self.global_epoch.load(Ordering::SeqCst);
        let target_bucket = epoch.wrapping_sub(2) % EPOCH_BUCKETS;
        let bucket = &self.garbage[target_bucket];

        let mut cur = bucket.take_all();
        if cur.is_null() {
            self.global_epoch.fetch_add(1, Ordering::SeqCst);
            return;
        }

        let hazardous = self.snapshot_guards();
        let mut reclaimed = 0usize;
        while !cur.is_null() {
            let node = cur;
            // SAFETY: `node` came from `take_all`, which transferred
            // exclusive ownership of the chain to this scan; reading its
            // `next`/`record` fields before deciding its fate is sound.
            let next = unsafe { (*node).next.load(Ordering::Relaxed) };
            let address = unsafe { (*node).record.address() };
            if hazardous.binary_search(&address).is_ok() {
                bucket.push_node(node);
            } else {
                // SAFETY: `address` is absent from the snapshot of every
                // currently published guard, taken after the record had
                // already aged past the retire-to-scan epoch gap.
                let boxed = unsafe { Box::from_raw(node) };
                unsafe { boxed.record.reclaim() };
                reclaimed += 1;
            }
            cur = next;
        }
        if reclaimed > 0 {
            self.pending.fetch_sub(reclaimed, Ordering::Relaxed);
        }
        self.global_epoch.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(epoch, reclaimed, "dhp scan");
    }
}

static DOMAIN: OnceLock<Domain> = OnceLock::new();

/// Initializes the global DHP domain. Process-wide, must be called before
/// any thread allocates a guard to take effect.
pub fn init(config: DhpConfig) {
    let _ = DOMAIN.set(Domain::new(config));
}

fn domain() -> &'static Domain {
    DOMAIN.get_or_init(|| Domain::new(DhpConfig::default()))
}

thread_local! {
    static FREE_LIST: RefCell<Vec<*mut GuardNode>> = RefCell::new(Vec::new());
    static CLEANUP_REGISTERED: std::cell::Cell<bool> = std::cell::Cell::new(false);
}

fn ensure_cleanup_registered() {
    CLEANUP_REGISTERED.with(|flag| {
        if flag.get() {
            return;
        }
        flag.set(true);
        // On detach, hand this thread's locally-cached free guards back to
        // the global pool rather than stranding them.
        let _ = registry::register_cleanup(|| {
            let local = FREE_LIST.with(|fl| std::mem::take(&mut *fl.borrow_mut()));
            if !local.is_empty() {
                domain().global_free.lock().extend(local);
            }
        });
    });
}

/// A guard drawn from the global pool, owned by the thread that allocated
/// it. Dropping it clears the protected pointer and returns the guard to
/// the thread's local free list — no global synchronization needed on the
/// common path.
pub struct Guard {
    node: *mut GuardNode,
}

impl Guard {
    /// Publishes `ptr` in this guard.
    pub fn set(&self, ptr: *mut ()) {
        // SAFETY: `node` is a permanently-allocated entry on the domain's
        // allocated list.
        unsafe { (*self.node).protected.store(ptr, Ordering::SeqCst) };
    }

    /// Clears the guard without releasing it back to the pool.
    pub fn clear(&self) {
        unsafe { (*self.node).protected.store(ptr::null_mut(), Ordering::Release) };
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        self.clear();
        FREE_LIST.with(|fl| fl.borrow_mut().push(self.node));
    }
}

/// Allocates a guard: pops from the thread's local free list, refilling
/// from the global pool (or allocating fresh nodes) if it is empty. Never
/// blocks permanently — the only lock taken is the global free list's, and
/// only for the O(1) work of splitting off a batch.
///
/// # Errors
///
/// Returns [`crate::error::CdsError::NotAttached`] if the calling thread
/// has not called [`crate::registry::attach`].
pub fn alloc_guard() -> Result<Guard> {
    registry::current()?;
    ensure_cleanup_registered();

    let node = FREE_LIST.with(|fl| {
        let mut local = fl.borrow_mut();
        if let Some(node) = local.pop() {
            return node;
        }
        drop(local);
        let mut batch = domain().refill_batch();
        let node = batch.pop().expect("refill_batch always returns at least one node");
        fl.borrow_mut().extend(batch);
        node
    });

    Ok(Guard { node })
}

/// Explicit counterpart to letting a [`Guard`] drop.
pub fn free_guard(guard: Guard) {
    drop(guard);
}

/// Publishes and validates a load from `location`, analogous to
/// [`crate::hp::protect`] but for a dynamically allocated guard.
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

/// Buffers `boxed` for epoch-gated reclamation, triggering a scan once the
/// total number of outstanding retired records crosses the domain's
/// configured `retire_threshold`.
pub fn retire<T>(boxed: Box<T>) -> Result<()> {
    registry::current()?;
    let dom = domain();
    let pending = dom.retire(RetiredPtr::from_box(boxed));
    if pending >= dom.retire_threshold {
        dom.scan();
    }
    Ok(())
}

/// Runs one reclamation scan and advances the global epoch.
pub fn force_scan() -> Result<()> {
    registry::current()?;
    domain().scan();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry;
    use std::sync::atomic::{AtomicUsize, Ordering as O};
    use std::sync::Arc;

    #[test]
    fn guard_protects_across_epoch_gap() {
        registry::attach().unwrap();

        struct Counted(Arc<AtomicUsize>);
        impl Drop for Counted {
            fn drop(&mut self) {
                self.0.fetch_add(1, O::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let raw = Box::into_raw(Box::new(Counted(Arc::clone(&drops))));
        let location: AtomicPtr<Counted> = AtomicPtr::new(raw);

        let guard = alloc_guard().unwrap();
        let protected = protect(&guard, &location);
        assert_eq!(protected, raw);

        retire(unsafe { Box::from_raw(raw) }).unwrap();
        for _ in 0..4 {
            force_scan().unwrap();
        }
        assert_eq!(drops.load(O::SeqCst), 0, "still protected across epoch gap");

        free_guard(guard);
        for _ in 0..4 {
            force_scan().unwrap();
        }
        assert_eq!(drops.load(O::SeqCst), 1);

        registry::detach();
    }

    #[test]
    fn guards_are_recycled_from_the_free_list() {
        registry::attach().unwrap();
        let g1 = alloc_guard().unwrap();
        let node1 = g1.node;
        drop(g1);
        let g2 = alloc_guard().unwrap();
        assert_eq!(node1, g2.node, "freed guard should be reused before allocating a new one");
        drop(g2);
        registry::detach();
    }
}
