//! Flat-combining kernel.
//!
//! Generalizes the swap-array idea in `stacc.rs` (`AtomicPush`/`AtomicPop`
//! plus `swap_stacks` behind a single `Mutex<()>`) from one hard-coded
//! stack shape to an arbitrary sequential container: a thread publishes an
//! operation into its publication record and either becomes the combiner
//! (applying every thread's pending operation against the wrapped
//! container in one critical section) or waits for whichever thread does.
//! The publication-list bookkeeping — two singly linked lists (`active`,
//! `allocated`), the compaction bitmask, and the `current_age -
//! record_age > compact_factor` eviction test — follows
//! `cds/algo/flat_combining/kernel.h` directly.
//!
//! A single global mutex stands in for the combiner election; whichever
//! thread takes it runs the passes, exactly as `stacc.rs`'s `swap_lock`
//! elects one thread to perform `swap_stacks` while everyone else waits on
//! the same lock.

use crate::backoff::{PerRecordCondvar, WaitStrategy};
use crate::registry;
use parking_lot::Mutex;
use std::cell::{RefCell, UnsafeCell};
use std::collections::HashMap;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, AtomicUsize, Ordering};

/// A sequential container a [`Kernel`] turns concurrent. `Op` is the
/// request/response payload: the combiner mutates it in place, so the
/// caller's input doubles as the eventual output (mirroring the source's
/// single `request` field that carries both the invocation parameters and
/// the result).
pub trait FlatCombinable {
    type Op;

    /// Applies one pending operation. Called by the combiner, which holds
    /// exclusive access to `self` for the duration of the whole pass.
    fn apply(&mut self, op: &mut Self::Op);

    /// Applies every operation collected from one sweep of the active
    /// list. The default simply calls [`FlatCombinable::apply`] on each;
    /// override when operations can be collided against each other (e.g. a
    /// deque pairing `push_back`/`pop_front`).
    fn process_batch(&mut self, ops: &mut [&mut Self::Op]) {
        for op in ops {
            self.apply(op);
        }
    }
}

/// Tuning knobs for a [`Kernel`].
#[derive(Clone, Copy, Debug)]
pub struct FcConfig {
    pass_count: usize,
    compact_mask: usize,
}

impl FcConfig {
    pub fn new() -> Self {
        Self {
            pass_count: 8,
            compact_mask: Self::mask_from_factor(1024),
        }
    }

    fn mask_from_factor(factor: usize) -> usize {
        factor.next_power_of_two().max(1) - 1
    }

    pub fn with_combine_pass_count(mut self, n: usize) -> Self {
        assert!(n >= 1);
        self.pass_count = n;
        self
    }

    /// Rounded down to the nearest power of two.
    pub fn with_compact_factor(mut self, factor: usize) -> Self {
        self.compact_mask = Self::mask_from_factor(factor);
        self
    }
}

impl Default for FcConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum RecState {
    Inactive = 0,
    Active = 1,
    Removed = 2,
}

impl From<u8> for RecState {
    fn from(v: u8) -> Self {
        match v {
            0 => RecState::Inactive,
            1 => RecState::Active,
            _ => RecState::Removed,
        }
    }
}

const NO_OP: usize = 0;

struct Record<Op> {
    state: AtomicU8,
    age: AtomicUsize,
    op_id: AtomicUsize,
    response_ready: AtomicBool,
    payload: UnsafeCell<MaybeUninit<Op>>,
    wait: PerRecordCondvar,
    next_active: AtomicPtr<Record<Op>>,
    next_allocated: AtomicPtr<Record<Op>>,
}

// SAFETY: `payload` is written by the owning thread only while
// `op_id == NO_OP` (i.e. before publishing), and subsequently touched only
// by whichever thread holds the kernel's combiner lock, which is unique
// system-wide; the owner does not read it again until `response_ready` is
// observed `true` with `Acquire`, which happens-after the combiner's
// `Release` store.
unsafe impl<Op: Send> Send for Record<Op> {}
unsafe impl<Op: Send> Sync for Record<Op> {}

impl<Op> Record<Op> {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(RecState::Active as u8),
            age: AtomicUsize::new(0),
            op_id: AtomicUsize::new(NO_OP),
            response_ready: AtomicBool::new(false),
            payload: UnsafeCell::new(MaybeUninit::uninit()),
            wait: PerRecordCondvar::default(),
            next_active: AtomicPtr::new(ptr::null_mut()),
            next_allocated: AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn state(&self) -> RecState {
        RecState::from(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, s: RecState) {
        self.state.store(s as u8, Ordering::Release);
    }

    fn publish(&self, op_id: usize, payload: Op) {
        debug_assert_ne!(op_id, NO_OP);
        // SAFETY: the owner is the only writer while `op_id == NO_OP`.
        unsafe { (*self.payload.get()).write(payload) };
        self.response_ready.store(false, Ordering::Release);
        self.wait.prepare();
        self.op_id.store(op_id, Ordering::Release);
        if self.state() != RecState::Active {
            self.set_state(RecState::Active);
        }
    }

    fn pending_op_id(&self) -> usize {
        self.op_id.load(Ordering::Acquire)
    }

    fn is_response_ready(&self) -> bool {
        self.response_ready.load(Ordering::Acquire)
    }

    /// Invoked only by the combiner: applies `f` to the record's payload
    /// and marks the response ready, then wakes the owner.
    fn service(&self, f: impl FnOnce(&mut Op)) {
        // SAFETY: only the thread holding the kernel's combiner lock calls
        // this, and only for records whose `op_id != NO_OP`.
        let slot = unsafe { &mut *self.payload.get() };
        f(unsafe { slot.assume_init_mut() });
        self.op_id.store(NO_OP, Ordering::Relaxed);
        self.response_ready.store(true, Ordering::Release);
        self.wait.wakeup_one();
    }

    fn take_response(&self) -> Op {
        // SAFETY: the owner only calls this after observing
        // `response_ready == true`, which happens-after the combiner's
        // `service` wrote the result and released the slot back to it.
        unsafe { (*self.payload.get()).assume_init_read() }
    }
}

impl<Op> Drop for Record<Op> {
    fn drop(&mut self) {
        if self.pending_op_id() != NO_OP && !self.is_response_ready() {
            // SAFETY: dropping implies no other thread holds a reference
            // to this record (it has been unlinked from both lists), so a
            // payload written but never serviced is still ours to drop.
            unsafe { (*self.payload.get()).assume_init_drop() };
        }
    }
}

/// Opaque handle to a thread's publication record, obtained from
/// [`Kernel::acquire`] and consumed by [`Kernel::operation_done`]/
/// [`Kernel::release_record`].
pub struct RecordHandle<Op> {
    rec: *mut Record<Op>,
}

/// A flat-combining kernel wrapping a sequential container `C`.
pub struct Kernel<C: FlatCombinable> {
    container: Mutex<C>,
    combiner_lock: Mutex<()>,
    active_head: AtomicPtr<Record<C::Op>>,
    allocated_head: AtomicPtr<Record<C::Op>>,
    age: AtomicUsize,
    config: FcConfig,
    kernel_id: usize,
}

static NEXT_KERNEL_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    static RECORDS: RefCell<HashMap<usize, *mut ()>> = RefCell::new(HashMap::new());
}

impl<C: FlatCombinable> Kernel<C> {
    pub fn new(container: C, config: FcConfig) -> Self {
        Self {
            container: Mutex::new(container),
            combiner_lock: Mutex::new(()),
            active_head: AtomicPtr::new(ptr::null_mut()),
            allocated_head: AtomicPtr::new(ptr::null_mut()),
            age: AtomicUsize::new(0),
            config,
            kernel_id: NEXT_KERNEL_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    fn new_record(&self) -> *mut Record<C::Op> {
        let rec = Box::into_raw(Box::new(Record::new()));

        loop {
            let head = self.allocated_head.load(Ordering::Acquire);
            unsafe { (*rec).next_allocated.store(head, Ordering::Relaxed) };
            if self
                .allocated_head
                .compare_exchange_weak(head, rec, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
        self.link_active(rec);

        // Best-effort: if the calling thread participates in the
        // crate-wide registry, mark this record `Removed` when it detaches
        // rather than leaving it `Inactive` forever in the allocated list.
        // A thread that never attaches simply never gets this hook, and
        // its record lives until the kernel itself drops.
        let kernel_id = self.kernel_id;
        let rec_addr = rec as usize;
        let _ = registry::register_cleanup(move || {
            // SAFETY: `rec_addr` was produced by `Box::into_raw` above and
            // the allocated-list chain only ever frees a record once its
            // state is `Removed`, which this closure is what sets; it runs
            // at most once per record, from the thread that owns it.
            let rec = rec_addr as *mut Record<C::Op>;
            unsafe { (*rec).set_state(RecState::Removed) };
            RECORDS.with(|map| {
                map.borrow_mut().remove(&kernel_id);
            });
        });

        rec
    }

    fn link_active(&self, rec: *mut Record<C::Op>) {
        loop {
            let head = self.active_head.load(Ordering::Relaxed);
            unsafe { (*rec).next_active.store(head, Ordering::Relaxed) };
            if self
                .active_head
                .compare_exchange_weak(head, rec, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Returns the calling thread's publication record for this kernel,
    /// allocating one on first use. Re-activates (and re-links) a record
    /// the combiner previously compacted out: if marked inactive, flips it
    /// back to active and reinserts it into the active publication list
    /// via CAS on the head.
    fn acquire_record(&self) -> *mut Record<C::Op> {
        let kernel_id = self.kernel_id;
        RECORDS.with(|map| {
            let mut map = map.borrow_mut();
            if let Some(&raw) = map.get(&kernel_id) {
                let rec = raw as *mut Record<C::Op>;
                // SAFETY: records are never freed while any thread might
                // still hold this raw pointer; compaction only flips state,
                // it does not deallocate until the owning thread detaches.
                if unsafe { (*rec).state() } != RecState::Active {
                    unsafe { (*rec).set_state(RecState::Active) };
                    self.link_active(rec);
                }
                return rec;
            }
            let rec = self.new_record();
            map.insert(kernel_id, rec as *mut ());
            rec
        })
    }

    /// Resolves (allocating if needed) the calling thread's publication
    /// record without submitting an operation, for callers that want to
    /// submit several operations via [`Kernel::operation_done`] without
    /// re-resolving the record each time.
    pub fn acquire(&self) -> RecordHandle<C::Op> {
        RecordHandle { rec: self.acquire_record() }
    }

    /// Submits `payload` under `op_id` through an already-[`acquire`]d
    /// handle and waits for it to be serviced, exactly like
    /// [`Kernel::combine`] but without re-resolving the calling thread's
    /// record.
    ///
    /// [`acquire`]: Kernel::acquire
    pub fn operation_done(&self, handle: &RecordHandle<C::Op>, op_id: usize, payload: C::Op) -> C::Op {
        unsafe { (*handle.rec).publish(op_id, payload) };
        self.drive_to_completion(handle.rec, false);
        unsafe { (*handle.rec).take_response() }
    }

    /// Proactively marks `handle`'s record inactive, so the next
    /// compaction pass drops it from the active publication list ahead of
    /// its normal age-based eviction. The underlying record is not freed
    /// here — it is reused if the same thread calls `combine`/`acquire`
    /// again, and only reclaimed once the thread detaches from the
    /// crate-wide registry (see the cleanup hook `new_record` registers
    /// the first time a thread touches this kernel).
    pub fn release_record(&self, handle: RecordHandle<C::Op>) {
        // SAFETY: `handle.rec` was produced by `acquire_record`, which
        // never frees a record itself; only a detach cleanup (for a
        // different, later point in this thread's lifetime) does.
        unsafe {
            if (*handle.rec).state() == RecState::Active {
                (*handle.rec).set_state(RecState::Inactive);
            }
        }
    }

    /// Submits `payload` under `op_id`, waits for it to be serviced (either
    /// by becoming the combiner or by another thread's pass), and returns
    /// the serviced payload.
    pub fn combine(&self, op_id: usize, payload: C::Op) -> C::Op {
        let rec = self.acquire_record();
        unsafe { (*rec).publish(op_id, payload) };
        self.drive_to_completion(rec, false);
        unsafe { (*rec).take_response() }
    }

    /// Like [`Kernel::combine`], but the combiner processes the entire
    /// batch of pending operations through
    /// [`FlatCombinable::process_batch`] each pass instead of one record at
    /// a time, so the container can collide operations against each other.
    pub fn batch_combine(&self, op_id: usize, payload: C::Op) -> C::Op {
        let rec = self.acquire_record();
        unsafe { (*rec).publish(op_id, payload) };
        self.drive_to_completion(rec, true);
        unsafe { (*rec).take_response() }
    }

    fn drive_to_completion(&self, rec: *mut Record<C::Op>, batch: bool) {
        loop {
            if let Some(_guard) = self.combiner_lock.try_lock() {
                self.run_passes(batch);
            } else {
                unsafe { (*rec).wait.wait(None) };
            }
            if unsafe { (*rec).is_response_ready() } {
                return;
            }
        }
    }

    fn run_passes(&self, batch: bool) {
        let cur_age = self.age.fetch_add(1, Ordering::Relaxed) + 1;
        let mut container = self.container.lock();

        for _pass in 0..self.config.pass_count {
            let mut did_work = false;

            if batch {
                let mut pending: Vec<(&Record<C::Op>, &mut C::Op)> = Vec::new();
                let mut p = self.active_head.load(Ordering::Acquire);
                while !p.is_null() {
                    let rec = unsafe { &*p };
                    if rec.state() == RecState::Active && rec.pending_op_id() != NO_OP {
                        rec.age.store(cur_age, Ordering::Relaxed);
                        let slot = unsafe { &mut *rec.payload.get() };
                        pending.push((rec, unsafe { slot.assume_init_mut() }));
                    }
                    p = rec.next_active.load(Ordering::Acquire);
                }
                if !pending.is_empty() {
                    did_work = true;
                    let mut ops: Vec<&mut C::Op> = pending.iter_mut().map(|(_, op)| &mut **op).collect();
                    container.process_batch(&mut ops);
                    for (rec, _) in pending {
                        rec.op_id.store(NO_OP, Ordering::Relaxed);
                        rec.response_ready.store(true, Ordering::Release);
                        rec.wait.wakeup_one();
                    }
                }
            } else {
                let mut p = self.active_head.load(Ordering::Acquire);
                while !p.is_null() {
                    let rec = unsafe { &*p };
                    if rec.state() == RecState::Active && rec.pending_op_id() != NO_OP {
                        rec.age.store(cur_age, Ordering::Relaxed);
                        rec.service(|op| container.apply(op));
                        did_work = true;
                    }
                    p = rec.next_active.load(Ordering::Acquire);
                }
            }

            if !did_work {
                break;
            }
        }

        if cur_age & self.config.compact_mask == 0 {
            self.compact(cur_age);
        }

        // Wake every thread still parked on the combiner lock so a loser
        // can re-contend immediately rather than waiting for a timeout.
        let mut p = self.active_head.load(Ordering::Acquire);
        while !p.is_null() {
            let rec = unsafe { &*p };
            rec.wait.wakeup_all();
            p = rec.next_active.load(Ordering::Acquire);
        }
    }

    fn compact(&self, cur_age: usize) {
        // Unlink records from the active list that are no longer `Active`
        // at all (a detached thread's record was just marked `Removed`),
        // or whose age has fallen more than `compact_mask` passes behind
        // the current one.
        let mut prev: *mut Record<C::Op> = ptr::null_mut();
        let mut p = self.active_head.load(Ordering::Acquire);
        while !p.is_null() {
            let rec = unsafe { &*p };
            let next = rec.next_active.load(Ordering::Relaxed);
            let state = rec.state();
            let stale = state != RecState::Active
                || rec.age.load(Ordering::Relaxed) + self.config.compact_mask < cur_age;

            if stale {
                if state == RecState::Active {
                    rec.set_state(RecState::Inactive);
                }
                if prev.is_null() {
                    self.active_head.store(next, Ordering::Release);
                } else {
                    unsafe { (*prev).next_active.store(next, Ordering::Release) };
                }
            } else {
                prev = p;
            }
            p = next;
        }

        self.free_removed();
    }

    /// Walks the allocated list and physically frees every record a
    /// detached thread's cleanup hook marked `Removed`, unlinking it from
    /// the chain. Runs under `combiner_lock` (the only caller is
    /// `run_passes`), so no two threads ever free from this list at once.
    fn free_removed(&self) {
        let mut prev: *mut Record<C::Op> = ptr::null_mut();
        let mut p = self.allocated_head.load(Ordering::Acquire);
        while !p.is_null() {
            // SAFETY: nodes on the allocated list are freed only here.
            let rec = unsafe { &*p };
            let next = rec.next_allocated.load(Ordering::Relaxed);
            if rec.state() == RecState::Removed {
                if prev.is_null() {
                    self.allocated_head.store(next, Ordering::Release);
                } else {
                    unsafe { (*prev).next_allocated.store(next, Ordering::Release) };
                }
                // SAFETY: already unlinked from the active list above (a
                // `Removed` record is always stale), and `Removed` is only
                // ever set by a record's own owning thread after it has
                // stopped calling `combine`/`operation_done`, so no thread
                // can still hold a live reference to this address.
                drop(unsafe { Box::from_raw(p) });
            } else {
                prev = p;
            }
            p = next;
        }
    }
}

impl<C: FlatCombinable> Drop for Kernel<C> {
    fn drop(&mut self) {
        let mut p = self.allocated_head.load(Ordering::Relaxed);
        while !p.is_null() {
            // SAFETY: the kernel is being dropped, so no thread can still
            // reach any allocated record through it.
            let boxed = unsafe { Box::from_raw(p) };
            p = boxed.next_allocated.load(Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter(i64);

    enum CounterOp {
        Add(i64),
    }

    impl FlatCombinable for Counter {
        type Op = CounterOp;
        fn apply(&mut self, op: &mut Self::Op) {
            match op {
                CounterOp::Add(n) => self.0 += *n,
            }
        }
    }

    #[test]
    fn single_thread_combine() {
        let kernel = Kernel::new(Counter(0), FcConfig::default());
        kernel.combine(1, CounterOp::Add(5));
        kernel.combine(1, CounterOp::Add(7));
        assert_eq!(kernel.container.lock().0, 12);
    }

    #[test]
    fn concurrent_combine_sums_correctly() {
        use std::sync::Arc;
        use std::thread;

        let kernel = Arc::new(Kernel::new(Counter(0), FcConfig::default()));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let k = Arc::clone(&kernel);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    k.combine(1, CounterOp::Add(1));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(kernel.container.lock().0, 8000);
    }

    #[test]
    fn acquire_operation_done_and_release_record_round_trip() {
        let kernel = Kernel::new(Counter(0), FcConfig::default());
        let handle = kernel.acquire();
        kernel.operation_done(&handle, 1, CounterOp::Add(3));
        kernel.operation_done(&handle, 1, CounterOp::Add(4));
        kernel.release_record(handle);
        assert_eq!(kernel.container.lock().0, 7);

        // The kernel stays usable afterward: `combine` reactivates a
        // record `release_record` only marked inactive, it never frees it.
        kernel.combine(1, CounterOp::Add(1));
        assert_eq!(kernel.container.lock().0, 8);
    }

    #[test]
    fn detached_thread_record_is_eventually_reclaimed() {
        use crate::registry;
        use std::sync::Arc;
        use std::thread;

        let kernel = Arc::new(Kernel::new(Counter(0), FcConfig::default().with_compact_factor(1)));

        let k = Arc::clone(&kernel);
        thread::spawn(move || {
            registry::attach().unwrap();
            k.combine(1, CounterOp::Add(1));
            registry::detach();
        })
        .join()
        .unwrap();

        // Drive enough compaction passes from this thread to sweep the
        // other thread's now-`Removed` record out of the allocated list.
        registry::attach().unwrap();
        for _ in 0..4 {
            kernel.combine(1, CounterOp::Add(0));
        }
        registry::detach();

        let mut count = 0;
        let mut p = kernel.allocated_head.load(Ordering::Acquire);
        while !p.is_null() {
            count += 1;
            p = unsafe { (*p).next_allocated.load(Ordering::Relaxed) };
        }
        assert_eq!(count, 1, "the detached thread's record must have been freed, leaving only this thread's own");
    }
}
