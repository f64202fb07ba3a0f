//! Retired-pointer batch.
//!
//! A [`RetiredPtr`] is a type-erased `(raw_pointer, deleter)` pair, matching
//! `cds::gc::details::retired_ptr`. Erasing the type lets a
//! single [`RetiredBatch`] hold pointers to nodes of any container's node
//! type, which both SMR schemes need: a scan must walk one undifferentiated
//! list of pending frees, not one list per concrete `T`.

use std::fmt;

/// One pointer a thread has relinquished, together with the function that
/// reclaims it. The deleter is invoked exactly once, when the batch
/// destroys the record after the owning SMR scheme has proved no reader can
/// still observe it.
pub struct RetiredPtr {
    ptr: *mut (),
    deleter: unsafe fn(*mut ()),
}

impl fmt::Debug for RetiredPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetiredPtr").field("ptr", &self.ptr).finish()
    }
}

// SAFETY: a `RetiredPtr` only ever carries a pointer that was produced by
// `Box::into_raw` on the thread that retired it; the batch holding it may
// be moved to, or scanned by, any other attached thread, because the whole
// point of SMR is that ownership of the memory transfers to whichever
// thread performs the reclaiming scan.
unsafe impl Send for RetiredPtr {}

impl RetiredPtr {
    /// Erases `Box<T>` into a type-erased retired pointer. The returned
    /// value, when dropped via [`RetiredPtr::reclaim`], runs `T`'s
    /// destructor and deallocates exactly as `Box<T>`'s own `Drop` would.
    pub fn from_box<T>(boxed: Box<T>) -> Self {
        unsafe fn drop_box<T>(ptr: *mut ()) {
            drop(unsafe { Box::from_raw(ptr as *mut T) });
        }

        let ptr = Box::into_raw(boxed) as *mut ();
        Self {
            ptr,
            deleter: drop_box::<T>,
        }
    }

    /// The raw address of the retired object, used by a scan to test
    /// membership in the set of currently-hazardous pointers. Comparing
    /// addresses is sound because the object is never moved while retired.
    pub fn address(&self) -> *const () {
        self.ptr as *const ()
    }

    /// Runs the deleter, consuming the record. Must only be called once the
    /// owning SMR scheme has proved the pointer is no longer hazardous.
    ///
    /// # Safety
    ///
    /// The caller must guarantee no other thread holds a reference derived
    /// from this pointer.
    pub unsafe fn reclaim(self) {
        let Self { ptr, deleter } = self;
        unsafe { deleter(ptr) };
    }
}

/// A per-thread buffer of pointers awaiting reclamation, flushed by the
/// owning SMR scheme once it exceeds a configured threshold or when the
/// thread detaches.
#[derive(Default)]
pub struct RetiredBatch {
    records: Vec<RetiredPtr>,
}

impl RetiredBatch {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    /// Buffers a pointer for later reclamation.
    pub fn push(&mut self, record: RetiredPtr) {
        self.records.push(record);
    }

    /// Number of pointers currently buffered.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Retains only the records for which `still_hazardous` returns `true`;
    /// every other record is reclaimed immediately. This is the core of an
    /// HP/DHP scan: `still_hazardous` closes over a snapshot of published
    /// pointers.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that `still_hazardous` correctly reports
    /// every pointer any other thread might still dereference; reclaiming a
    /// record it misclassified as non-hazardous is a use-after-free.
    pub unsafe fn scan<F>(&mut self, mut still_hazardous: F)
    where
        F: FnMut(*const ()) -> bool,
    {
        let mut retained = Vec::with_capacity(self.records.len());
        for record in self.records.drain(..) {
            if still_hazardous(record.address()) {
                retained.push(record);
            } else {
                unsafe { record.reclaim() };
            }
        }
        self.records = retained;
    }

    /// Reclaims every buffered record unconditionally. Used when a thread
    /// detaches from an SMR scheme that guarantees no other thread can be
    /// reading through this thread's own retired pointers after detach
    /// (i.e. the caller has already published/cleared its own hazards), or
    /// when the whole scheme is being torn down.
    ///
    /// # Safety
    ///
    /// The caller must guarantee no other thread can still dereference any
    /// buffered pointer.
    pub unsafe fn reclaim_all(&mut self) {
        for record in self.records.drain(..) {
            unsafe { record.reclaim() };
        }
    }
}

impl Drop for RetiredBatch {
    fn drop(&mut self) {
        debug_assert!(
            self.records.is_empty(),
            "RetiredBatch dropped with {} pointers still unreclaimed; \
             the owning SMR scheme must drain it before dropping",
            self.records.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counted(Arc<AtomicUsize>);

    impl Drop for Counted {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn scan_reclaims_non_hazardous_and_keeps_the_rest() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut batch = RetiredBatch::new();
        let kept_ptr;
        {
            let a = Box::new(Counted(Arc::clone(&drops)));
            let b = Box::new(Counted(Arc::clone(&drops)));
            kept_ptr = &*b as *const Counted as *const ();
            batch.push(RetiredPtr::from_box(a));
            batch.push(RetiredPtr::from_box(b));
        }

        assert_eq!(batch.len(), 2);
        unsafe {
            batch.scan(|addr| addr == kept_ptr);
        }
        assert_eq!(batch.len(), 1);
        assert_eq!(drops.load(Ordering::SeqCst), 1);

        unsafe {
            batch.reclaim_all();
        }
        assert_eq!(drops.load(Ordering::SeqCst), 2);
    }
}
