//! Lazy lock-coupled ordered list: lookups never block (they just walk the
//! live chain and check a per-node `marked` flag), while `insert`/`remove`
//! take a classic two-hand-over-hand lock on the predecessor and, for
//! removal, the node itself — re-validating both are still linked and
//! unmarked before mutating, since the lock was acquired only after an
//! unlocked walk found them.
//!
//! The lock-coupling and optimistic-validate shape follows
//! `cds/intrusive/impl/lazy_list.h`'s `insert_at`/`unlink_at`. Reclamation
//! reuses [`crate::hp`] rather than the source's `retired_ptr`/GC-specific
//! hooks, so a lookup that is mid-walk when a remover unlinks and frees a
//! node never reads freed memory: the walk protects one node ahead before
//! dereferencing it, exactly as [`crate::michael_list`] does.

use crate::backoff::{Backoff, Pause};
use crate::error::Result;
use crate::hp;
use crate::registry;
use parking_lot::Mutex;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

struct Node<K, V> {
    key: Option<K>,
    value: MaybeUninit<V>,
    next: AtomicPtr<Node<K, V>>,
    marked: AtomicBool,
    lock: Mutex<()>,
}

impl<K, V> Node<K, V> {
    fn sentinel() -> Self {
        Self {
            key: None,
            value: MaybeUninit::uninit(),
            next: AtomicPtr::new(ptr::null_mut()),
            marked: AtomicBool::new(false),
            lock: Mutex::new(()),
        }
    }
}

/// A lock-coupled set of unique, ordered keys with an attached value.
///
/// The chain is pinned between a permanent head and tail sentinel, neither
/// of which ever carries a key: `head` always sorts before every real key,
/// `tail` always sorts after, so `insert`/`remove` never need a special case
/// for operating at either end of the list.
pub struct LazyList<K, V> {
    head: *mut Node<K, V>,
    tail: *mut Node<K, V>,
    count: AtomicUsize,
}

unsafe impl<K: Send, V: Send> Send for LazyList<K, V> {}
unsafe impl<K: Send, V: Send> Sync for LazyList<K, V> {}

impl<K: Ord, V> LazyList<K, V> {
    pub fn new() -> Self {
        let tail = Box::into_raw(Box::new(Node::sentinel()));
        let mut head = Box::new(Node::sentinel());
        *head.next.get_mut() = tail;
        Self {
            head: Box::into_raw(head),
            tail,
            count: AtomicUsize::new(0),
        }
    }

    /// Lock-free walk to the first node with a key `>= key`, which is always
    /// found since `tail` compares as +infinity. Returns the predecessor
    /// (possibly the sentinel head) and that node, both kept alive by
    /// `guard_a`/`guard_b` for as long as the caller holds on to the guards.
    fn locate(
        &self,
        key: &K,
        guard_a: &hp::Guard,
        guard_b: &hp::Guard,
    ) -> (*mut Node<K, V>, *mut Node<K, V>) {
        let mut pred = self.head;
        // SAFETY: `self.head` is allocated once in `new` and freed only in
        // `Drop`, so it outlives every call on `&self`.
        let mut curr = hp::protect(guard_a, unsafe { &(*pred).next });
        let mut curr_guard_is_a = true;

        loop {
            if curr == self.tail {
                return (pred, curr);
            }
            // SAFETY: protected by whichever of `guard_a`/`guard_b`
            // currently plays the "curr" role.
            let node = unsafe { &*curr };
            if node.key.as_ref().expect("only the tail sentinel has no key") >= key {
                return (pred, curr);
            }
            pred = curr;
            let next_guard = if curr_guard_is_a { guard_b } else { guard_a };
            curr = hp::protect(next_guard, &node.next);
            curr_guard_is_a = !curr_guard_is_a;
        }
    }

    fn validate(&self, pred: &Node<K, V>, curr: *mut Node<K, V>) -> bool {
        if pred.marked.load(Ordering::Acquire) {
            return false;
        }
        if pred.next.load(Ordering::Acquire) != curr {
            return false;
        }
        if curr != self.tail {
            // SAFETY: `curr` is still protected by the caller's guard.
            if unsafe { (*curr).marked.load(Ordering::Acquire) } {
                return false;
            }
        }
        true
    }

    /// Inserts `key`/`value` if `key` is absent.
    pub fn insert(&self, key: K, value: V) -> Result<bool> {
        registry::current()?;
        let mut backoff = Pause::default();

        loop {
            let guard_a = hp::Guard::acquire()?;
            let guard_b = hp::Guard::acquire()?;
            let (pred, curr) = self.locate(&key, &guard_a, &guard_b);
            // SAFETY: `pred`/`curr` are protected (or are the permanent
            // sentinels), and both are locked in list order, matching
            // `remove`'s lock-coupling.
            let pred_node = unsafe { &*pred };
            let curr_node = unsafe { &*curr };
            let _pred_lock = pred_node.lock.lock();
            let _curr_lock = curr_node.lock.lock();

            if !self.validate(pred_node, curr) {
                backoff.spin();
                continue;
            }

            if curr != self.tail && curr_node.key.as_ref() == Some(&key) {
                return Ok(false);
            }

            let node = Box::into_raw(Box::new(Node {
                key: Some(key),
                value: MaybeUninit::new(value),
                next: AtomicPtr::new(curr),
                marked: AtomicBool::new(false),
                lock: Mutex::new(()),
            }));
            pred_node.next.store(node, Ordering::Release);
            self.count.fetch_add(1, Ordering::Relaxed);
            return Ok(true);
        }
    }

    /// Removes the node with `key`, if present, returning its value.
    pub fn remove(&self, key: &K) -> Result<Option<V>> {
        registry::current()?;
        let mut backoff = Pause::default();

        loop {
            let guard_a = hp::Guard::acquire()?;
            let guard_b = hp::Guard::acquire()?;
            let (pred, curr) = self.locate(key, &guard_a, &guard_b);

            if curr == self.tail || unsafe { (*curr).key.as_ref() } != Some(key) {
                return Ok(None);
            }

            let pred_node = unsafe { &*pred };
            let curr_node = unsafe { &*curr };
            let _pred_lock = pred_node.lock.lock();
            let _curr_lock = curr_node.lock.lock();

            if !self.validate(pred_node, curr) {
                drop(_curr_lock);
                drop(_pred_lock);
                backoff.spin();
                continue;
            }

            curr_node.marked.store(true, Ordering::Release);
            let next = curr_node.next.load(Ordering::Acquire);
            pred_node.next.store(next, Ordering::Release);
            drop(_curr_lock);
            drop(_pred_lock);

            // SAFETY: `curr` is now unreachable from the list and marked,
            // so no future `locate` will stop on it; we are the only
            // thread that can still read its value.
            let value = unsafe { ptr::read(curr_node.value.as_ptr()) };
            self.count.fetch_sub(1, Ordering::Relaxed);
            hp::retire(unsafe { Box::from_raw(curr) })?;
            return Ok(Some(value));
        }
    }

    /// Wait-free membership check; never blocks on a concurrent
    /// `insert`/`remove`.
    pub fn contains(&self, key: &K) -> Result<bool> {
        registry::current()?;
        let guard_a = hp::Guard::acquire()?;
        let guard_b = hp::Guard::acquire()?;
        let (_pred, curr) = self.locate(key, &guard_a, &guard_b);
        if curr == self.tail {
            return Ok(false);
        }
        // SAFETY: protected by `guard_a`/`guard_b`.
        let node = unsafe { &*curr };
        Ok(node.key.as_ref() == Some(key) && !node.marked.load(Ordering::Acquire))
    }

    /// Looks up `key` and, if present, invokes `f` with a reference to its
    /// key and value. The node's own lock is held across the call to `f`,
    /// the same lock `insert`/`remove`/`update` take on this node, so `f`
    /// cannot observe a value mid-mutation; keep `f` quick.
    pub fn find<F>(&self, key: &K, f: F) -> Result<bool>
    where
        F: FnOnce(&K, &V),
    {
        registry::current()?;
        let guard_a = hp::Guard::acquire()?;
        let guard_b = hp::Guard::acquire()?;
        let (_pred, curr) = self.locate(key, &guard_a, &guard_b);
        if curr == self.tail {
            return Ok(false);
        }
        // SAFETY: protected by `guard_a`/`guard_b`.
        let node = unsafe { &*curr };
        let _lock = node.lock.lock();
        if node.marked.load(Ordering::Acquire) || node.key.as_ref() != Some(key) {
            return Ok(false);
        }
        f(node.key.as_ref().unwrap(), unsafe { &*node.value.as_ptr() });
        Ok(true)
    }

    /// Sets `key`'s value to `value` in place, under the node's own lock so
    /// a concurrent `find` never observes a half-written value. If `key` is
    /// missing and `insert_if_missing` is `false`, this is a no-op that
    /// returns `Ok(false)`; otherwise `key`/`value` is inserted.
    pub fn update(&self, key: K, value: V, insert_if_missing: bool) -> Result<bool> {
        registry::current()?;
        let mut backoff = Pause::default();
        let mut payload = Some((key, value));

        loop {
            let (key, value) = payload.take().unwrap();
            let guard_a = hp::Guard::acquire()?;
            let guard_b = hp::Guard::acquire()?;
            let (pred, curr) = self.locate(&key, &guard_a, &guard_b);
            let pred_node = unsafe { &*pred };
            let curr_node = unsafe { &*curr };
            let _pred_lock = pred_node.lock.lock();
            let _curr_lock = curr_node.lock.lock();

            if !self.validate(pred_node, curr) {
                payload = Some((key, value));
                backoff.spin();
                continue;
            }

            if curr != self.tail && curr_node.key.as_ref() == Some(&key) {
                // SAFETY: both `pred_node`'s and `curr_node`'s locks are
                // held, and `curr` is reached through a raw pointer so the
                // write does not alias any outstanding `&Node` borrow.
                unsafe {
                    ptr::drop_in_place((*curr).value.as_mut_ptr());
                    (*curr).value = MaybeUninit::new(value);
                }
                return Ok(true);
            }

            if !insert_if_missing {
                return Ok(false);
            }

            let node = Box::into_raw(Box::new(Node {
                key: Some(key),
                value: MaybeUninit::new(value),
                next: AtomicPtr::new(curr),
                marked: AtomicBool::new(false),
                lock: Mutex::new(()),
            }));
            pred_node.next.store(node, Ordering::Release);
            self.count.fetch_add(1, Ordering::Relaxed);
            return Ok(true);
        }
    }

    /// Number of live (not logically deleted) entries.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Ord, V> Default for LazyList<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Drop for LazyList<K, V> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` proves exclusive access to the whole chain.
        let mut curr = unsafe { *(*self.head).next.get_mut() };
        while curr != self.tail {
            let mut boxed = unsafe { Box::from_raw(curr) };
            let next = *boxed.next.get_mut();
            unsafe { boxed.value.assume_init_drop() };
            curr = next;
        }
        drop(unsafe { Box::from_raw(self.tail) });
        drop(unsafe { Box::from_raw(self.head) });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry;

    #[test]
    fn insert_remove_contains_single_thread() {
        registry::attach().unwrap();
        let list: LazyList<i32, &'static str> = LazyList::new();
        assert!(list.insert(5, "five").unwrap());
        assert!(list.insert(1, "one").unwrap());
        assert!(list.insert(3, "three").unwrap());
        assert!(!list.insert(3, "dup").unwrap());

        assert!(list.contains(&1).unwrap());
        assert!(list.contains(&5).unwrap());
        assert!(!list.contains(&9).unwrap());

        assert_eq!(list.remove(&3).unwrap(), Some("three"));
        assert!(!list.contains(&3).unwrap());
        assert_eq!(list.remove(&3).unwrap(), None);
        registry::detach();
    }

    #[test]
    fn concurrent_insert_and_remove_leave_consistent_state() {
        use std::sync::atomic::{AtomicUsize, Ordering as O};
        use std::sync::Arc;
        use std::thread;

        const THREADS: usize = 6;
        const PER_THREAD: usize = 300;

        let list: Arc<LazyList<usize, usize>> = Arc::new(LazyList::new());
        let mut handles = Vec::new();
        for t in 0..THREADS {
            let list = Arc::clone(&list);
            handles.push(thread::spawn(move || {
                registry::attach().unwrap();
                for i in 0..PER_THREAD {
                    let key = t * PER_THREAD + i;
                    assert!(list.insert(key, key).unwrap());
                }
                registry::detach();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let removed = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for t in 0..THREADS {
            let list = Arc::clone(&list);
            let removed = Arc::clone(&removed);
            handles.push(thread::spawn(move || {
                registry::attach().unwrap();
                for i in 0..PER_THREAD {
                    let key = t * PER_THREAD + i;
                    if key % 2 == 0 {
                        if list.remove(&key).unwrap().is_some() {
                            removed.fetch_add(1, O::Relaxed);
                        }
                    }
                }
                registry::detach();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let total = THREADS * PER_THREAD;
        let expected_removed = (0..total).filter(|k| k % 2 == 0).count();
        assert_eq!(removed.load(O::Relaxed), expected_removed);
        registry::attach().unwrap();
        for key in 0..total {
            let should_remain = key % 2 != 0;
            assert_eq!(list.contains(&key).unwrap(), should_remain);
        }
        registry::detach();
    }

    #[test]
    fn update_replaces_existing_and_optionally_inserts() {
        registry::attach().unwrap();
        let list: LazyList<i32, &'static str> = LazyList::new();

        assert!(!list.update(1, "one", false).unwrap());
        assert!(!list.contains(&1).unwrap());

        assert!(list.update(1, "one", true).unwrap());
        assert_eq!(list.len(), 1);

        assert!(list.update(1, "uno", true).unwrap());
        assert_eq!(list.len(), 1);
        list.find(&1, |_, v| assert_eq!(*v, "uno")).unwrap();
        registry::detach();
    }

    #[test]
    fn find_reports_absence_and_len_tracks_live_entries() {
        registry::attach().unwrap();
        let list: LazyList<i32, i32> = LazyList::new();
        assert!(list.is_empty());

        assert!(!list.find(&1, |_, _| unreachable!()).unwrap());

        list.insert(1, 100).unwrap();
        list.insert(2, 200).unwrap();
        assert_eq!(list.len(), 2);

        let mut seen = 0;
        assert!(list.find(&2, |k, v| {
            seen = *k + *v;
        }).unwrap());
        assert_eq!(seen, 202);

        list.remove(&1).unwrap();
        assert_eq!(list.len(), 1);
        registry::detach();
    }
}
