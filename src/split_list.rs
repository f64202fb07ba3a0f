//! Split-ordered hash set: a single sorted linked list whose order is the
//! bit-reversal of each key's hash, with a growable array of "bucket"
//! pointers into that list used only as search shortcuts. Growing the
//! bucket array never rehashes or moves an existing node — a real node's
//! position in the list depends only on its own hash, never on the table
//! size, which is the whole point of the bit-reversal trick (Shalev-Shavit
//! & Shavit, 2006).
//!
//! Node ordering and the recursive "initialize the parent bucket first"
//! construction follow the classic algorithm directly; splicing reuses
//! [`crate::michael_list`]'s mark-then-unlink approach (steal the low bit
//! of a node's own split-order key to tell dummy bucket markers from real
//! entries, and the low bit of its `next` pointer for logical deletion),
//! since both are the same Michael-list machinery applied to a
//! `u64`-ordered key instead of `K` directly.

use crate::backoff::{Backoff, Pause};
use crate::error::Result;
use crate::hp;
use crate::registry;
use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

struct Node<K, V> {
    split_key: u64,
    key: Option<K>,
    value: MaybeUninit<V>,
    next: AtomicPtr<Node<K, V>>,
}

impl<K, V> Node<K, V> {
    fn dummy(split_key: u64) -> Self {
        Self {
            split_key,
            key: None,
            value: MaybeUninit::uninit(),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

fn mark<K, V>(p: *mut Node<K, V>) -> *mut Node<K, V> {
    ((p as usize) | 1) as *mut Node<K, V>
}

fn unmark<K, V>(p: *mut Node<K, V>) -> *mut Node<K, V> {
    ((p as usize) & !1usize) as *mut Node<K, V>
}

fn is_marked<K, V>(p: *mut Node<K, V>) -> bool {
    (p as usize) & 1 != 0
}

fn hash_of<K: Hash>(key: &K) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

/// `0` in the low bit marks a bucket dummy; every real entry's key is
/// forced odd so it always sorts after the dummy for its bucket prefix.
fn regular_split_key(hash: u64) -> u64 {
    hash.reverse_bits() | 1
}

fn dummy_split_key(bucket_index: u64) -> u64 {
    bucket_index.reverse_bits()
}

fn parent_bucket(index: usize) -> usize {
    if index == 0 {
        return 0;
    }
    let highest = usize::BITS - 1 - index.leading_zeros();
    index & !(1usize << highest)
}

/// Builder for [`SplitOrderedSet`] tuning knobs.
#[derive(Clone, Copy, Debug)]
pub struct SplitListConfig {
    initial_buckets: usize,
    load_factor: usize,
    dynamic_bucket_table: bool,
}

impl SplitListConfig {
    pub fn new() -> Self {
        Self {
            initial_buckets: 16,
            load_factor: 4,
            dynamic_bucket_table: true,
        }
    }

    pub fn with_initial_buckets(mut self, n: usize) -> Self {
        assert!(n >= 1);
        self.initial_buckets = n;
        self
    }

    pub fn with_load_factor(mut self, n: usize) -> Self {
        assert!(n >= 1);
        self.load_factor = n;
        self
    }

    /// Selects between a table that grows as the set fills past
    /// `load_factor` (the default) and a static one fixed forever at
    /// `initial_buckets`. A static table trades worse search fan-out at
    /// high load for never taking the bucket array's write lock after
    /// construction.
    pub fn with_dynamic_bucket_table(mut self, dynamic: bool) -> Self {
        self.dynamic_bucket_table = dynamic;
        self
    }
}

impl Default for SplitListConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// A lock-free hash set with an attached value per key, whose bucket table
/// grows without ever rehashing existing entries.
pub struct SplitOrderedSet<K, V> {
    head: *mut Node<K, V>,
    buckets: RwLock<Vec<AtomicPtr<Node<K, V>>>>,
    count: AtomicUsize,
    load_factor: usize,
    dynamic_bucket_table: bool,
}

unsafe impl<K: Send, V: Send> Send for SplitOrderedSet<K, V> {}
unsafe impl<K: Send, V: Send> Sync for SplitOrderedSet<K, V> {}

impl<K: Hash + Eq, V> SplitOrderedSet<K, V> {
    pub fn new(config: SplitListConfig) -> Self {
        let head = Box::into_raw(Box::new(Node::dummy(0)));
        let mut buckets = Vec::with_capacity(config.initial_buckets);
        buckets.push(AtomicPtr::new(head));
        for _ in 1..config.initial_buckets {
            buckets.push(AtomicPtr::new(ptr::null_mut()));
        }
        Self {
            head,
            buckets: RwLock::new(buckets),
            count: AtomicUsize::new(0),
            load_factor: config.load_factor,
            dynamic_bucket_table: config.dynamic_bucket_table,
        }
    }

    fn bucket_count(&self) -> usize {
        self.buckets.read().len()
    }

    fn bucket_index(&self, hash: u64) -> usize {
        (hash as usize) % self.bucket_count()
    }

    /// Walks the globally sorted list from `start` to the first node with
    /// `split_key >= target`, unlinking logically-deleted nodes along the
    /// way. Mirrors [`crate::michael_list::MichaelList`]'s search, just
    /// ordered by a `u64` instead of `K`.
    fn search(
        &self,
        start: *mut Node<K, V>,
        target: u64,
        guard_a: &hp::Guard,
        guard_b: &hp::Guard,
    ) -> Result<(*const AtomicPtr<Node<K, V>>, *mut Node<K, V>)> {
        'retry: loop {
            let mut prev_link: *const AtomicPtr<Node<K, V>> = unsafe { &(*start).next };
            let mut curr = hp::protect(guard_a, unsafe { &*prev_link });
            let mut curr_guard_is_a = true;

            loop {
                let curr_unmarked = unmark(curr);
                if curr_unmarked.is_null() {
                    return Ok((prev_link, ptr::null_mut()));
                }

                // SAFETY: validated by `protect` against `prev_link`.
                let node = unsafe { &*curr_unmarked };
                let next = node.next.load(Ordering::Acquire);

                if is_marked(next) {
                    let spliced = unsafe {
                        (*prev_link).compare_exchange(
                            curr,
                            unmark(next),
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                    };
                    match spliced {
                        Ok(_) => {
                            hp::retire(unsafe { Box::from_raw(curr_unmarked) })?;
                            let reprotect = if curr_guard_is_a { guard_a } else { guard_b };
                            curr = hp::protect(reprotect, unsafe { &*prev_link });
                            continue;
                        }
                        Err(_) => continue 'retry,
                    }
                }

                if node.split_key >= target {
                    return Ok((prev_link, curr_unmarked));
                }
                prev_link = &node.next;
                let next_guard = if curr_guard_is_a { guard_b } else { guard_a };
                curr = hp::protect(next_guard, &node.next);
                curr_guard_is_a = !curr_guard_is_a;
            }
        }
    }

    fn store_bucket(&self, index: usize, node: *mut Node<K, V>) {
        let buckets = self.buckets.read();
        if index < buckets.len() {
            buckets[index].store(node, Ordering::Release);
        }
    }

    fn get_bucket(&self, index: usize) -> Result<*mut Node<K, V>> {
        if index == 0 {
            return Ok(self.head);
        }
        {
            let buckets = self.buckets.read();
            if index < buckets.len() {
                let p = buckets[index].load(Ordering::Acquire);
                if !p.is_null() {
                    return Ok(p);
                }
            }
        }
        self.init_bucket(index)
    }

    /// Splices a dummy marker for `index` into the list, recursively
    /// ensuring the parent bucket exists first so the dummy lands after
    /// its parent's marker and before anything that hashes into it.
    fn init_bucket(&self, index: usize) -> Result<*mut Node<K, V>> {
        let parent = self.get_bucket(parent_bucket(index))?;
        let dummy_key = dummy_split_key(index as u64);
        let dummy = Box::into_raw(Box::new(Node::dummy(dummy_key)));

        let guard_a = hp::Guard::acquire()?;
        let guard_b = hp::Guard::acquire()?;
        loop {
            let (prev_link, curr) = self.search(parent, dummy_key, &guard_a, &guard_b)?;
            if !curr.is_null() && unsafe { (*curr).split_key } == dummy_key {
                // Another thread already created this bucket's dummy.
                drop(unsafe { Box::from_raw(dummy) });
                self.store_bucket(index, curr);
                return Ok(curr);
            }
            unsafe { (*dummy).next.store(curr, Ordering::Relaxed) };
            let prev = unsafe { &*prev_link };
            if prev
                .compare_exchange(curr, dummy, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.store_bucket(index, dummy);
                return Ok(dummy);
            }
        }
    }

    fn maybe_grow(&self, count: usize) {
        if !self.dynamic_bucket_table {
            return;
        }
        let cur_len = self.bucket_count();
        if count / cur_len.max(1) > self.load_factor {
            let mut buckets = self.buckets.write();
            if buckets.len() == cur_len {
                let new_len = cur_len * 2;
                buckets.resize_with(new_len, || AtomicPtr::new(ptr::null_mut()));
                tracing::debug!(new_len, "split-ordered set grew bucket table");
            }
        }
    }

    /// Inserts `key`/`value` if `key` is absent.
    pub fn insert(&self, key: K, value: V) -> Result<bool> {
        registry::current()?;
        let hash = hash_of(&key);
        let split_key = regular_split_key(hash);
        let dummy = self.get_bucket(self.bucket_index(hash))?;
        let mut backoff = Pause::default();
        let mut payload = Some((key, value));

        loop {
            let (key, value) = payload.take().unwrap();
            let guard_a = hp::Guard::acquire()?;
            let guard_b = hp::Guard::acquire()?;
            let (prev_link, curr) = self.search(dummy, split_key, &guard_a, &guard_b)?;

            let found = !curr.is_null() && unsafe {
                (*curr).split_key == split_key && (*curr).key.as_ref() == Some(&key)
            };
            if found {
                return Ok(false);
            }

            let node = Box::into_raw(Box::new(Node {
                split_key,
                key: Some(key),
                value: MaybeUninit::new(value),
                next: AtomicPtr::new(curr),
            }));

            let prev = unsafe { &*prev_link };
            match prev.compare_exchange(curr, node, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    let new_count = self.count.fetch_add(1, Ordering::Relaxed) + 1;
                    self.maybe_grow(new_count);
                    return Ok(true);
                }
                Err(_) => {
                    // SAFETY: `node` never became reachable.
                    let boxed = unsafe { Box::from_raw(node) };
                    payload = Some((boxed.key.unwrap(), unsafe { boxed.value.assume_init() }));
                    backoff.spin();
                }
            }
        }
    }

    /// Removes `key`, if present, returning its value.
    pub fn remove(&self, key: &K) -> Result<Option<V>> {
        registry::current()?;
        let hash = hash_of(key);
        let split_key = regular_split_key(hash);
        let dummy = self.get_bucket(self.bucket_index(hash))?;
        let mut backoff = Pause::default();

        loop {
            let guard_a = hp::Guard::acquire()?;
            let guard_b = hp::Guard::acquire()?;
            let (_prev_link, curr) = self.search(dummy, split_key, &guard_a, &guard_b)?;

            let matches = !curr.is_null()
                && unsafe { (*curr).split_key == split_key && (*curr).key.as_ref() == Some(key) };
            if !matches {
                return Ok(None);
            }

            // SAFETY: protected by `guard_a`/`guard_b`.
            let node = unsafe { &*curr };
            let next = node.next.load(Ordering::Acquire);
            if is_marked(next) {
                backoff.spin();
                continue;
            }

            match node.next.compare_exchange(next, mark(next), Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    self.count.fetch_sub(1, Ordering::Relaxed);
                    let value = unsafe { ptr::read(node.value.as_ptr()) };
                    let _ = self.search(dummy, split_key, &guard_a, &guard_b);
                    return Ok(Some(value));
                }
                Err(_) => {
                    backoff.spin();
                    continue;
                }
            }
        }
    }

    /// Returns `true` if `key` is present and not logically deleted.
    pub fn contains(&self, key: &K) -> Result<bool> {
        registry::current()?;
        let hash = hash_of(key);
        let split_key = regular_split_key(hash);
        let dummy = self.get_bucket(self.bucket_index(hash))?;
        let guard_a = hp::Guard::acquire()?;
        let guard_b = hp::Guard::acquire()?;
        let (_prev_link, curr) = self.search(dummy, split_key, &guard_a, &guard_b)?;
        Ok(!curr.is_null()
            && unsafe { (*curr).split_key == split_key && (*curr).key.as_ref() == Some(key) })
    }

    /// Looks up `key` and, if present, invokes `f` with a reference to its
    /// key and value while the node is still hazard-protected. Returns
    /// `false` without calling `f` if `key` is absent.
    ///
    /// `f` should finish quickly: a concurrent `remove`/`update` of the
    /// same key may read the value out from under a half-deleted node the
    /// instant it wins the unlink race, so `f` must not retain the
    /// reference past its own call.
    pub fn find<F>(&self, key: &K, f: F) -> Result<bool>
    where
        F: FnOnce(&K, &V),
    {
        registry::current()?;
        let hash = hash_of(key);
        let split_key = regular_split_key(hash);
        let dummy = self.get_bucket(self.bucket_index(hash))?;
        let guard_a = hp::Guard::acquire()?;
        let guard_b = hp::Guard::acquire()?;
        let (_prev_link, curr) = self.search(dummy, split_key, &guard_a, &guard_b)?;
        let matches = !curr.is_null()
            && unsafe { (*curr).split_key == split_key && (*curr).key.as_ref() == Some(key) };
        if !matches {
            return Ok(false);
        }
        // SAFETY: `curr` is still protected by `guard_a`/`guard_b`.
        let node = unsafe { &*curr };
        f(node.key.as_ref().unwrap(), unsafe { &*node.value.as_ptr() });
        Ok(true)
    }

    /// Sets `key`'s value to `value`, atomically replacing the existing
    /// node (if any) with one carrying the new value so a concurrent
    /// `contains`/`find` never observes `key` as absent in between. If
    /// `key` is missing and `insert_if_missing` is `false`, this is a
    /// no-op that returns `Ok(false)`; otherwise `key`/`value` is inserted.
    pub fn update(&self, key: K, value: V, insert_if_missing: bool) -> Result<bool> {
        registry::current()?;
        let hash = hash_of(&key);
        let split_key = regular_split_key(hash);
        let dummy = self.get_bucket(self.bucket_index(hash))?;
        let mut backoff = Pause::default();
        let mut payload = Some((key, value));

        loop {
            let (key, value) = payload.take().unwrap();
            let guard_a = hp::Guard::acquire()?;
            let guard_b = hp::Guard::acquire()?;
            let (prev_link, curr) = self.search(dummy, split_key, &guard_a, &guard_b)?;

            let found = !curr.is_null() && unsafe {
                (*curr).split_key == split_key && (*curr).key.as_ref() == Some(&key)
            };
            if !found && !insert_if_missing {
                return Ok(false);
            }

            let next = if found {
                let n = unsafe { (*curr).next.load(Ordering::Acquire) };
                if is_marked(n) {
                    payload = Some((key, value));
                    backoff.spin();
                    continue;
                }
                n
            } else {
                curr
            };

            let node = Box::into_raw(Box::new(Node {
                split_key,
                key: Some(key),
                value: MaybeUninit::new(value),
                next: AtomicPtr::new(next),
            }));

            let prev = unsafe { &*prev_link };
            match prev.compare_exchange(curr, node, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    if found {
                        // SAFETY: `curr` is now unreachable; drop the
                        // superseded value before retiring the node, since
                        // retiring only frees the allocation.
                        unsafe { ptr::drop_in_place((*curr).value.as_mut_ptr()) };
                        hp::retire(unsafe { Box::from_raw(curr) })?;
                    } else {
                        let new_count = self.count.fetch_add(1, Ordering::Relaxed) + 1;
                        self.maybe_grow(new_count);
                    }
                    return Ok(true);
                }
                Err(_) => {
                    // SAFETY: `node` never became reachable.
                    let boxed = unsafe { Box::from_raw(node) };
                    payload = Some((boxed.key.unwrap(), unsafe { boxed.value.assume_init() }));
                    backoff.spin();
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Hash + Eq, V> Default for SplitOrderedSet<K, V> {
    fn default() -> Self {
        Self::new(SplitListConfig::default())
    }
}

impl<K, V> Drop for SplitOrderedSet<K, V> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` proves exclusive access to the whole chain;
        // bucket dummies are nodes on this same chain, freed exactly once
        // here rather than through the bucket array.
        let mut head = unsafe { Box::from_raw(self.head) };
        let mut curr = unmark(*head.next.get_mut());
        drop(head);
        while !curr.is_null() {
            let mut boxed = unsafe { Box::from_raw(curr) };
            let next = unmark(*boxed.next.get_mut());
            if boxed.key.is_some() {
                unsafe { boxed.value.assume_init_drop() };
            }
            curr = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry;

    #[test]
    fn insert_remove_contains_single_thread() {
        registry::attach().unwrap();
        let set: SplitOrderedSet<i32, &'static str> =
            SplitOrderedSet::new(SplitListConfig::default().with_initial_buckets(4));
        assert!(set.insert(1, "one").unwrap());
        assert!(set.insert(2, "two").unwrap());
        assert!(!set.insert(1, "dup").unwrap());
        assert!(set.contains(&1).unwrap());
        assert!(set.contains(&2).unwrap());
        assert!(!set.contains(&3).unwrap());
        assert_eq!(set.remove(&1).unwrap(), Some("one"));
        assert!(!set.contains(&1).unwrap());
        assert_eq!(set.len(), 1);
        registry::detach();
    }

    #[test]
    fn grows_bucket_table_without_losing_entries() {
        registry::attach().unwrap();
        let set: SplitOrderedSet<usize, usize> =
            SplitOrderedSet::new(SplitListConfig::default().with_initial_buckets(4).with_load_factor(2));
        for i in 0..200 {
            assert!(set.insert(i, i * 2).unwrap());
        }
        assert!(set.bucket_count() > 4, "table should have grown past its initial size");
        for i in 0..200 {
            assert!(set.contains(&i).unwrap());
        }
        assert_eq!(set.len(), 200);
        registry::detach();
    }

    #[test]
    fn concurrent_inserts_are_all_observed() {
        use std::sync::atomic::{AtomicUsize, Ordering as O};
        use std::sync::Arc;
        use std::thread;

        const THREADS: usize = 6;
        const PER_THREAD: usize = 300;

        let set: Arc<SplitOrderedSet<usize, usize>> = Arc::new(SplitOrderedSet::default());
        let mut handles = Vec::new();
        for t in 0..THREADS {
            let set = Arc::clone(&set);
            handles.push(thread::spawn(move || {
                registry::attach().unwrap();
                for i in 0..PER_THREAD {
                    let key = t * PER_THREAD + i;
                    assert!(set.insert(key, key).unwrap());
                }
                registry::detach();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let found = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for t in 0..THREADS {
            let set = Arc::clone(&set);
            let found = Arc::clone(&found);
            handles.push(thread::spawn(move || {
                registry::attach().unwrap();
                for i in 0..PER_THREAD {
                    let key = t * PER_THREAD + i;
                    if set.contains(&key).unwrap() {
                        found.fetch_add(1, O::Relaxed);
                    }
                }
                registry::detach();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(found.load(O::Relaxed), THREADS * PER_THREAD);
    }

    #[test]
    fn update_replaces_existing_and_optionally_inserts() {
        registry::attach().unwrap();
        let set: SplitOrderedSet<i32, &'static str> =
            SplitOrderedSet::new(SplitListConfig::default().with_initial_buckets(4));

        assert!(!set.update(1, "one", false).unwrap());
        assert!(!set.contains(&1).unwrap());

        assert!(set.update(1, "one", true).unwrap());
        assert_eq!(set.len(), 1);

        assert!(set.update(1, "uno", true).unwrap());
        assert_eq!(set.len(), 1);
        set.find(&1, |_, v| assert_eq!(*v, "uno")).unwrap();
        registry::detach();
    }

    #[test]
    fn find_reports_absence_of_missing_keys() {
        registry::attach().unwrap();
        let set: SplitOrderedSet<i32, i32> =
            SplitOrderedSet::new(SplitListConfig::default().with_initial_buckets(4));
        assert!(!set.find(&1, |_, _| unreachable!()).unwrap());

        set.insert(1, 100).unwrap();
        let mut seen = 0;
        assert!(set.find(&1, |k, v| {
            seen = *k + *v;
        }).unwrap());
        assert_eq!(seen, 101);
        registry::detach();
    }

    #[test]
    fn static_bucket_table_never_grows() {
        registry::attach().unwrap();
        let set: SplitOrderedSet<usize, usize> = SplitOrderedSet::new(
            SplitListConfig::default()
                .with_initial_buckets(4)
                .with_load_factor(2)
                .with_dynamic_bucket_table(false),
        );
        for i in 0..200 {
            assert!(set.insert(i, i).unwrap());
        }
        assert_eq!(set.bucket_count(), 4, "a static table must never resize past its initial size");
        for i in 0..200 {
            assert!(set.contains(&i).unwrap());
        }
        assert_eq!(set.len(), 200);
        registry::detach();
    }
}
