//! Michael's lock-free ordered singly-linked list: a sorted list where
//! removal is split into a logical step (mark the outgoing link's low bit)
//! and a physical step (CAS the predecessor past the marked node), so a
//! concurrent insert or search can always tell a half-deleted node from a
//! live one and help finish unlinking it.
//!
//! Traversal protects nodes through the crate-wide hazard-pointer domain
//! ([`crate::hp`]) the way `martinhath-comere`'s `hp-list.rs` does:
//! protect, re-validate against the slot that produced the pointer, and
//! only then dereference. The mark-bit packing (steal the pointer's low
//! bit, since every `Node` is at least pointer-aligned) follows the same
//! file's `with_tag`/`tag` helpers, implemented here by hand since this
//! crate does not depend on a tagged-pointer crate.

use crate::backoff::{Backoff, Pause};
use crate::error::Result;
use crate::hp;
use crate::registry;
use std::cmp::Ordering as CmpOrdering;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

struct Node<K, V> {
    key: K,
    value: MaybeUninit<V>,
    next: AtomicPtr<Node<K, V>>,
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

/// A lock-free set of unique, ordered keys with an attached value, safe to
/// share across threads via `&MichaelList<K, V>`.
pub struct MichaelList<K, V> {
    head: AtomicPtr<Node<K, V>>,
    count: AtomicUsize,
}

unsafe impl<K: Send, V: Send> Send for MichaelList<K, V> {}
unsafe impl<K: Send, V: Send> Sync for MichaelList<K, V> {}

impl<K: Ord, V> MichaelList<K, V> {
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            count: AtomicUsize::new(0),
        }
    }

    /// Finds the first unmarked node with a key `>= key`, unlinking any
    /// logically-deleted nodes it walks past along the way. Returns the
    /// address of the predecessor's `next` link and the (unmarked) current
    /// node pointer, which is null past the tail.
    ///
    /// `guard_a`/`guard_b` trade off which one protects the predecessor and
    /// which protects the current node as the walk advances, so both are
    /// always safe to dereference: the predecessor's memory must stay
    /// alive as long as we might CAS through its `next` field.
    fn search(
        &self,
        key: &K,
        guard_a: &hp::Guard,
        guard_b: &hp::Guard,
    ) -> Result<(*const AtomicPtr<Node<K, V>>, *mut Node<K, V>)> {
        'retry: loop {
            let mut prev_link: *const AtomicPtr<Node<K, V>> = &self.head;
            let mut curr = hp::protect(guard_a, unsafe { &*prev_link });
            let mut curr_guard_is_a = true;

            loop {
                let curr_unmarked = unmark(curr);
                if curr_unmarked.is_null() {
                    return Ok((prev_link, ptr::null_mut()));
                }

                // SAFETY: `curr_unmarked` was just validated by `protect`
                // against `prev_link`.
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

                match node.key.cmp(key) {
                    CmpOrdering::Less => {
                        prev_link = &node.next;
                        let next_guard = if curr_guard_is_a { guard_b } else { guard_a };
                        curr = hp::protect(next_guard, &node.next);
                        curr_guard_is_a = !curr_guard_is_a;
                    }
                    _ => return Ok((prev_link, curr_unmarked)),
                }
            }
        }
    }

    /// Inserts `key`/`value` if `key` is absent. Returns `true` if
    /// inserted, `false` if a node with this key was already present.
    pub fn insert(&self, key: K, value: V) -> Result<bool> {
        registry::current()?;
        let mut backoff = Pause::default();
        let mut payload = Some((key, value));

        loop {
            let (key, value) = payload.take().unwrap();
            let prev_guard = hp::Guard::acquire()?;
            let curr_guard = hp::Guard::acquire()?;
            let (prev_link, curr) = self.search(&key, &prev_guard, &curr_guard)?;

            let found = if curr.is_null() {
                false
            } else {
                unsafe { (*curr).key == key }
            };
            if found {
                return Ok(false);
            }

            let node = Box::into_raw(Box::new(Node {
                key,
                value: MaybeUninit::new(value),
                next: AtomicPtr::new(curr),
            }));

            let prev = unsafe { &*prev_link };
            match prev.compare_exchange(curr, node, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    self.count.fetch_add(1, Ordering::Relaxed);
                    return Ok(true);
                }
                Err(_) => {
                    // SAFETY: `node` never became reachable.
                    let boxed = unsafe { Box::from_raw(node) };
                    let key = boxed.key;
                    let value = unsafe { boxed.value.assume_init() };
                    payload = Some((key, value));
                    backoff.spin();
                }
            }
        }
    }

    /// Removes the node with `key`, if present, returning its value.
    pub fn remove(&self, key: &K) -> Result<Option<V>> {
        registry::current()?;
        let mut backoff = Pause::default();

        loop {
            let prev_guard = hp::Guard::acquire()?;
            let curr_guard = hp::Guard::acquire()?;
            let (_prev_link, curr) = self.search(key, &prev_guard, &curr_guard)?;

            if curr.is_null() || unsafe { &(*curr).key } != key {
                return Ok(None);
            }

            // SAFETY: `curr` is protected by `curr_guard` until this
            // function returns or retries.
            let node = unsafe { &*curr };
            let next = node.next.load(Ordering::Acquire);
            if is_marked(next) {
                backoff.spin();
                continue;
            }

            match node.next.compare_exchange(
                next,
                mark(next),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    // Logically deleted. Try to splice it out immediately;
                    // if that CAS loses, the next search() through here
                    // will finish the unlink.
                    let value = unsafe { ptr::read(node.value.as_ptr()) };
                    let _ = self.search(key, &prev_guard, &curr_guard);
                    self.count.fetch_sub(1, Ordering::Relaxed);
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
        let prev_guard = hp::Guard::acquire()?;
        let curr_guard = hp::Guard::acquire()?;
        let (_prev_link, curr) = self.search(key, &prev_guard, &curr_guard)?;
        Ok(!curr.is_null() && unsafe { &(*curr).key } == key)
    }

    /// Looks up `key` and, if present, invokes `f` with a reference to its
    /// key and value while the node is still hazard-protected. Returns
    /// `false` without calling `f` if `key` is absent.
    ///
    /// `f` should finish quickly: a concurrent `remove`/`update` of the same
    /// key may read the value out from under a half-deleted node the
    /// instant it wins the unlink race, so `f` must not retain the
    /// reference past its own call.
    pub fn find<F>(&self, key: &K, f: F) -> Result<bool>
    where
        F: FnOnce(&K, &V),
    {
        registry::current()?;
        let prev_guard = hp::Guard::acquire()?;
        let curr_guard = hp::Guard::acquire()?;
        let (_prev_link, curr) = self.search(key, &prev_guard, &curr_guard)?;
        if curr.is_null() || unsafe { &(*curr).key } != key {
            return Ok(false);
        }
        // SAFETY: `curr` is still protected by `curr_guard`.
        let node = unsafe { &*curr };
        f(&node.key, unsafe { &*node.value.as_ptr() });
        Ok(true)
    }

    /// Sets `key`'s value to `value`, atomically replacing the existing
    /// node (if any) with one carrying the new value so a concurrent
    /// `contains`/`find` never observes `key` as absent in between. If
    /// `key` is missing and `insert_if_missing` is `false`, this is a no-op
    /// that returns `Ok(false)`; otherwise `key`/`value` is inserted.
    pub fn update(&self, key: K, value: V, insert_if_missing: bool) -> Result<bool> {
        registry::current()?;
        let mut backoff = Pause::default();
        let mut payload = Some((key, value));

        loop {
            let (key, value) = payload.take().unwrap();
            let prev_guard = hp::Guard::acquire()?;
            let curr_guard = hp::Guard::acquire()?;
            let (prev_link, curr) = self.search(&key, &prev_guard, &curr_guard)?;

            let found = !curr.is_null() && unsafe { (*curr).key == key };
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
                key,
                value: MaybeUninit::new(value),
                next: AtomicPtr::new(next),
            }));

            let prev = unsafe { &*prev_link };
            match prev.compare_exchange(curr, node, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    if found {
                        // SAFETY: `curr` is now unreachable; drop the
                        // superseded value before retiring the node, since
                        // retiring only frees the allocation — it does not
                        // know to drop the `MaybeUninit` payload itself.
                        unsafe { ptr::drop_in_place((*curr).value.as_mut_ptr()) };
                        hp::retire(unsafe { Box::from_raw(curr) })?;
                    } else {
                        self.count.fetch_add(1, Ordering::Relaxed);
                    }
                    return Ok(true);
                }
                Err(_) => {
                    // SAFETY: `node` never became reachable.
                    let boxed = unsafe { Box::from_raw(node) };
                    let key = boxed.key;
                    let value = unsafe { boxed.value.assume_init() };
                    payload = Some((key, value));
                    backoff.spin();
                }
            }
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

impl<K: Ord, V> Default for MichaelList<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Drop for MichaelList<K, V> {
    fn drop(&mut self) {
        let mut curr = unmark(*self.head.get_mut());
        while !curr.is_null() {
            // SAFETY: `&mut self` proves no concurrent access remains.
            let mut boxed = unsafe { Box::from_raw(curr) };
            let next = unmark(*boxed.next.get_mut());
            unsafe { boxed.value.assume_init_drop() };
            curr = next;
        }
    }
}
