use cds_core::registry;
use cds_core::{TreiberConfig, TreiberStack};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

#[test]
fn smoke_push_pop_order() {
    registry::attach().unwrap();
    let stack: TreiberStack<i32> = TreiberStack::new(TreiberConfig::default());
    stack.push(10).unwrap();
    stack.push(20).unwrap();
    assert_eq!(stack.pop().unwrap(), Some(20));
    assert_eq!(stack.pop().unwrap(), Some(10));
    assert_eq!(stack.pop().unwrap(), None);
    registry::detach();
}

#[test]
fn producer_consumer_every_pushed_value_is_popped_exactly_once() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 10_000;

    let stack: Arc<TreiberStack<u64>> =
        Arc::new(TreiberStack::new(TreiberConfig::default().with_elimination(true)));

    let mut producers = Vec::new();
    for t in 0..THREADS {
        let stack = Arc::clone(&stack);
        producers.push(thread::spawn(move || {
            registry::attach().unwrap();
            for seq in 0..PER_THREAD {
                let encoded = ((t as u64) << 32) | (seq as u64);
                stack.push(encoded).unwrap();
            }
            registry::detach();
        }));
    }
    for p in producers {
        p.join().unwrap();
    }

    let total = THREADS * PER_THREAD;
    let pop_count = Arc::new(AtomicUsize::new(0));
    let popped: Arc<parking_lot::Mutex<Vec<u64>>> = Arc::new(parking_lot::Mutex::new(Vec::with_capacity(total)));

    let mut consumers = Vec::new();
    for _ in 0..THREADS {
        let stack = Arc::clone(&stack);
        let pop_count = Arc::clone(&pop_count);
        let popped = Arc::clone(&popped);
        consumers.push(thread::spawn(move || {
            registry::attach().unwrap();
            let mut local = Vec::new();
            loop {
                match stack.pop().unwrap() {
                    Some(v) => {
                        local.push(v);
                        if pop_count.fetch_add(1, Ordering::Relaxed) + 1 >= total {
                            break;
                        }
                    }
                    None => {
                        if pop_count.load(Ordering::Relaxed) >= total {
                            break;
                        }
                    }
                }
            }
            popped.lock().extend(local);
            registry::detach();
        }));
    }
    for c in consumers {
        c.join().unwrap();
    }

    let popped = popped.lock();
    assert_eq!(popped.len(), total);

    let expected: HashSet<u64> = (0..THREADS)
        .flat_map(|t| (0..PER_THREAD).map(move |seq| ((t as u64) << 32) | (seq as u64)))
        .collect();
    let actual: HashSet<u64> = popped.iter().copied().collect();
    assert_eq!(actual, expected, "every pushed value must be popped exactly once");
}
