use cds_core::registry;
use cds_core::LazyList;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn repeated_insert_erase_of_same_key_never_deadlocks_and_stays_consistent() {
    const ROUNDS: usize = 100_000;

    let list: Arc<LazyList<i32, ()>> = Arc::new(LazyList::new());
    let barrier = Arc::new(Barrier::new(2));
    let inserts_ok = Arc::new(AtomicUsize::new(0));
    let erases_ok = Arc::new(AtomicUsize::new(0));

    let inserter = {
        let list = Arc::clone(&list);
        let barrier = Arc::clone(&barrier);
        let inserts_ok = Arc::clone(&inserts_ok);
        thread::spawn(move || {
            registry::attach().unwrap();
            barrier.wait();
            for _ in 0..ROUNDS {
                if list.insert(5, ()).unwrap() {
                    inserts_ok.fetch_add(1, Ordering::Relaxed);
                }
            }
            registry::detach();
        })
    };
    let eraser = {
        let list = Arc::clone(&list);
        let barrier = Arc::clone(&barrier);
        let erases_ok = Arc::clone(&erases_ok);
        thread::spawn(move || {
            registry::attach().unwrap();
            barrier.wait();
            for _ in 0..ROUNDS {
                if list.remove(&5).unwrap().is_some() {
                    erases_ok.fetch_add(1, Ordering::Relaxed);
                }
            }
            registry::detach();
        })
    };

    let start = Instant::now();
    inserter.join().unwrap();
    eraser.join().unwrap();
    assert!(
        start.elapsed() < Duration::from_secs(60),
        "insert/erase race on a single key must complete within a bounded time"
    );

    registry::attach().unwrap();
    let present = list.contains(&5).unwrap();
    registry::detach();

    // Every successful insert is later undone by exactly one successful
    // erase, save for at most the final state of the key.
    let net = inserts_ok.load(Ordering::Relaxed) as i64 - erases_ok.load(Ordering::Relaxed) as i64;
    assert!(net == 0 || net == 1, "net successful inserts vs. erases must track final presence");
    assert_eq!(present, net == 1);
}
