use cds_core::{FcConfig, FlatCombinable, Kernel};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;

enum DequeRequest<T> {
    PushBack(T),
    PushFront(T),
    PopBack,
    PopFront,
}

struct DequeOp<T> {
    request: Option<DequeRequest<T>>,
    result: Option<T>,
}

impl<T> DequeOp<T> {
    fn request(req: DequeRequest<T>) -> Self {
        Self { request: Some(req), result: None }
    }
}

struct Deque<T>(VecDeque<T>);

impl<T> FlatCombinable for Deque<T> {
    type Op = DequeOp<T>;

    fn apply(&mut self, op: &mut Self::Op) {
        match op.request.take().expect("combiner services each op exactly once") {
            DequeRequest::PushBack(v) => self.0.push_back(v),
            DequeRequest::PushFront(v) => self.0.push_front(v),
            DequeRequest::PopBack => op.result = self.0.pop_back(),
            DequeRequest::PopFront => op.result = self.0.pop_front(),
        }
    }
}

const OP_ID: usize = 1;

#[test]
fn eight_threads_push_and_pop_from_both_ends() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 10_000;

    let kernel = Arc::new(Kernel::new(Deque(VecDeque::new()), FcConfig::default()));
    let pushed = Arc::new(AtomicI64::new(0));
    let popped = Arc::new(AtomicI64::new(0));
    let popped_values = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for t in 0..THREADS {
        let kernel = Arc::clone(&kernel);
        let pushed = Arc::clone(&pushed);
        let popped = Arc::clone(&popped);
        let popped_values = Arc::clone(&popped_values);
        handles.push(thread::spawn(move || {
            let mut local_popped = Vec::new();
            for i in 0..PER_THREAD {
                let value = ((t as i64) << 32) | (i as i64);

                let push_front = i % 2 == 0;
                let op = if push_front {
                    DequeOp::request(DequeRequest::PushFront(value))
                } else {
                    DequeOp::request(DequeRequest::PushBack(value))
                };
                kernel.batch_combine(OP_ID, op);
                pushed.fetch_add(1, Ordering::Relaxed);

                let pop_back = i % 2 == 0;
                let op = if pop_back {
                    DequeOp::request(DequeRequest::PopBack)
                } else {
                    DequeOp::request(DequeRequest::PopFront)
                };
                let serviced = kernel.batch_combine(OP_ID, op);
                if let Some(v) = serviced.result {
                    popped.fetch_add(1, Ordering::Relaxed);
                    local_popped.push(v);
                }
            }
            popped_values.lock().extend(local_popped);
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(pushed.load(Ordering::Relaxed), (THREADS * PER_THREAD) as i64);
    // Every iteration pairs one push with one pop, so across all threads the
    // final count of successful pops must equal the count of pushes: the
    // deque's size has returned to its initial (empty) value.
    assert_eq!(popped.load(Ordering::Relaxed), pushed.load(Ordering::Relaxed));

    let values = popped_values.lock();
    assert_eq!(values.len() as i64, popped.load(Ordering::Relaxed));
}
