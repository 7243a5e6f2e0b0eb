use crate::parallel::Batch;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

#[test]
pub fn every_item_runs_exactly_once() {
    let mut batch = Batch::new();
    for n in 0..10 {
        batch.add(n);
    }
    assert_eq!(batch.len(), 10);

    let seen = Mutex::new(Vec::new());
    batch.run(4, |n| seen.lock().push(n)).unwrap();

    let mut seen = seen.into_inner();
    seen.sort_unstable();
    assert_eq!(seen, (0..10).collect::<Vec<_>>());
}

#[test]
pub fn concurrency_never_exceeds_the_limit() {
    let mut batch = Batch::new();
    for n in 0..8 {
        batch.add(n);
    }

    let running = AtomicUsize::new(0);
    let high_water = AtomicUsize::new(0);
    batch
        .run(2, |_| {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            high_water.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(50));
            running.fetch_sub(1, Ordering::SeqCst);
        })
        .unwrap();

    // saturation depends on scheduling, only the upper bound is guaranteed
    let peak = high_water.load(Ordering::SeqCst);
    assert!(peak <= 2, "saw {peak} items running at once");
}

#[test]
pub fn zero_concurrency_still_makes_progress() {
    let mut batch = Batch::new();
    batch.add("a");
    batch.add("b");

    let done = AtomicUsize::new(0);
    batch
        .run(0, |_| {
            done.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    assert_eq!(done.load(Ordering::SeqCst), 2);
}

#[test]
pub fn empty_batches_are_a_no_op() {
    let batch: Batch<usize> = Batch::new();
    assert!(batch.is_empty());
    batch.run(4, |_| panic!("no items were queued")).unwrap();
}
