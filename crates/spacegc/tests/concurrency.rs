//! Several mutator threads sharing one heap.

mod common;

use std::sync::atomic::Ordering;
use std::sync::{Arc, Barrier};
use std::thread;

use common::{alloc, config, linked_list, list_payloads, CountingRuntime, MB};
use spacegc::{CollectorType, Heap, SlotModel};

fn counting_heap(collector_type: CollectorType, capacity: usize) -> (Arc<Heap>, Arc<CountingRuntime>) {
    let runtime = Arc::new(CountingRuntime::default());
    let heap = Heap::new(config(collector_type, capacity), Arc::new(SlotModel), runtime.clone()).unwrap();
    (heap, runtime)
}

fn mutators_keep_their_lists(collector_type: CollectorType) {
    const THREADS: usize = 4;
    const ROUNDS: usize = 20;
    let (heap, runtime) = counting_heap(collector_type, 8 * MB);
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let heap = Arc::clone(&heap);
            let runtime = Arc::clone(&runtime);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let _scope = runtime.mutator_scope();
                let mut lists = Vec::new();
                for round in 0..ROUNDS {
                    let len = 10 + t * 5 + round;
                    lists.push((len, runtime.inner.root(linked_list(&heap, &runtime.inner, len))));
                    for _ in 0..50 {
                        alloc(&heap, 1, 3);
                    }
                    if round % 5 == t % 5 {
                        heap.collect_garbage(false);
                    }
                }
                for (len, root) in &lists {
                    let head = root.get().unwrap();
                    assert_eq!(list_payloads(&heap, head), (0..*len).collect::<Vec<_>>());
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(runtime.max_stopped.load(Ordering::SeqCst), 1);
    assert_eq!(runtime.stopped.load(Ordering::SeqCst), 0);
    let collections = heap.gc_count();
    assert!(collections >= THREADS as u64);
    assert!(runtime.suspensions.load(Ordering::SeqCst) as u64 >= collections);
    assert!(heap.verify_heap().is_ok());
}

#[test]
fn test_semi_space_mutators() {
    mutators_keep_their_lists(CollectorType::SemiSpace);
}

#[test]
fn test_mark_sweep_mutators() {
    mutators_keep_their_lists(CollectorType::MarkSweep);
}

#[test]
fn test_collections_are_serialized() {
    const THREADS: usize = 4;
    const EACH: usize = 10;
    let (heap, runtime) = counting_heap(CollectorType::SemiSpace, 2 * MB);
    let _list = runtime.inner.root(linked_list(&heap, &runtime.inner, 200));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let heap = Arc::clone(&heap);
            thread::spawn(move || {
                for _ in 0..EACH {
                    heap.collect_garbage(false);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(heap.gc_count(), (THREADS * EACH) as u64);
    assert_eq!(heap.metrics().total_collections(), THREADS * EACH);
    assert_eq!(runtime.max_stopped.load(Ordering::SeqCst), 1);
    assert_eq!(heap.verify_heap(), Ok(200));
}
