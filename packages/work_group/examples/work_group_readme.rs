//! Example from the README.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use work_group::{DeviceQueue, ExecPolicy, OrderPolicy, StoragePolicy, WorkPool};

fn main() {
    let queue = DeviceQueue::builder().name("readme").build().unwrap();

    let mut pool = WorkPool::<u64, Arc<AtomicU64>>::builder()
        .storage(StoragePolicy::RaggedArrayOfObjects)
        .order(OrderPolicy::ReverseOrdered)
        .execution(ExecPolicy::device(queue))
        .build()
        .unwrap();

    for frame in 0..3 {
        let weight = frame + 1;

        pool.enqueue(0..1000, move |i, total: &Arc<AtomicU64>| {
            total.fetch_add(i * weight, Ordering::Relaxed);
        })
        .unwrap();

        pool.enqueue(vec![1, 10, 100], |i, total: &Arc<AtomicU64>| {
            total.fetch_add(i, Ordering::Relaxed);
        })
        .unwrap();

        let group = pool.instantiate();
        let total = Arc::new(AtomicU64::new(0));

        let site = group.run(Arc::clone(&total)).unwrap();
        site.synchronize().unwrap();

        println!(
            "frame {frame}: {} loops, total {}",
            group.len(),
            total.load(Ordering::Relaxed)
        );
    }

    // Every batch after the first reuses the storage size of the largest batch so far.
    println!("largest batch: {} bytes", pool.max_storage_bytes());
}
