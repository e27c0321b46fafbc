#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Deferred batches of type-erased loops, executed sequentially, on a host thread pool or on an
//! asynchronous device queue.
//!
//! A loop is an index [`Segment`] (a half-open range or an explicit list of indices) plus an
//! operation that is called once for every index. Loops are collected in a [`WorkPool`], which
//! erases the type of every operation so that operations of any type can share one batch. When
//! the batch is complete, the pool turns it into a [`WorkGroup`] that can be run any number of
//! times. Every run returns a [`WorkSite`] that must be synchronized before the results of the
//! run are read.
//!
//! ```text
//! WorkPool ──instantiate()──► WorkGroup ──run(xargs)──► WorkSite ──synchronize()
//!    ▲                                                       │
//!    └──── enqueue() more loops for the next batch ──────────┘
//! ```
//!
//! # Key Features
//!
//! - **Heterogeneous batches**: every loop can capture different state of a different size.
//! - **Three storage layouts** ([`StoragePolicy`]): individually allocated loops, loops packed
//!   back to back in one buffer, or loops packed in fixed-size slots.
//! - **Order policies** ([`OrderPolicy`]): enqueue order, reverse enqueue order, or a
//!   distribution of loop blocks over a grid of work items.
//! - **Execution policies** ([`ExecPolicy`]): the calling thread, a rayon thread pool, or an
//!   asynchronous [`DeviceQueue`].
//! - **Extra arguments**: a value of type `X` supplied when a group runs is passed by reference
//!   to every invocation of every operation. Use a tuple to pass several.
//! - **Allocation reuse**: a pool remembers the size of the largest batch it produced and
//!   reserves that much storage for the next one.
//! - **Pluggable memory**: loop storage comes from an [`Allocator`] of your choice.
//!
//! # Examples
//!
//! ```rust
//! use std::sync::atomic::{AtomicU64, Ordering};
//! use std::sync::Arc;
//!
//! use work_group::{ExecPolicy, WorkPool};
//!
//! let mut pool = WorkPool::<u64, Arc<AtomicU64>>::builder()
//!     .execution(ExecPolicy::host_parallel())
//!     .build()
//!     .unwrap();
//!
//! // Loops with different captured state share one batch.
//! pool.enqueue(0..100, |i, sum: &Arc<AtomicU64>| {
//!     sum.fetch_add(i, Ordering::Relaxed);
//! })
//! .unwrap();
//!
//! let factor = 1000_u64;
//! pool.enqueue(vec![1, 2, 3], move |i, sum: &Arc<AtomicU64>| {
//!     sum.fetch_add(i * factor, Ordering::Relaxed);
//! })
//! .unwrap();
//!
//! let group = pool.instantiate();
//!
//! let sum = Arc::new(AtomicU64::new(0));
//! group.run(Arc::clone(&sum)).unwrap().synchronize().unwrap();
//!
//! assert_eq!(sum.load(Ordering::Relaxed), 4950 + 6000);
//! ```
//!
//! # Running on a device queue
//!
//! ```rust
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! use new_zealand::nz;
//! use work_group::{DeviceQueue, ExecPolicy, OrderPolicy, WorkPool};
//!
//! let queue = DeviceQueue::new().unwrap();
//!
//! let mut pool = WorkPool::<usize, Arc<AtomicUsize>>::builder()
//!     .order(OrderPolicy::distributed(nz!(32)))
//!     .execution(ExecPolicy::device(queue))
//!     .build()
//!     .unwrap();
//!
//! for len in [10, 500, 60] {
//!     pool.enqueue(0..len, |_, count: &Arc<AtomicUsize>| {
//!         count.fetch_add(1, Ordering::Relaxed);
//!     })
//!     .unwrap();
//! }
//!
//! let group = pool.instantiate();
//! let count = Arc::new(AtomicUsize::new(0));
//!
//! // The run executes asynchronously until the site is synchronized.
//! let site = group.run(Arc::clone(&count)).unwrap();
//! site.synchronize().unwrap();
//!
//! assert_eq!(count.load(Ordering::Relaxed), 570);
//! ```

mod alloc;
mod builder;
mod device;
mod dispatch;
mod error;
mod exec;
mod group;
mod index;
mod order;
mod pool;
mod runner;
mod segment;
mod site;
mod storage;

#[cfg(test)]
mod test_utils;

pub use alloc::*;
pub use builder::*;
pub use device::{
    Completion, DeviceBackend, DeviceJob, DeviceQueue, DeviceQueueBuilder, SyncHandle,
    completion_pair,
};
pub use dispatch::*;
pub use error::*;
pub use exec::*;
pub use group::WorkGroup;
pub use index::LoopIndex;
pub use order::OrderPolicy;
pub use pool::WorkPool;
pub use segment::*;
pub use site::*;
pub use storage::{LoopEntry, StoragePolicy};
