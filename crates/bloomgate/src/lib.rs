// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Batching multi-resource reader/writer lock with Bloom-filter admission.
//!
//! This crate provides [`BloomFilterLock`], a lock that lets a thread acquire
//! fine-grained read and write intentions over a *set* of resources in a
//! single call, and merges compatible acquisitions from different threads so
//! they hold the lock as one batch.
//!
//! A conventional reader/writer lock forces a choice: one coarse lock (cheap,
//! but writers serialize everything) or one lock per resource (fine-grained,
//! but multi-resource operations must order their acquisitions and pay per
//! lock). `BloomFilterLock` takes a third route. Each acquisition declares
//! the keys it will read and the keys it will write; the lock folds those
//! declarations into Bloom filters and admits an arriving acquisition into
//! the pending batch whenever the filters prove it cannot conflict. Batches
//! then execute in FIFO order, each batch's members holding the lock
//! simultaneously.
//!
//! The admission test is approximate in one direction only. Two acquisitions
//! that genuinely conflict are never batched together; two that are actually
//! compatible are occasionally serialized anyway when their filters collide.
//! Correctness never depends on filter luck, only throughput does.
//!
//! # When to Use
//!
//! Use `BloomFilterLock` when operations touch small, known sets of resources
//! drawn from a space too large to give each resource its own lock:
//!
//! - **Storage engines**: transactions reading and writing a handful of pages
//! - **Entity stores**: updates spanning a few objects out of millions
//! - **Shared graphs**: mutations touching a bounded neighborhood
//!
//! Threads declare what they will touch, and non-overlapping work proceeds in
//! parallel without per-resource lock bookkeeping.
//!
//! # Example
//!
//! ```
//! use bloomgate::BloomFilterLock;
//!
//! let lock = BloomFilterLock::new();
//!
//! // Shared access to 3 and 4, exclusive access to 11, in one acquisition.
//! lock.multilock([3, 4], [11]);
//! // ... read 3 and 4, mutate 11 ...
//! lock.unlock();
//!
//! // Coarse operations cover every resource at once.
//! lock.global_read_lock();
//! // ... consistent snapshot of everything ...
//! lock.unlock();
//! ```
//!
//! # Batching
//!
//! Arriving acquisitions target the batch at the head of the lock's queue.
//! Reads compose with reads unconditionally; anything else is admitted by
//! testing the declared write set against the batch's accumulated read and
//! write sets (and vice versa). A batch stops accepting members once it has
//! merged [`MERGE_SATURATION`] requests, so filter false positives cannot
//! compound without bound. Acquisitions that do not fit start a new batch
//! behind it. One batch is active at a time; the last releaser of a batch
//! activates the next and recycles the drained record through an internal
//! pool, so steady-state operation does not allocate.
//!
//! # Limits
//!
//! Resource keys are opaque non-zero integers chosen by the caller ([`Key`];
//! `0` is reserved). A thread holds at most one acquisition per lock
//! instance: re-entry is not supported, is reported through `tracing`, and
//! will deadlock the offending thread. Fairness is FIFO between batches;
//! members of one batch are unordered relative to each other. Waits are
//! uninterruptible.
//!
//! # Thread Safety
//!
//! [`BloomFilterLock`] is `Send` and `Sync`; any thread may call any
//! operation concurrently. Scheduler bookkeeping runs under an internal
//! test-and-test-and-set spin lock ([`RawSpinLock`]) sized for its
//! constant-time critical sections; waiting for batch activation parks the
//! thread on a per-batch latch.

mod filter;
mod intention;
mod lock;
mod record;
mod spin;
mod tracker;

pub use filter::{BloomSet, FILTER_BITS, FILTER_HASHES};
pub use intention::LockIntention;
pub use lock::{BloomFilterLock, INITIAL_POOL_RECORDS};
pub use record::MERGE_SATURATION;
pub use spin::{RawSpinLock, SpinLock};

/// Opaque identifier of a lockable resource.
///
/// The value `0` is reserved to mean "no resource" and contributes nothing
/// to an acquisition; callers must identify real resources with non-zero
/// keys.
pub type Key = u64;
