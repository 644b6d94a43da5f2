// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Lock records: one batch of merged intentions.
//!
//! A [`LockRecord`] accumulates compatible intentions while it sits in the
//! scheduler's queue, then executes them as one batch. Its life is a cycle:
//! idle in the pool, accepting merges at the queue, active, drained, back to
//! the pool. Only the scheduler mutates a record's admission state, and only
//! while holding the scheduler mutex; the activation latch and the completion
//! counter are synchronized independently so that waiting and releasing never
//! touch the scheduler.

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::intention::LockIntention;

/// Maximum number of requests merged into one read/write batch.
///
/// Beyond this the record stops accepting merges: every admitted writer ORs
/// more bits into the shared sets, so false positives would compound and
/// late-arriving intentions would be serialized anyway. Writer-heavy
/// intentions (more write keys than this) are rejected outright for the same
/// reason. Pure read batches are exempt; reads compose without touching the
/// sets.
pub const MERGE_SATURATION: u32 = 8;

/// Admission classification of a batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RecordType {
    /// Fresh record; adopts the first request presented to it.
    None,
    /// Only read intentions so far; admits every further read, no writes.
    ReadOnly,
    /// Mixed batch; admission decided by the Bloom conflict test.
    ReadWrite,
    /// Saturated; admits nothing further.
    Exclusive,
    /// A single global write; admits nothing further.
    Global,
}

/// State mutated under the record's own mutex.
///
/// Admission fields (`record_type`, `num_requests`, `intention`) are only
/// ever touched while the scheduler mutex is also held; the record mutex
/// exists for the latch handshake with waiting threads.
#[derive(Debug)]
struct RecordState {
    record_type: RecordType,
    num_requests: u32,
    intention: LockIntention,
    /// Raised when this record becomes the active batch.
    active: bool,
    /// Terminal flag; set at teardown to let waiters out without activation.
    closed: bool,
}

/// One batch of merged lock intentions.
#[derive(Debug)]
pub(crate) struct LockRecord {
    state: Mutex<RecordState>,
    activated: Condvar,
    /// Completion counter; set to the request count at activation and
    /// decremented once per release.
    pending: AtomicU32,
}

impl LockRecord {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RecordState {
                record_type: RecordType::None,
                num_requests: 0,
                intention: LockIntention::default(),
                active: false,
                closed: false,
            }),
            activated: Condvar::new(),
            pending: AtomicU32::new(0),
        }
    }

    /// Attempts to admit `intention` into this batch.
    ///
    /// A fresh record adopts the intention wholesale and classifies itself
    /// read-only or read/write. A read-only record admits any further pure
    /// read. A read/write record admits via the Bloom conflict test, up to
    /// [`MERGE_SATURATION`] requests. Saturated and global records admit
    /// nothing.
    pub fn merge_lock_request(&self, intention: &LockIntention) -> bool {
        let mut state = self.state.lock();
        match state.record_type {
            RecordType::None => {
                state.record_type = if intention.is_read_only() {
                    RecordType::ReadOnly
                } else {
                    RecordType::ReadWrite
                };
                state.intention = *intention;
                state.num_requests = 1;
                true
            }
            RecordType::ReadOnly => {
                // The write count is exact, so this is not an approximation:
                // reads always compose and no writer can join later, which is
                // why the sets need no update here.
                if intention.is_read_only() {
                    state.num_requests += 1;
                    true
                } else {
                    false
                }
            }
            RecordType::Exclusive | RecordType::Global => false,
            RecordType::ReadWrite => {
                if intention.min_writes() > MERGE_SATURATION {
                    return false;
                }
                if !state.intention.merge(intention) {
                    return false;
                }
                state.num_requests += 1;
                if state.num_requests >= MERGE_SATURATION {
                    state.record_type = RecordType::Exclusive;
                }
                true
            }
        }
    }

    /// Attempts to admit a read covering all resources.
    ///
    /// Only a fresh or read-only record qualifies; the record stays read-only
    /// and keeps admitting reads, so read storms coalesce into one batch.
    pub fn global_read_request(&self) -> bool {
        let mut state = self.state.lock();
        match state.record_type {
            RecordType::None => {
                state.record_type = RecordType::ReadOnly;
                state.num_requests = 1;
                true
            }
            RecordType::ReadOnly => {
                state.num_requests += 1;
                true
            }
            _ => false,
        }
    }

    /// Attempts to adopt a write covering all resources.
    ///
    /// Only a fresh record qualifies, and the resulting batch is this single
    /// request.
    pub fn global_write_request(&self) -> bool {
        let mut state = self.state.lock();
        if state.record_type == RecordType::None {
            state.record_type = RecordType::Global;
            state.num_requests = 1;
            true
        } else {
            false
        }
    }

    /// Current classification. Callers hold the scheduler mutex, so the value
    /// cannot change under them.
    pub fn record_type(&self) -> RecordType {
        self.state.lock().record_type
    }

    /// Publishes this record as the active batch and wakes every merged
    /// holder. The request count is frozen here into the completion counter;
    /// the scheduler has already unlinked the record from its queue, so no
    /// further merge can slip in after the freeze.
    pub fn activate(&self) {
        let mut state = self.state.lock();
        self.pending.store(state.num_requests, Ordering::Release);
        state.active = true;
        drop(state);
        self.activated.notify_all();
    }

    /// Blocks until the record is activated (or closed at teardown).
    pub fn wait_for_activation(&self) {
        let mut state = self.state.lock();
        while !state.active && !state.closed {
            self.activated.wait(&mut state);
        }
    }

    /// Drops one holder from the active batch; returns true iff this call
    /// drained it. Exactly one release per activation observes the drain, and
    /// that caller becomes responsible for recycling the record and handing
    /// off to the next batch.
    pub fn release(&self) -> bool {
        self.pending.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Resets the record to its pooled idle state. Called only by the thread
    /// that drained the batch, after which the record is unreachable until
    /// the scheduler reissues it.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.record_type = RecordType::None;
        state.num_requests = 0;
        state.intention.clear();
        state.active = false;
    }

    /// Marks the record terminal and releases any waiter. Waits that return
    /// through this path hold nothing.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        drop(state);
        self.activated.notify_all();
    }
}
