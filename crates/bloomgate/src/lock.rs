// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The lock itself: a FIFO of batches, the active batch, and a record pool.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use lock_api::RawMutex;

use crate::Key;
use crate::intention::LockIntention;
use crate::record::{LockRecord, RecordType};
use crate::spin::RawSpinLock;
use crate::tracker;

/// Number of records seeded into the pool at construction.
///
/// Pool records cover the steady-state cycle (idle, accepting, active,
/// drained); more are allocated only if contention queues up more distinct
/// batches than this at once.
pub const INITIAL_POOL_RECORDS: usize = 7;

const QUEUE_NON_EMPTY: &str = "the lock queue is never empty";

type SchedulerGuard<'a, R> = lock_api::MutexGuard<'a, R, Scheduler>;

/// A multi-resource reader/writer lock that merges compatible acquisitions
/// into batches.
///
/// Each acquisition declares the resources it will read and write, as opaque
/// non-zero integer keys. Acquisitions whose declared sets cannot conflict
/// are admitted into the same batch and hold the lock simultaneously; batches
/// execute strictly in FIFO order. Conflict is decided approximately, by
/// Bloom filters over the declared sets, so two compatible acquisitions are
/// occasionally serialized (a false positive) but conflicting ones are never
/// batched together.
///
/// Acquire calls block until the caller's batch activates; [`unlock`] releases
/// the one outstanding acquisition of the calling thread. A thread must not
/// acquire the same instance again before unlocking — re-entry is reported on
/// the diagnostic channel and will deadlock.
///
/// The scheduler's internal critical sections are constant-time, so they sit
/// behind a spin lock by default. The raw mutex is a type parameter; any
/// [`lock_api::RawMutex`] (for example `parking_lot::RawMutex`, adaptive and
/// kinder to oversubscribed machines) can be substituted via
/// [`with_raw_mutex`](Self::with_raw_mutex) without changing the contract.
///
/// # Example
///
/// ```
/// use bloomgate::BloomFilterLock;
///
/// let lock = BloomFilterLock::new();
///
/// lock.write_lock(42);
/// // exclusive access to resource 42
/// lock.unlock();
///
/// lock.multilock([7, 9], [42]);
/// // shared access to 7 and 9, exclusive access to 42
/// lock.unlock();
/// ```
///
/// [`unlock`]: Self::unlock
pub struct BloomFilterLock<R: RawMutex = RawSpinLock> {
    scheduler: lock_api::Mutex<R, Scheduler>,
}

/// State behind the scheduler mutex.
struct Scheduler {
    /// Pending batches in FIFO order. Never empty; the front is both the
    /// merge target for arriving requests and the next batch to activate.
    queue: VecDeque<Arc<LockRecord>>,
    /// The batch currently holding the lock, if any.
    active: Option<Arc<LockRecord>>,
    /// Idle records awaiting reuse.
    pool: Vec<Arc<LockRecord>>,
    /// Set once at teardown.
    closing: bool,
}

impl Scheduler {
    /// Pool hit, or a fresh allocation when contention has outrun the pool.
    fn allocate(&mut self) -> Arc<LockRecord> {
        self.pool.pop().unwrap_or_else(|| Arc::new(LockRecord::new()))
    }
}

impl BloomFilterLock {
    /// Creates a lock over the default spin-lock scheduler mutex.
    #[must_use]
    pub fn new() -> Self {
        Self::with_raw_mutex()
    }
}

impl<R: RawMutex> BloomFilterLock<R> {
    /// Creates a lock over a caller-chosen scheduler mutex.
    ///
    /// ```
    /// use bloomgate::BloomFilterLock;
    ///
    /// let lock = BloomFilterLock::<parking_lot::RawMutex>::with_raw_mutex();
    /// lock.read_lock(7);
    /// lock.unlock();
    /// ```
    #[must_use]
    pub fn with_raw_mutex() -> Self {
        let pool = (0..INITIAL_POOL_RECORDS).map(|_| Arc::new(LockRecord::new())).collect();
        let mut queue = VecDeque::with_capacity(INITIAL_POOL_RECORDS + 1);
        queue.push_back(Arc::new(LockRecord::new()));

        Self {
            scheduler: lock_api::Mutex::new(Scheduler {
                queue,
                active: None,
                pool,
                closing: false,
            }),
        }
    }

    /// Blocks until the caller holds shared access covering `resource`.
    pub fn read_lock(&self, resource: Key) {
        self.acquire(&LockIntention::read(resource));
    }

    /// Blocks until the caller holds exclusive access covering `resource`.
    pub fn write_lock(&self, resource: Key) {
        self.acquire(&LockIntention::write(resource));
    }

    /// Blocks until the caller holds shared access to every key in `reads`
    /// and exclusive access to every key in `writes`, as one acquisition.
    ///
    /// Callers must not pass the reserved key `0`.
    pub fn multilock<Rd, Wr>(&self, reads: Rd, writes: Wr)
    where
        Rd: IntoIterator<Item = Key>,
        Wr: IntoIterator<Item = Key>,
    {
        self.acquire(&LockIntention::new(reads, writes));
    }

    /// Blocks until the caller holds a prebuilt intention.
    ///
    /// Equivalent to [`multilock`](Self::multilock); callers issuing the same
    /// acquisition repeatedly can build the intention once and reuse it.
    pub fn multilock_intention(&self, intention: &LockIntention) {
        self.acquire(intention);
    }

    /// Blocks until the caller holds shared access covering all resources.
    pub fn global_read_lock(&self) {
        tracker::track(self.address());

        let mut sched = self.scheduler.lock();
        if sched.queue.front().expect(QUEUE_NON_EMPTY).global_read_request() {
            self.wait_at_queue_front(sched);
            return;
        }

        // A read covers everything, so it composes with any pure-read batch;
        // the committed batch at the back of the queue may still be one. This
        // lets a storm of global reads coalesce even across queued batches.
        if sched.queue.len() > 1 && sched.queue.back().expect(QUEUE_NON_EMPTY).global_read_request() {
            let record = Arc::clone(sched.queue.back().expect(QUEUE_NON_EMPTY));
            drop(sched);
            record.wait_for_activation();
            return;
        }

        let record = sched.allocate();
        let admitted = record.global_read_request();
        debug_assert!(admitted, "a fresh record admits a global read");
        self.wait_at_queue_back(sched, record);
    }

    /// Blocks until the caller holds exclusive access covering all resources.
    pub fn global_write_lock(&self) {
        tracker::track(self.address());

        let mut sched = self.scheduler.lock();
        if sched.queue.front().expect(QUEUE_NON_EMPTY).global_write_request() {
            self.wait_at_queue_front(sched);
            return;
        }

        let record = sched.allocate();
        let admitted = record.global_write_request();
        debug_assert!(admitted, "a fresh record admits a global write");
        self.wait_at_queue_back(sched, record);
    }

    /// Releases the calling thread's outstanding acquisition.
    ///
    /// The thread that drops the active batch's last hold recycles the
    /// drained record and activates the next batch in FIFO order.
    ///
    /// # Panics
    ///
    /// Panics if no acquisition is outstanding on this instance at all.
    /// Calling `unlock` from a thread other than one holding the lock is a
    /// contract violation the implementation cannot detect; it corrupts the
    /// completion count.
    pub fn unlock(&self) {
        tracker::untrack(self.address());

        // Capture the active record before decrementing. The counter still
        // covers this thread, so the record cannot drain and be recycled
        // between the capture and the release call.
        let active = {
            let sched = self.scheduler.lock();
            Arc::clone(sched.active.as_ref().expect("unlock() called while no batch holds the lock"))
        };
        if !active.release() {
            return;
        }

        // This thread drained the batch: recycle the record and hand off.
        active.clear();
        let mut sched = self.scheduler.lock();
        sched.active = None;

        if sched.queue.front().expect(QUEUE_NON_EMPTY).record_type() != RecordType::None {
            let next = sched.queue.pop_front().expect(QUEUE_NON_EMPTY);
            sched.active = Some(Arc::clone(&next));
            next.activate();
        }

        if sched.queue.is_empty() {
            // The promoted batch was also the merge target; the drained
            // record takes its place.
            sched.queue.push_back(active);
        } else {
            sched.pool.push(active);
        }
    }

    /// Common acquire path: merge into the queue front, or start a new batch
    /// at the back.
    fn acquire(&self, intention: &LockIntention) {
        tracker::track(self.address());

        let mut sched = self.scheduler.lock();
        if sched.queue.front().expect(QUEUE_NON_EMPTY).merge_lock_request(intention) {
            self.wait_at_queue_front(sched);
            return;
        }

        let record = sched.allocate();
        let admitted = record.merge_lock_request(intention);
        debug_assert!(admitted, "a fresh record admits any intention");
        self.wait_at_queue_back(sched, record);
    }

    /// Waits on the front record after a successful merge. When no batch is
    /// running the front is promoted on the spot; otherwise the drain of the
    /// running batch will promote it.
    fn wait_at_queue_front(&self, mut sched: SchedulerGuard<'_, R>) {
        let record = if sched.active.is_none() {
            let record = sched.queue.pop_front().expect(QUEUE_NON_EMPTY);
            if sched.queue.is_empty() {
                let fresh = sched.allocate();
                sched.queue.push_back(fresh);
            }
            sched.active = Some(Arc::clone(&record));
            record.activate();
            record
        } else {
            Arc::clone(sched.queue.front().expect(QUEUE_NON_EMPTY))
        };

        drop(sched);
        record.wait_for_activation();
    }

    /// Appends a freshly populated record to the queue and waits on it. It
    /// will receive further merges once everything ahead of it has activated
    /// and it reaches the front.
    fn wait_at_queue_back(&self, mut sched: SchedulerGuard<'_, R>, record: Arc<LockRecord>) {
        sched.queue.push_back(Arc::clone(&record));
        drop(sched);
        record.wait_for_activation();
    }

    fn address(&self) -> usize {
        std::ptr::from_ref(self) as usize
    }
}

impl Default for BloomFilterLock {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: RawMutex> Drop for BloomFilterLock<R> {
    fn drop(&mut self) {
        let mut sched = self.scheduler.lock();
        if sched.closing {
            return;
        }
        sched.closing = true;

        // Let any stranded waiter out; such waits return holding nothing.
        for record in sched.queue.drain(..) {
            record.close();
        }
        if let Some(active) = sched.active.take() {
            active.close();
        }
        sched.pool.clear();
    }
}

impl<R: RawMutex> fmt::Debug for BloomFilterLock<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BloomFilterLock").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn occupancy(lock: &BloomFilterLock) -> (usize, usize, usize) {
        let sched = lock.scheduler.lock();
        (sched.pool.len(), sched.queue.len(), usize::from(sched.active.is_some()))
    }

    #[test]
    fn records_return_to_the_pool() {
        let lock = BloomFilterLock::new();
        assert_eq!(occupancy(&lock), (INITIAL_POOL_RECORDS, 1, 0));

        for cycle in 0..20u64 {
            lock.write_lock(cycle + 1);
            lock.unlock();
            lock.global_read_lock();
            lock.unlock();
        }

        assert_eq!(occupancy(&lock), (INITIAL_POOL_RECORDS, 1, 0));
    }

    #[test]
    fn record_count_is_conserved() {
        let lock = BloomFilterLock::new();
        let total = |lock: &BloomFilterLock| {
            let (pool, queue, active) = occupancy(lock);
            pool + queue + active
        };
        let expected = total(&lock);

        lock.write_lock(5);
        assert_eq!(total(&lock), expected);
        lock.unlock();
        assert_eq!(total(&lock), expected);
    }

    #[test]
    #[should_panic(expected = "no batch holds the lock")]
    fn unlock_without_acquisition_panics() {
        let lock = BloomFilterLock::new();
        lock.unlock();
    }
}
