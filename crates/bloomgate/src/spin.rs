// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Test-and-test-and-set spin lock for the scheduler's critical sections.
//!
//! Every critical section the scheduler runs under this lock is a handful of
//! constant-size bit operations, so spinning beats parking: by the time a
//! blocked thread reached the kernel the lock would long be free. The
//! implementation spins on a cached read of the flag and only issues the
//! atomic swap once the flag looks free, with exponentially growing pause
//! windows between probes.
//!
//! [`RawSpinLock`] implements [`lock_api::RawMutex`], so the scheduler can be
//! instantiated over it (the default) or over any other raw mutex — on a
//! heavily oversubscribed machine `parking_lot::RawMutex` is the drop-in
//! alternative. The contract is unchanged either way.

use std::sync::atomic::{AtomicBool, Ordering};

use lock_api::{GuardSend, RawMutex};

/// Cap on the exponential backoff; 2^6 pause hints per probe at most.
const SPIN_LIMIT: u32 = 6;

/// A test-and-test-and-set spin lock with exponential backoff.
///
/// Unlock publishes with release semantics and lock observes with acquire
/// semantics, so state mutated inside the critical section is visible to the
/// next holder.
pub struct RawSpinLock {
    locked: AtomicBool,
}

unsafe impl RawMutex for RawSpinLock {
    const INIT: Self = Self {
        locked: AtomicBool::new(false),
    };

    type GuardMarker = GuardSend;

    fn lock(&self) {
        let mut backoff = 0;
        loop {
            if self.try_lock() {
                return;
            }
            // Spin on the cached line until the flag looks free before
            // attempting another swap.
            while self.locked.load(Ordering::Relaxed) {
                for _ in 0..1u32 << backoff {
                    std::hint::spin_loop();
                }
                if backoff < SPIN_LIMIT {
                    backoff += 1;
                }
            }
        }
    }

    fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    unsafe fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

/// A value guarded by a [`RawSpinLock`], with lock_api's RAII guard.
pub type SpinLock<T> = lock_api::Mutex<RawSpinLock, T>;
