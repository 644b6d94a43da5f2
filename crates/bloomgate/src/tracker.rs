// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-thread audit of held lock instances.
//!
//! Each thread keeps a private count of how many acquisitions it currently
//! holds on each lock instance, keyed by the lock's address. The tracker is
//! purely diagnostic: re-entrant acquisition of the same instance is not
//! supported and would deadlock the thread against its own batch, so
//! [`track`] reports it on the diagnostic channel. Scheduling decisions never
//! consult the tracker.

use std::cell::RefCell;

use hashbrown::HashMap;

thread_local! {
    static HELD_LOCKS: RefCell<HashMap<usize, u32>> = RefCell::new(HashMap::new());
}

/// Records that the current thread is acquiring the lock at `lock_addr`.
///
/// A thread that already holds this instance is attempting re-entry; the
/// attempt is reported but not prevented.
pub(crate) fn track(lock_addr: usize) {
    HELD_LOCKS.with(|held| {
        let mut held = held.borrow_mut();
        let count = held.entry(lock_addr).or_insert(0);
        if *count > 0 {
            tracing::error!(
                lock = lock_addr,
                holds = *count,
                "re-entrant acquisition of a lock this thread already holds; this will deadlock"
            );
        }
        *count += 1;
    });
}

/// Records that the current thread released one acquisition of the lock at
/// `lock_addr`.
pub(crate) fn untrack(lock_addr: usize) {
    HELD_LOCKS.with(|held| {
        let mut held = held.borrow_mut();
        match held.get_mut(&lock_addr) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                held.remove(&lock_addr);
            }
            // Releasing an instance this thread never acquired; the unlock
            // path itself surfaces the misuse.
            None => {}
        }
    });
}

#[cfg(test)]
pub(crate) fn held_count(lock_addr: usize) -> u32 {
    HELD_LOCKS.with(|held| held.borrow().get(&lock_addr).copied().unwrap_or(0))
}
