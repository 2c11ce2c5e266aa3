//! Cooperative sleep/wake/interrupt, replacing the condition-variable
//! trio of `examples/original_source/platform/linux/sched.c`
//! (`sched_sleep`/`sched_wakeup`/`sched_interrupt`) with the same
//! contract built on `std::sync::Condvar`.
//!
//! A `Waitable` is *not* itself guarded by the table mutex it is used
//! with — it lives alongside the `Mutex<Table>` as a sibling field, so
//! that a caller can hold a `MutexGuard` for the table and still reach
//! the `Waitable` to call `sleep`. Its own two bookkeeping fields
//! (`interrupted`, `waiters`) are atomics purely so `sleep`/`wakeup`/
//! `interrupt` can take `&self`; every mutation happens while the
//! caller already holds the table's mutex, so there is no real race —
//! this mirrors the source's "must be called after mutex locked" rule
//! on its C structures.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Condvar, MutexGuard};
use std::time::Instant;

use crate::error::SchedError;

pub struct Waitable {
    cond: Condvar,
    interrupted: AtomicBool,
    waiters: AtomicU32,
}

impl Waitable {
    pub fn new() -> Self {
        Waitable {
            cond: Condvar::new(),
            interrupted: AtomicBool::new(false),
            waiters: AtomicU32::new(0),
        }
    }

    /// Atomically release `guard`'s mutex and sleep until `wakeup`,
    /// `interrupt`, or `deadline` (if given); reacquire before returning.
    pub fn sleep<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        deadline: Option<Instant>,
    ) -> (MutexGuard<'a, T>, Result<(), SchedError>) {
        if self.interrupted.load(Ordering::SeqCst) {
            return (guard, Err(SchedError::Interrupted));
        }
        self.waiters.fetch_add(1, Ordering::SeqCst);

        let (guard, timed_out) = match deadline {
            Some(deadline) => {
                let dur = deadline.saturating_duration_since(Instant::now());
                let (guard, result) = self
                    .cond
                    .wait_timeout(guard, dur)
                    .expect("waitable mutex poisoned");
                (guard, result.timed_out())
            }
            None => (self.cond.wait(guard).expect("waitable mutex poisoned"), false),
        };

        let remaining = self.waiters.fetch_sub(1, Ordering::SeqCst) - 1;
        if self.interrupted.load(Ordering::SeqCst) {
            if remaining == 0 {
                self.interrupted.store(false, Ordering::SeqCst);
            }
            return (guard, Err(SchedError::Interrupted));
        }
        if timed_out {
            return (guard, Err(SchedError::TimedOut));
        }
        (guard, Ok(()))
    }

    /// Wake every sleeper (analogous to `pthread_cond_broadcast`).
    pub fn wakeup(&self) {
        self.cond.notify_all();
    }

    /// Set the interrupted flag and wake every sleeper; each sleeper
    /// returns `Err(Interrupted)` and the last one to leave clears the flag.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.cond.notify_all();
    }
}

impl Default for Waitable {
    fn default() -> Self {
        Waitable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn wakeup_releases_a_sleeper() {
        let mutex = Arc::new(Mutex::new(0u32));
        let wait = Arc::new(Waitable::new());

        let (m2, w2) = (mutex.clone(), wait.clone());
        let handle = thread::spawn(move || {
            let guard = m2.lock().unwrap();
            let (_guard, result) = w2.sleep(guard, None);
            result
        });

        thread::sleep(Duration::from_millis(20));
        wait.wakeup();
        assert!(handle.join().unwrap().is_ok());
    }

    #[test]
    fn interrupt_wakes_with_distinguished_error() {
        let mutex = Arc::new(Mutex::new(0u32));
        let wait = Arc::new(Waitable::new());

        let (m2, w2) = (mutex.clone(), wait.clone());
        let handle = thread::spawn(move || {
            let guard = m2.lock().unwrap();
            let (_guard, result) = w2.sleep(guard, None);
            result
        });

        thread::sleep(Duration::from_millis(20));
        wait.interrupt();
        assert_eq!(handle.join().unwrap(), Err(SchedError::Interrupted));
    }

    #[test]
    fn deadline_times_out() {
        let mutex = Mutex::new(0u32);
        let wait = Waitable::new();
        let guard = mutex.lock().unwrap();
        let deadline = Instant::now() + Duration::from_millis(10);
        let (_guard, result) = wait.sleep(guard, Some(deadline));
        assert_eq!(result, Err(SchedError::TimedOut));
    }
}
