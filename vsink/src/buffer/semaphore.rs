// SPDX-FileCopyrightText: 2025 Contributors to the vsink project.
// SPDX-License-Identifier: Apache-2.0

//! Counting semaphore for free pool slots.

use std::{
    sync::{Condvar, Mutex, MutexGuard},
    time::Instant,
};

use crate::{Error, Result};

/// Outcome of a bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Acquire {
    /// A unit was taken.
    Acquired,
    /// A waiter was woken without a unit, e.g. because releases were queued
    /// from another thread and need draining.
    Nudged,
    TimedOut,
}

#[derive(Debug)]
struct State {
    count: usize,
    flushing: bool,
    nudged: bool,
}

/// Counts free slots. Waiting is interruptible through
/// [`Semaphore::set_flushing`] and [`Semaphore::nudge`].
#[derive(Debug)]
pub(crate) struct Semaphore {
    state: Mutex<State>,
    cond: Condvar,
}

impl Semaphore {
    pub(crate) fn new(count: usize) -> Self {
        Self {
            state: Mutex::new(State {
                count,
                flushing: false,
                nudged: false,
            }),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Takes one unit, waiting until `deadline` (forever when `None`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Flushing`] while flushing is set.
    pub(crate) fn acquire_until(&self, deadline: Option<Instant>) -> Result<Acquire> {
        let mut state = self.lock();
        loop {
            if state.flushing {
                return Err(Error::Flushing);
            }
            if state.count > 0 {
                state.count -= 1;
                return Ok(Acquire::Acquired);
            }
            if state.nudged {
                state.nudged = false;
                return Ok(Acquire::Nudged);
            }
            state = match deadline {
                None => self.cond.wait(state).unwrap_or_else(|e| e.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(Acquire::TimedOut);
                    }
                    self.cond
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0
                }
            };
        }
    }

    /// Returns one unit and wakes a waiter.
    pub(crate) fn post(&self) {
        self.lock().count += 1;
        self.cond.notify_one();
    }

    /// Wakes one waiter without returning a unit.
    pub(crate) fn nudge(&self) {
        self.lock().nudged = true;
        self.cond.notify_one();
    }

    pub(crate) fn set_flushing(&self, flushing: bool) {
        self.lock().flushing = flushing;
        self.cond.notify_all();
    }

    pub(crate) fn is_flushing(&self) -> bool {
        self.lock().flushing
    }

    pub(crate) fn available(&self) -> usize {
        self.lock().count
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Duration};

    use super::*;

    #[test]
    fn counts_down_then_times_out() {
        let sem = Semaphore::new(1);
        assert_eq!(sem.acquire_until(None).unwrap(), Acquire::Acquired);
        let deadline = Instant::now() + Duration::from_millis(10);
        assert_eq!(
            sem.acquire_until(Some(deadline)).unwrap(),
            Acquire::TimedOut
        );
    }

    #[test]
    fn flushing_wakes_blocked_waiter() {
        let sem = Arc::new(Semaphore::new(0));
        let waiter = {
            let sem = sem.clone();
            thread::spawn(move || sem.acquire_until(None))
        };
        thread::sleep(Duration::from_millis(20));
        sem.set_flushing(true);
        assert!(matches!(waiter.join().unwrap(), Err(Error::Flushing)));
    }

    #[test]
    fn nudge_is_consumed_once() {
        let sem = Semaphore::new(0);
        sem.nudge();
        assert_eq!(sem.acquire_until(None).unwrap(), Acquire::Nudged);
        let deadline = Instant::now() + Duration::from_millis(5);
        assert_eq!(
            sem.acquire_until(Some(deadline)).unwrap(),
            Acquire::TimedOut
        );
    }

    #[test]
    fn nudge_wakes_a_blocked_waiter() {
        let sem = Arc::new(Semaphore::new(0));
        let waiter = {
            let sem = sem.clone();
            thread::spawn(move || sem.acquire_until(None))
        };
        thread::sleep(Duration::from_millis(20));
        sem.nudge();
        assert_eq!(waiter.join().unwrap().unwrap(), Acquire::Nudged);
        assert_eq!(sem.available(), 0);
    }
}
