//! Count of requests currently admitted for consideration.
//!
//! A request is counted from arrival until its handling completes, whether it
//! is waiting for a slot, forwarding, or about to be rejected.

use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
pub struct ConcurrencyCounter {
    count: Mutex<usize>,
}

impl ConcurrencyCounter {
    pub fn new() -> Self {
        Self::default()
    }

    // The guarded value is a plain integer, so a poisoned lock still holds a
    // consistent count.
    fn lock(&self) -> MutexGuard<'_, usize> {
        self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn increment(&self) {
        *self.lock() += 1;
    }

    /// Decrementing more often than incrementing is a bug: it panics in debug
    /// builds and is logged and ignored otherwise.
    pub fn decrement(&self) {
        let mut count = self.lock();
        if *count == 0 {
            drop(count);
            debug_assert!(false, "concurrency counter decremented below zero");
            tracing::error!("Bug: concurrency counter decremented below zero");
            return;
        }
        *count -= 1;
    }

    pub fn read(&self) -> usize {
        *self.lock()
    }

    /// Count a request in, refusing it if the new count would exceed `ceiling`.
    ///
    /// Increment, check and undo run in one critical section, so concurrent
    /// arrivals cannot both observe each other's increment and both bail out.
    /// On refusal returns the count the request would have produced.
    pub fn enter(&self, ceiling: Option<usize>) -> Result<CounterTicket<'_>, usize> {
        let mut count = self.lock();
        *count += 1;
        let current = *count;

        if let Some(ceiling) = ceiling
            && current > ceiling
        {
            *count -= 1;
            return Err(current);
        }

        Ok(CounterTicket {
            counter: self,
            count_at_entry: current,
        })
    }
}

/// Proof that a request is counted. Decrements the counter exactly once on drop.
#[must_use = "dropping the ticket immediately uncounts the request"]
#[derive(Debug)]
pub struct CounterTicket<'a> {
    counter: &'a ConcurrencyCounter,
    count_at_entry: usize,
}

impl CounterTicket<'_> {
    /// Counter value right after this request was counted.
    pub fn count_at_entry(&self) -> usize {
        self.count_at_entry
    }
}

impl Drop for CounterTicket<'_> {
    fn drop(&mut self) {
        self.counter.decrement();
    }
}
