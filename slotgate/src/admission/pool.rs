//! Slot pool implementation.
//!
//! Slots travel through a bounded mpsc channel sized to the pool capacity. The
//! receiving half sits behind a tokio `Mutex`, which hands out its lock in FIFO
//! order, so callers parked in `acquire()` receive slots in arrival order.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tokio::sync::{Mutex, mpsc};

/// Identifier of a slot. Only used for logging; slots are interchangeable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(usize);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}", self.0)
    }
}

#[derive(Debug, Default)]
struct SlotLedger {
    available: AtomicUsize,
    acquired: AtomicU64,
    released: AtomicU64,
}

/// A slot held by one in-flight request - returns to the pool on drop.
#[must_use = "dropping a permit immediately returns its slot to the pool"]
#[derive(Debug)]
pub struct SlotPermit {
    slot_id: SlotId,
    pool_tx: mpsc::Sender<SlotId>,
    ledger: Arc<SlotLedger>,
}

impl SlotPermit {
    pub fn slot_id(&self) -> SlotId {
        self.slot_id
    }
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        // Count the slot as available before it becomes receivable, so the
        // acquirer's decrement can never run ahead of this increment.
        self.ledger.available.fetch_add(1, Ordering::AcqRel);

        match self.pool_tx.try_send(self.slot_id) {
            Ok(()) => {
                self.ledger.released.fetch_add(1, Ordering::AcqRel);
                tracing::trace!(slot = %self.slot_id, "Slot returned to pool");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.ledger.available.fetch_sub(1, Ordering::AcqRel);
                tracing::debug!(slot = %self.slot_id, "Pool closed - slot discarded");
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.ledger.available.fetch_sub(1, Ordering::AcqRel);
                debug_assert!(false, "slot {} returned to a full pool", self.slot_id);
                tracing::error!(slot = %self.slot_id, "Bug: slot returned to a full pool");
            }
        }
    }
}

/// Fixed-capacity pool of backend slots.
pub struct SlotPool {
    available_rx: Mutex<mpsc::Receiver<SlotId>>,
    available_tx: mpsc::Sender<SlotId>,
    capacity: usize,
    ledger: Arc<SlotLedger>,
}

impl SlotPool {
    /// Largest capacity a pool can be built with.
    pub const MAX_CAPACITY: usize = 65_536;

    /// Build a pool with every slot available.
    ///
    /// Capacities above [`SlotPool::MAX_CAPACITY`] are clamped to it.
    pub fn new(capacity: NonZeroUsize) -> Self {
        if capacity.get() > Self::MAX_CAPACITY {
            tracing::warn!(
                requested = capacity.get(),
                limit = Self::MAX_CAPACITY,
                "Slot capacity clamped"
            );
        }
        let capacity = capacity.get().min(Self::MAX_CAPACITY);
        let (tx, rx) = mpsc::channel(capacity);
        let ledger = Arc::new(SlotLedger::default());

        for index in 0..capacity {
            if let Err(e) = tx.try_send(SlotId(index)) {
                tracing::error!(slot = index, error = %e, "Failed to add slot to pool");
            } else {
                ledger.available.fetch_add(1, Ordering::AcqRel);
            }
        }

        Self {
            available_rx: Mutex::new(rx),
            available_tx: tx,
            capacity,
            ledger,
        }
    }

    /// Wait until a slot is free and take it.
    ///
    /// There is no timeout. Dropping the returned future abandons the wait
    /// without consuming a slot. Returns `None` only if the pool is closed,
    /// which cannot happen while the pool itself is alive.
    pub async fn acquire(&self) -> Option<SlotPermit> {
        let mut rx = self.available_rx.lock().await;
        let slot_id = rx.recv().await?;
        Some(self.check_out(slot_id))
    }

    /// Take a slot only if one is free right now.
    pub fn try_acquire(&self) -> Option<SlotPermit> {
        let mut rx = self.available_rx.try_lock().ok()?;
        let slot_id = rx.try_recv().ok()?;
        Some(self.check_out(slot_id))
    }

    /// Return a slot, waking at most one waiting `acquire()`.
    pub fn release(&self, permit: SlotPermit) {
        debug_assert!(
            permit.pool_tx.same_channel(&self.available_tx),
            "slot {} released to a foreign pool",
            permit.slot_id
        );
        drop(permit);
    }

    fn check_out(&self, slot_id: SlotId) -> SlotPermit {
        self.ledger.available.fetch_sub(1, Ordering::AcqRel);
        self.ledger.acquired.fetch_add(1, Ordering::AcqRel);
        SlotPermit {
            slot_id,
            pool_tx: self.available_tx.clone(),
            ledger: Arc::clone(&self.ledger),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.ledger.available.load(Ordering::Acquire)
    }

    pub fn in_use(&self) -> usize {
        self.capacity.saturating_sub(self.available())
    }

    /// Total slots handed out over the pool's lifetime.
    pub fn acquired(&self) -> u64 {
        self.ledger.acquired.load(Ordering::Acquire)
    }

    /// Total slots returned over the pool's lifetime.
    pub fn released(&self) -> u64 {
        self.ledger.released.load(Ordering::Acquire)
    }
}

impl fmt::Debug for SlotPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotPool")
            .field("capacity", &self.capacity)
            .field("available", &self.available())
            .finish()
    }
}
