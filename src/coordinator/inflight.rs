use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Notify;

use crate::error::{RelayError, Result};

/// Count of requests handed to the connector pool and not yet answered.
///
/// Never exceeds `capacity`; a release without a matching acquire is a
/// protocol violation.
#[derive(Debug)]
pub struct InFlight {
    current: AtomicUsize,
    peak: AtomicUsize,
    capacity: usize,
    released: Notify,
}

impl InFlight {
    pub fn new(capacity: usize) -> Self {
        Self {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            capacity,
            released: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    /// Highest value observed since start
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn has_room_for(&self, batch: usize) -> bool {
        self.current() + batch <= self.capacity
    }

    pub fn try_acquire(&self) -> bool {
        let acquired = self
            .current
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.capacity).then_some(n + 1)
            });

        match acquired {
            Ok(previous) => {
                self.peak.fetch_max(previous + 1, Ordering::SeqCst);
                true
            }
            Err(_) => false,
        }
    }

    /// Wait until a slot is free and take it.
    pub async fn acquire(&self) {
        loop {
            let released = self.released.notified();
            if self.try_acquire() {
                return;
            }
            released.await;
        }
    }

    pub fn release(&self) -> Result<()> {
        self.current
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .map_err(|_| RelayError::protocol("in-flight counter underflow"))?;
        self.released.notify_waiters();
        Ok(())
    }

    /// Poll until every request has been answered.
    pub async fn wait_idle(&self, poll: Duration) {
        while self.current() > 0 {
            tokio::time::sleep(poll).await;
        }
    }
}
