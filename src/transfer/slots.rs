//! Global download throttle.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use super::TransferError;

/// Default number of simultaneous downloads.
pub const DEFAULT_PARALLEL_DOWNLOADS: usize = 5;

/// Resizable counting semaphore bounding concurrent downloads.
///
/// Resizing only happens while every slot is free, so the semaphore never
/// has more slots checked out than its nominal capacity.
#[derive(Debug)]
pub struct DownloadSlots {
    semaphore: Arc<Semaphore>,
    capacity: Mutex<usize>,
}

impl DownloadSlots {
    /// Create `capacity` slots (at least one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity: Mutex::new(capacity),
        }
    }

    /// Wait for a free slot. The slot is released when the permit drops.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Cancelled`] if `cancel` fires first.
    pub async fn acquire(
        &self,
        cancel: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit, TransferError> {
        tokio::select! {
            permit = Arc::clone(&self.semaphore).acquire_owned() => {
                permit.map_err(|_| TransferError::Cancelled)
            }
            () = cancel.cancelled() => Err(TransferError::Cancelled),
        }
    }

    /// Nominal capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        *self.lock()
    }

    /// Slots currently checked out.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.capacity()
            .saturating_sub(self.semaphore.available_permits())
    }

    /// Change the capacity. Returns `false` (and changes nothing) while any
    /// slot is checked out.
    pub fn resize(&self, capacity: usize) -> bool {
        let capacity = capacity.max(1);
        let mut current = self.lock();
        if *current == capacity {
            return true;
        }
        if self.semaphore.available_permits() != *current {
            return false;
        }

        if capacity > *current {
            self.semaphore.add_permits(capacity - *current);
        } else {
            let shrink = u32::try_from(*current - capacity).unwrap_or(u32::MAX);
            match self.semaphore.try_acquire_many(shrink) {
                Ok(permits) => permits.forget(),
                Err(_) => return false,
            }
        }
        log::debug!("Download slots resized {} -> {}", *current, capacity);
        *current = capacity;
        true
    }

    fn lock(&self) -> MutexGuard<'_, usize> {
        self.capacity.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for DownloadSlots {
    fn default() -> Self {
        Self::new(DEFAULT_PARALLEL_DOWNLOADS)
    }
}
