//! Cancel-and-replace handles for long-running operation classes.
//!
//! Each operation class (full scan, upload batch, download batch) owns one
//! [`OperationSlot`]. Starting a new run calls [`OperationSlot::renew`],
//! which cancels the previous token and installs a fresh one under the same
//! lock, so at most one live run exists per class. The generation counter
//! lets a finishing run check whether it has been superseded.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct Current {
    generation: u64,
    token: CancellationToken,
}

/// Generation counter plus the cancellation token of the live run.
#[derive(Debug)]
pub struct OperationSlot {
    name: &'static str,
    parent: Option<CancellationToken>,
    current: Mutex<Current>,
}

impl OperationSlot {
    /// Create a slot whose first token is already cancelled (nothing runs yet).
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        let token = CancellationToken::new();
        token.cancel();
        Self {
            name,
            parent: None,
            current: Mutex::new(Current {
                generation: 0,
                token,
            }),
        }
    }

    /// Tokens issued by this slot are children of `parent`, so cancelling
    /// `parent` (e.g. on shutdown) cancels the live run too.
    #[must_use]
    pub fn with_parent(mut self, parent: CancellationToken) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Cancel the current run and install a new token. Returns the new
    /// generation and its token.
    pub fn renew(&self) -> (u64, CancellationToken) {
        let mut current = self.lock();
        current.token.cancel();
        current.generation += 1;
        current.token = match &self.parent {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        log::trace!("{} slot renewed (generation {})", self.name, current.generation);
        (current.generation, current.token.clone())
    }

    /// Cancel the current run without starting another.
    pub fn cancel(&self) {
        let current = self.lock();
        if !current.token.is_cancelled() {
            log::debug!("Cancelling {} (generation {})", self.name, current.generation);
        }
        current.token.cancel();
    }

    /// Current generation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Whether `generation` is still the live run.
    #[must_use]
    pub fn is_current(&self, generation: u64) -> bool {
        let current = self.lock();
        current.generation == generation && !current.token.is_cancelled()
    }

    fn lock(&self) -> MutexGuard<'_, Current> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
