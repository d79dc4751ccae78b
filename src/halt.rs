//! Named, reference-counted halt gate.
//!
//! Unrelated subsystems pause scanning and transfers by calling
//! [`HaltGate::halt`] with a reason string and later release it with
//! [`HaltGate::resume`]. The same reason may be held several times; work
//! resumes only once every hold on every reason has been released.
//!
//! Async waiters subscribe through a `tokio::sync::watch` channel carrying
//! the current list of active reasons, so they wake on every change instead
//! of polling.
//!
//! # Example
//!
//! ```
//! use modcache::halt::HaltGate;
//!
//! let gate = HaltGate::new();
//! gate.halt("cutscene");
//! gate.halt("gpose");
//! gate.resume("cutscene");
//! assert!(gate.is_halted());
//! gate.resume("gpose");
//! assert!(!gate.is_halted());
//! ```

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Reason prefix used by the transfer pipeline for its own holds.
pub const TRANSFER_REASON_PREFIX: &str = "transfer:";

/// Shared halt/resume state.
#[derive(Debug)]
pub struct HaltGate {
    holds: Mutex<BTreeMap<String, usize>>,
    active: watch::Sender<Vec<String>>,
}

impl HaltGate {
    /// Create an open gate.
    #[must_use]
    pub fn new() -> Self {
        let (active, _) = watch::channel(Vec::new());
        Self {
            holds: Mutex::new(BTreeMap::new()),
            active,
        }
    }

    /// Add one hold for `reason`.
    pub fn halt(&self, reason: &str) {
        let mut holds = self.lock();
        let count = holds.entry(reason.to_string()).or_insert(0);
        *count += 1;
        log::debug!("Halt requested by {} (held {}x)", reason, count);
        self.publish(&holds);
    }

    /// Release one hold for `reason`. Returns `false` if `reason` held nothing.
    pub fn resume(&self, reason: &str) -> bool {
        let mut holds = self.lock();
        let Some(count) = holds.get_mut(reason) else {
            log::debug!("Resume from {} ignored: no active halt", reason);
            return false;
        };
        *count -= 1;
        if *count == 0 {
            holds.remove(reason);
        }
        log::debug!("Resume from {} ({} reason(s) still active)", reason, holds.len());
        self.publish(&holds);
        true
    }

    /// Hold `reason` until the returned guard is dropped.
    #[must_use]
    pub fn hold(self: &Arc<Self>, reason: &str) -> HaltGuard {
        self.halt(reason);
        HaltGuard {
            gate: Arc::clone(self),
            reason: reason.to_string(),
        }
    }

    /// Whether any hold is active.
    #[must_use]
    pub fn is_halted(&self) -> bool {
        !self.lock().is_empty()
    }

    /// Whether any hold whose reason does not start with `prefix` is active.
    #[must_use]
    pub fn is_halted_except(&self, prefix: &str) -> bool {
        self.lock().keys().any(|reason| !reason.starts_with(prefix))
    }

    /// Active reasons, sorted.
    #[must_use]
    pub fn reasons(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Receiver notified whenever the set of active reasons changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Vec<String>> {
        self.active.subscribe()
    }

    /// Wait until no hold is active. Returns `false` if `cancel` fired first.
    pub async fn wait_resumed(&self, cancel: &CancellationToken) -> bool {
        self.wait_until(cancel, |reasons| reasons.is_empty()).await
    }

    /// Wait until no hold outside `prefix` is active. Returns `false` if
    /// `cancel` fired first.
    pub async fn wait_clear_except(&self, prefix: &str, cancel: &CancellationToken) -> bool {
        self.wait_until(cancel, |reasons| {
            reasons.iter().all(|reason| reason.starts_with(prefix))
        })
        .await
    }

    async fn wait_until<F>(&self, cancel: &CancellationToken, clear: F) -> bool
    where
        F: Fn(&[String]) -> bool,
    {
        let mut rx = self.subscribe();
        loop {
            let open = clear(&rx.borrow_and_update());
            if open {
                return true;
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
                () = cancel.cancelled() => return false,
            }
        }
    }

    fn publish(&self, holds: &BTreeMap<String, usize>) {
        self.active.send_replace(holds.keys().cloned().collect());
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, usize>> {
        self.holds.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for HaltGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Releases its hold when dropped.
#[derive(Debug)]
pub struct HaltGuard {
    gate: Arc<HaltGate>,
    reason: String,
}

impl Drop for HaltGuard {
    fn drop(&mut self) {
        self.gate.resume(&self.reason);
    }
}
