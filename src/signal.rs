//! Ctrl+C handling for the long-running commands.
//!
//! The handler cancels a process-wide [`CancellationToken`]. Each call to
//! [`install_handler`] hands out a child of that token, so `watch` can pass
//! it straight into the monitor and transfer pipeline while `scan` polls
//! [`ShutdownHandler::is_shutdown_requested`] between phases.
//!
//! When a signal is received the token is cancelled, "Interrupted. Cleaning
//! up..." is printed to stderr, and the command should exit with
//! [`ExitCode::Interrupted`](crate::error::ExitCode::Interrupted).

use std::io::Write;
use std::sync::OnceLock;

use tokio_util::sync::CancellationToken;

static GLOBAL_TOKEN: OnceLock<CancellationToken> = OnceLock::new();

/// Shutdown flag shared between the signal handler and the workers.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandler {
    token: CancellationToken,
}

impl ShutdownHandler {
    /// A handler that only responds to [`request_shutdown`](Self::request_shutdown).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` once Ctrl+C was pressed or shutdown was requested.
    #[must_use]
    pub fn is_shutdown_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Request shutdown manually.
    pub fn request_shutdown(&self) {
        self.token.cancel();
    }

    /// Token cancelled on shutdown, for async tasks and scans.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Resolves once shutdown is requested.
    pub async fn wait(&self) {
        self.token.cancelled().await;
    }
}

/// Error type for signal handler installation.
#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    /// Failed to install the Ctrl+C handler.
    #[error("Failed to install signal handler: {0}")]
    InstallFailed(#[from] ctrlc::Error),
}

/// Install the Ctrl+C handler (once per process) and return a handler
/// whose token is a child of the process-wide shutdown token.
///
/// Later calls reuse the installed hook, so tests can call this freely.
///
/// # Errors
///
/// Returns an error if the hook cannot be registered the first time.
pub fn install_handler() -> Result<ShutdownHandler, SignalError> {
    if let Some(root) = GLOBAL_TOKEN.get() {
        return Ok(ShutdownHandler {
            token: root.child_token(),
        });
    }

    let root = CancellationToken::new();
    let hooked = root.clone();
    match ctrlc::set_handler(move || {
        hooked.cancel();
        let _ = writeln!(std::io::stderr(), "\nInterrupted. Cleaning up...");
        let _ = std::io::stderr().flush();
        log::info!("Shutdown signal received");
    }) {
        Ok(()) => {}
        Err(ctrlc::Error::MultipleHandlers) => {
            log::debug!("Ctrl+C handler already registered, using unhooked token");
        }
        Err(e) => return Err(e.into()),
    }

    let root = GLOBAL_TOKEN.get_or_init(|| root);
    Ok(ShutdownHandler {
        token: root.child_token(),
    })
}
