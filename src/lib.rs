//! modcache - Content-addressed cache for cosmetic mod assets
//!
//! Keeps a persistent index from content hash to file location across a
//! user's mod root and a download cache root, reconciles it with the
//! filesystem through full scans and debounced watcher events, enforces a
//! size quota on the cache, and moves payloads to and from a relay.

pub mod app;
pub mod cancel;
pub mod cli;
pub mod config;
pub mod error;
pub mod governor;
pub mod halt;
pub mod index;
pub mod logging;
pub mod monitor;
pub mod progress;
pub mod report;
pub mod scanner;
pub mod signal;
pub mod transfer;

pub use app::run_app;
