//! Signal handling: SIGTERM/SIGINT graceful shutdown and SIGUSR1 manual
//! backup trigger.
//!
//! Uses the `signal-hook` crate for safe signal registration. The main loop
//! polls `SignalHandler` flags each tick rather than blocking on signals.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use signal_hook::consts::{SIGINT, SIGTERM};

/// Thread-safe signal state shared between the signal handler and the main loop.
///
/// All flags use `Ordering::Relaxed` because the main loop polls them every
/// tick and exact ordering with other atomics is not required.
#[derive(Clone)]
pub struct SignalHandler {
    shutdown_flag: Arc<AtomicBool>,
    backup_flag: Arc<AtomicBool>,
}

impl SignalHandler {
    /// Create a new handler and register OS signal hooks.
    ///
    /// On Unix: SIGTERM/SIGINT -> shutdown, SIGUSR1 -> immediate backup pass.
    /// Registration is best-effort; failures are logged to stderr but not fatal.
    pub fn new() -> Self {
        let handler = Self {
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            backup_flag: Arc::new(AtomicBool::new(false)),
        };
        handler.register_signals();
        handler
    }

    /// Check whether a shutdown has been requested.
    pub fn should_shutdown(&self) -> bool {
        self.shutdown_flag.load(Ordering::Relaxed)
    }

    /// Check (and clear) whether a manual backup pass has been requested.
    pub fn should_backup(&self) -> bool {
        self.backup_flag.swap(false, Ordering::Relaxed)
    }

    /// Programmatically request shutdown.
    pub fn request_shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
    }

    /// Programmatically request a backup pass.
    pub fn request_backup(&self) {
        self.backup_flag.store(true, Ordering::Relaxed);
    }

    fn register_signals(&self) {
        if let Err(e) = signal_hook::flag::register(SIGTERM, Arc::clone(&self.shutdown_flag)) {
            eprintln!("[RSN-SIGNAL] failed to register SIGTERM: {e}");
        }
        if let Err(e) = signal_hook::flag::register(SIGINT, Arc::clone(&self.shutdown_flag)) {
            eprintln!("[RSN-SIGNAL] failed to register SIGINT: {e}");
        }

        #[cfg(unix)]
        {
            use signal_hook::consts::SIGUSR1;
            if let Err(e) = signal_hook::flag::register(SIGUSR1, Arc::clone(&self.backup_flag)) {
                eprintln!("[RSN-SIGNAL] failed to register SIGUSR1: {e}");
            }
        }
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_start_clear() {
        let handler = SignalHandler::new();
        assert!(!handler.should_shutdown());
        assert!(!handler.should_backup());
    }

    #[test]
    fn programmatic_shutdown_is_sticky() {
        let handler = SignalHandler::new();
        handler.request_shutdown();
        assert!(handler.should_shutdown());
        assert!(handler.should_shutdown());
    }

    #[test]
    fn backup_request_clears_on_read() {
        let handler = SignalHandler::new();
        handler.request_backup();
        assert!(handler.should_backup());
        assert!(!handler.should_backup());
    }

    #[test]
    fn clones_share_flag_state() {
        let handler = SignalHandler::new();
        let clone = handler.clone();
        clone.request_shutdown();
        assert!(handler.should_shutdown());
    }
}
