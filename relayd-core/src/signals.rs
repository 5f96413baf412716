//! Signal tracking for the master and worker processes (spec.md §5).
//!
//! Adapted from `mptc::signals::SignalTracker`: same
//! register-once-into-an-`Arc<AtomicBool>` shape, but split into two
//! trackers because the master and the worker react to the same signal
//! numbers differently (spec.md §5's signal table), and the master
//! additionally distinguishes a forced stop from a graceful one.

use signal_hook as sigs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// `SIGINT` / `SIGQUIT`: forced stop (master), interrupt-the-loop (worker).
pub const SIG_FORCED: i32 = sigs::consts::SIGQUIT;
pub const SIG_FORCED_ALT: i32 = sigs::consts::SIGINT;
/// `SIGTERM`: graceful stop.
pub const SIG_GRACEFUL: i32 = sigs::consts::SIGTERM;
/// `SIGHUP`: hot reload (master); drain-and-exit (worker).
pub const SIG_RELOAD: i32 = sigs::consts::SIGHUP;

/// Tracks the signals the master cares about: forced stop, graceful
/// stop, and reload. Cloned and handed to any thread that needs to
/// observe these flags (e.g. the monitor loop and the proxy control
/// connection thread).
#[derive(Debug, Clone)]
pub struct MasterSignals {
    forced_stop: Arc<AtomicBool>,
    graceful_stop: Arc<AtomicBool>,
    reload: Arc<AtomicBool>,
}

impl Default for MasterSignals {
    fn default() -> Self {
        Self::new()
    }
}

impl MasterSignals {
    pub fn new() -> Self {
        MasterSignals {
            forced_stop: Arc::new(AtomicBool::new(false)),
            graceful_stop: Arc::new(AtomicBool::new(false)),
            reload: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Register handlers for SIGINT/SIGQUIT/SIGTERM/SIGHUP. Panics if
    /// registration fails, on the assumption the master should not run
    /// at all without working signal handling.
    pub fn install(&self) {
        for sig in [SIG_FORCED, SIG_FORCED_ALT] {
            sigs::flag::register(sig, self.forced_stop.clone())
                .unwrap_or_else(|e| panic!("cannot register signal {sig}: {e}"));
        }
        sigs::flag::register(SIG_GRACEFUL, self.graceful_stop.clone())
            .unwrap_or_else(|e| panic!("cannot register signal {SIG_GRACEFUL}: {e}"));
        sigs::flag::register(SIG_RELOAD, self.reload.clone())
            .unwrap_or_else(|e| panic!("cannot register signal {SIG_RELOAD}: {e}"));
    }

    pub fn forced_stop_requested(&self) -> bool {
        self.forced_stop.load(Ordering::Relaxed)
    }

    pub fn graceful_stop_requested(&self) -> bool {
        self.graceful_stop.load(Ordering::Relaxed)
    }

    pub fn any_stop_requested(&self) -> bool {
        self.forced_stop_requested() || self.graceful_stop_requested()
    }

    pub fn reload_requested(&self) -> bool {
        self.reload.load(Ordering::Relaxed)
    }

    /// Acknowledge a reload request so it can be raised again later.
    pub fn clear_reload(&self) {
        self.reload.store(false, Ordering::Relaxed);
    }

    /// Used by tests and by `Master::stop()` to simulate a signal
    /// without actually raising one.
    pub fn request_graceful_stop(&self) {
        self.graceful_stop.store(true, Ordering::Relaxed);
    }

    pub fn request_forced_stop(&self) {
        self.forced_stop.store(true, Ordering::Relaxed);
    }

    pub fn request_reload(&self) {
        self.reload.store(true, Ordering::Relaxed);
    }
}

/// Tracks the signals a worker process cares about. SIGINT/SIGQUIT
/// interrupt the run loop immediately; SIGTERM/SIGHUP ask it to finish
/// its current task and then exit (spec.md §5).
#[derive(Debug, Clone)]
pub struct WorkerSignals {
    interrupt: Arc<AtomicBool>,
    enable: Arc<AtomicBool>,
}

impl Default for WorkerSignals {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerSignals {
    pub fn new() -> Self {
        WorkerSignals {
            interrupt: Arc::new(AtomicBool::new(false)),
            enable: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn install(&self) {
        for sig in [SIG_FORCED, SIG_FORCED_ALT] {
            sigs::flag::register(sig, self.interrupt.clone())
                .unwrap_or_else(|e| panic!("cannot register signal {sig}: {e}"));
        }
        // `enable` starts `true`; SIGTERM/SIGHUP need to flip it to
        // `false`, which signal-hook's `flag::register` can't do
        // directly (it only sets `true`), so we register our own
        // low-level action for those two.
        let enable = self.enable.clone();
        unsafe {
            sigs::low_level::register(SIG_GRACEFUL, move || {
                enable.store(false, Ordering::Relaxed);
            })
            .unwrap_or_else(|e| panic!("cannot register signal {SIG_GRACEFUL}: {e}"));
        }
        let enable = self.enable.clone();
        unsafe {
            sigs::low_level::register(SIG_RELOAD, move || {
                enable.store(false, Ordering::Relaxed);
            })
            .unwrap_or_else(|e| panic!("cannot register signal {SIG_RELOAD}: {e}"));
        }
    }

    /// `true` once SIGINT/SIGQUIT has been received; the worker should
    /// stop whatever it's doing right away.
    pub fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::Relaxed)
    }

    /// `false` once SIGTERM/SIGHUP has been received; the worker should
    /// finish its in-flight task, then exit instead of taking another.
    pub fn enabled(&self) -> bool {
        self.enable.load(Ordering::Relaxed) && !self.interrupted()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_signals_start_clear() {
        let s = MasterSignals::new();
        assert!(!s.any_stop_requested());
        assert!(!s.reload_requested());
    }

    #[test]
    fn master_reload_is_idempotent_and_clearable() {
        let s = MasterSignals::new();
        s.request_reload();
        s.request_reload();
        assert!(s.reload_requested());
        s.clear_reload();
        assert!(!s.reload_requested());
    }

    #[test]
    fn worker_signals_start_enabled() {
        let s = WorkerSignals::new();
        assert!(s.enabled());
        assert!(!s.interrupted());
    }

    #[test]
    fn worker_interrupt_disables_regardless_of_enable_flag() {
        let s = WorkerSignals::new();
        s.interrupt.store(true, Ordering::Relaxed);
        assert!(!s.enabled());
        assert!(s.interrupted());
    }
}
