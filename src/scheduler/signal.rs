//! Per-generation cancellation signal.
//!
//! A fresh [`GenerationSignal`] is minted for every cohort, so a stale flag
//! from a previous session identity can never leak into the next one.
//! Two flags are carried:
//!
//! - **exhausted**: raised at most once, by the first worker that sees the
//!   session identity run out of quota
//! - **shutdown**: raised by the orchestrator when the cohort should stop
//!   (queue drained, exhaustion observed, or a fatal store error)
//!
//! Both are cooperative: workers observe them at their next queue poll and
//! never abort an in-flight driver call.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Flags {
    exhausted: bool,
    shutdown: bool,
}

/// Shared stop signal for one cohort generation.
#[derive(Debug, Clone)]
pub struct GenerationSignal {
    generation: usize,
    flags: Arc<watch::Sender<Flags>>,
}

impl GenerationSignal {
    /// Creates an unset signal for the given generation index.
    pub fn new(generation: usize) -> Self {
        let (tx, _) = watch::channel(Flags::default());
        Self {
            generation,
            flags: Arc::new(tx),
        }
    }

    /// Returns the generation this signal belongs to.
    pub fn generation(&self) -> usize {
        self.generation
    }

    /// Raises the resource-exhausted flag.
    ///
    /// Returns `true` only for the call that actually set it.
    pub fn raise_exhausted(&self) -> bool {
        self.flags.send_if_modified(|flags| {
            if flags.exhausted {
                false
            } else {
                flags.exhausted = true;
                true
            }
        })
    }

    /// Asks every worker of this generation to stop after its current task.
    pub fn request_shutdown(&self) {
        self.flags.send_if_modified(|flags| {
            if flags.shutdown {
                false
            } else {
                flags.shutdown = true;
                true
            }
        });
    }

    /// Returns whether the session identity was reported exhausted.
    pub fn is_exhausted(&self) -> bool {
        self.flags.borrow().exhausted
    }

    /// Returns whether shutdown was requested.
    pub fn is_shutdown_requested(&self) -> bool {
        self.flags.borrow().shutdown
    }

    /// Returns whether a worker should stop pulling tasks.
    pub fn should_stop(&self) -> bool {
        let flags = *self.flags.borrow();
        flags.exhausted || flags.shutdown
    }

    /// Resolves once the exhausted flag is raised.
    pub async fn exhausted(&self) {
        let mut rx = self.flags.subscribe();
        let _ = rx.wait_for(|flags| flags.exhausted).await;
    }

    /// Resolves once either flag is raised.
    pub async fn stopped(&self) {
        let mut rx = self.flags.subscribe();
        let _ = rx.wait_for(|flags| flags.exhausted || flags.shutdown).await;
    }
}
