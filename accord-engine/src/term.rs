//! Cooperative termination
//!
//! The process-wide pending-termination flag is the one permitted global:
//! signal handlers set it, and every blocking loop checks it before entering
//! and after leaving a suspension point. Everything else threads state
//! through [`EngineState`](crate::EngineState).

use std::sync::atomic::{AtomicBool, Ordering};

static PENDING_TERMINATION: AtomicBool = AtomicBool::new(false);

/// True once a termination signal has been received.
pub fn pending_termination() -> bool {
    PENDING_TERMINATION.load(Ordering::SeqCst)
}

/// Request cooperative shutdown. Safe to call from a signal handler.
pub fn set_pending_termination() {
    PENDING_TERMINATION.store(true, Ordering::SeqCst);
}

/// Reset the flag; used at daemon start and by tests.
pub fn clear_pending_termination() {
    PENDING_TERMINATION.store(false, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_roundtrip() {
        clear_pending_termination();
        assert!(!pending_termination());
        set_pending_termination();
        assert!(pending_termination());
        clear_pending_termination();
    }
}
