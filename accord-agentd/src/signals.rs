//! Signal handling
//!
//! SIGTERM/SIGINT request cooperative shutdown through the pending-
//! termination flag; SIGHUP requests a policy reload; SIGUSR1/SIGUSR2 flip
//! the verbosity toggles; SIGPIPE is ignored in the daemon (children get
//! the default back via exec).

use accord_engine::set_pending_termination;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;

/// Flags flipped by signal handlers, polled by the daemon loop.
#[derive(Clone)]
pub struct SignalFlags {
    pub reload_requested: Arc<AtomicBool>,
    pub verbose_toggle: Arc<AtomicBool>,
    /// Woken whenever any signal arrives so sleeps cut short.
    pub wakeup: Arc<Notify>,
}

impl SignalFlags {
    pub fn new() -> Self {
        Self {
            reload_requested: Arc::new(AtomicBool::new(false)),
            verbose_toggle: Arc::new(AtomicBool::new(false)),
            wakeup: Arc::new(Notify::new()),
        }
    }

    pub fn take_reload_request(&self) -> bool {
        self.reload_requested.swap(false, Ordering::SeqCst)
    }
}

impl Default for SignalFlags {
    fn default() -> Self {
        Self::new()
    }
}

/// Ignore SIGPIPE for the daemon process.
pub fn ignore_sigpipe() {
    use nix::sys::signal::{self, SigHandler, Signal};
    // Installing SIG_IGN is async-signal-safe and has no handler body.
    unsafe {
        let _ = signal::signal(Signal::SIGPIPE, SigHandler::SigIgn);
    }
}

/// Spawn the listener tasks. Each sets its flag and pokes the wakeup so
/// every suspension point notices promptly.
pub fn install(flags: &SignalFlags) -> std::io::Result<()> {
    spawn_terminator(SignalKind::terminate(), flags.wakeup.clone())?;
    spawn_terminator(SignalKind::interrupt(), flags.wakeup.clone())?;

    let mut hup = signal(SignalKind::hangup())?;
    let reload = flags.reload_requested.clone();
    let wakeup = flags.wakeup.clone();
    tokio::spawn(async move {
        while hup.recv().await.is_some() {
            tracing::info!("SIGHUP received, reload requested");
            reload.store(true, Ordering::SeqCst);
            wakeup.notify_waiters();
        }
    });

    let mut usr1 = signal(SignalKind::user_defined1())?;
    let mut usr2 = signal(SignalKind::user_defined2())?;
    let verbose = flags.verbose_toggle.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                received = usr1.recv() => {
                    if received.is_none() { break; }
                    verbose.store(true, Ordering::SeqCst);
                    tracing::info!("SIGUSR1: verbose diagnostics on");
                }
                received = usr2.recv() => {
                    if received.is_none() { break; }
                    verbose.store(false, Ordering::SeqCst);
                    tracing::info!("SIGUSR2: verbose diagnostics off");
                }
            }
        }
    });

    Ok(())
}

fn spawn_terminator(kind: SignalKind, wakeup: Arc<Notify>) -> std::io::Result<()> {
    let mut stream = signal(kind)?;
    tokio::spawn(async move {
        if stream.recv().await.is_some() {
            tracing::info!("termination signal received");
            set_pending_termination();
            wakeup.notify_waiters();
        }
    });
    Ok(())
}
