//! Signal discipline for the shell process and its children.
//!
//! In interactive mode the shell ignores SIGTTOU, SIGTTIN and SIGTSTP for
//! its whole life, and handles SIGINT with a handler that only records the
//! interrupt; the main loop looks at the record and throws away the line in
//! progress. While a foreground pipeline runs, SIGINT is ignored and
//! SIGWINCH is at its default so the job, not the shell, reacts to them.
//! Children put every signal the shell touched back to default.

use crate::error::{Result, ShellError};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use signal_hook::consts::signal::SIGINT;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::debug;

/// What the shell is doing, as seen from the signal handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Idle = 0,
    EditingLine = 1,
    RunningForeground = 2,
}

impl Phase {
    #[cfg(test)]
    fn from_raw(raw: u8) -> Phase {
        match raw {
            1 => Phase::EditingLine,
            2 => Phase::RunningForeground,
            _ => Phase::Idle,
        }
    }
}

/// Owns the shell's signal dispositions.
#[derive(Debug)]
pub struct SignalController {
    interactive: bool,
    phase: Arc<AtomicU8>,
    interrupted: Arc<AtomicBool>,
}

impl SignalController {
    /// Leaves every disposition alone.
    pub fn detached() -> Self {
        SignalController {
            interactive: false,
            phase: Arc::new(AtomicU8::new(Phase::Idle as u8)),
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Installs the interactive dispositions.
    pub fn install() -> Result<Self> {
        for signal in [Signal::SIGTTOU, Signal::SIGTTIN, Signal::SIGTSTP] {
            set_disposition(signal, SigHandler::SigIgn)?;
        }
        let controller = SignalController {
            interactive: true,
            ..Self::detached()
        };
        let phase = Arc::clone(&controller.phase);
        let interrupted = Arc::clone(&controller.interrupted);
        // Runs in signal context: atomics only.
        let handler = move || {
            if phase.load(Ordering::SeqCst) != Phase::RunningForeground as u8 {
                interrupted.store(true, Ordering::SeqCst);
            }
        };
        unsafe { signal_hook::low_level::register(SIGINT, handler) }.map_err(ShellError::SignalHook)?;
        debug!("interactive signal handlers installed");
        Ok(controller)
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    #[cfg(test)]
    fn phase(&self) -> Phase {
        Phase::from_raw(self.phase.load(Ordering::SeqCst))
    }

    pub fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::SeqCst);
    }

    /// True once per SIGINT received outside a foreground job.
    pub fn take_interrupt(&self) -> bool {
        self.interrupted.swap(false, Ordering::SeqCst)
    }

    /// Stops acting as the interactive shell, as in a forked child. The
    /// dispositions themselves are reset with [`reset_for_child`].
    pub fn detach(&mut self) {
        self.interactive = false;
    }

    /// Switches to foreground-job dispositions until the guard drops.
    pub fn enter_foreground(&self) -> Result<ForegroundGuard> {
        let mut guard = ForegroundGuard {
            phase: Arc::clone(&self.phase),
            previous: self.phase.load(Ordering::SeqCst),
            saved: Vec::new(),
        };
        if self.interactive {
            guard.saved.push((Signal::SIGINT, set_disposition(Signal::SIGINT, SigHandler::SigIgn)?));
            guard.saved.push((Signal::SIGWINCH, set_disposition(Signal::SIGWINCH, SigHandler::SigDfl)?));
        }
        self.set_phase(Phase::RunningForeground);
        Ok(guard)
    }
}

/// Restores the shell's own SIGINT and SIGWINCH handling on drop.
pub struct ForegroundGuard {
    phase: Arc<AtomicU8>,
    previous: u8,
    saved: Vec<(Signal, SigAction)>,
}

impl Drop for ForegroundGuard {
    fn drop(&mut self) {
        for (signal, action) in self.saved.drain(..).rev() {
            if let Err(err) = unsafe { sigaction(signal, &action) } {
                debug!(?signal, %err, "could not restore signal handler");
            }
        }
        self.phase.store(self.previous, Ordering::SeqCst);
    }
}

fn set_disposition(signal: Signal, handler: SigHandler) -> Result<SigAction> {
    let action = SigAction::new(handler, SaFlags::empty(), SigSet::empty());
    unsafe { sigaction(signal, &action) }.map_err(ShellError::Signal)
}

/// Signals a child must not inherit in their shell state. SIGPIPE is in
/// the list because the Rust runtime ignores it in the shell.
const CHILD_DEFAULTS: [Signal; 8] = [
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGTSTP,
    Signal::SIGTTIN,
    Signal::SIGTTOU,
    Signal::SIGWINCH,
    Signal::SIGCHLD,
    Signal::SIGPIPE,
];

/// Puts every signal the shell may have touched back to default. Called in
/// a freshly forked child, after it has taken the terminal.
pub fn reset_for_child() {
    for signal in CHILD_DEFAULTS {
        let _ = set_disposition(signal, SigHandler::SigDfl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detached_controller_is_inert() {
        let signals = SignalController::detached();
        assert!(!signals.is_interactive());
        assert_eq!(signals.phase(), Phase::Idle);
        assert!(!signals.take_interrupt());
    }

    #[test]
    fn test_foreground_guard_tracks_phase() {
        let signals = SignalController::detached();
        signals.set_phase(Phase::EditingLine);
        {
            let _guard = signals.enter_foreground().unwrap();
            assert_eq!(signals.phase(), Phase::RunningForeground);
        }
        assert_eq!(signals.phase(), Phase::EditingLine);
    }

    /// Reads a disposition by swapping in SIG_IGN and putting the old one back.
    fn current_handler(signal: Signal) -> SigHandler {
        let probe = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        let old = unsafe { sigaction(signal, &probe) }.unwrap();
        unsafe { sigaction(signal, &old) }.unwrap();
        old.handler()
    }

    fn is_custom(handler: SigHandler) -> bool {
        matches!(handler, SigHandler::Handler(_) | SigHandler::SigAction(_))
    }

    #[test]
    fn test_interactive_dispositions() {
        let signals = SignalController::install().unwrap();
        assert!(signals.is_interactive());
        for signal in [Signal::SIGTTOU, Signal::SIGTTIN, Signal::SIGTSTP] {
            assert_eq!(current_handler(signal), SigHandler::SigIgn, "{:?}", signal);
        }
        assert!(is_custom(current_handler(Signal::SIGINT)));

        {
            let _guard = signals.enter_foreground().unwrap();
            assert_eq!(current_handler(Signal::SIGINT), SigHandler::SigIgn);
            assert_eq!(current_handler(Signal::SIGWINCH), SigHandler::SigDfl);
            assert_eq!(signals.phase(), Phase::RunningForeground);
        }
        assert!(is_custom(current_handler(Signal::SIGINT)));
        assert_eq!(signals.phase(), Phase::Idle);

        // the handler only records the interrupt; the process keeps running
        nix::sys::signal::raise(Signal::SIGINT).unwrap();
        assert!(signals.take_interrupt());
        assert!(!signals.take_interrupt());
    }

    #[test]
    fn test_phase_from_raw() {
        assert_eq!(Phase::from_raw(Phase::RunningForeground as u8), Phase::RunningForeground);
        assert_eq!(Phase::from_raw(9), Phase::Idle);
    }
}
