use rustyline::error::ReadlineError;
use thiserror::Error;

/// Failures the shell process itself can hit while driving a command.
///
/// Errors that happen inside a forked child never surface here: the child
/// reports them on stderr and encodes them in its exit status.
#[derive(Debug, Error)]
pub enum ShellError {
    #[error("pipe: {0}")]
    Pipe(nix::Error),
    #[error("fork: {0}")]
    Fork(nix::Error),
    #[error("terminal: {0}")]
    Terminal(nix::Error),
    #[error("signal: {0}")]
    Signal(nix::Error),
    #[error("signal handler: {0}")]
    SignalHook(std::io::Error),
    #[error("no such job: {0}")]
    NoSuchJob(String),
    #[error(transparent)]
    Readline(#[from] ReadlineError),
}

pub type Result<T> = std::result::Result<T, ShellError>;
