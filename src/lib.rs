//! `jsh`: an interactive shell with pipelines, expansions and job control.

pub mod builtins;
pub mod config;
pub mod error;
pub mod exec;
pub mod expand;
pub mod jobs;
pub mod parser;
pub mod shell;
pub mod signals;
pub mod utils;

pub use error::{Result, ShellError};
pub use shell::{Shell, ShellState};
