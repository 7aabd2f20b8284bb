use std::fmt::Display;
use std::process;

pub fn print_usage() -> ! {
    println!("Usage: jsh [-hvp] [-c command | script]");
    println!("   -h           Print this help message");
    println!("   -v           Enable verbose mode");
    println!("   -p           Do not print a command prompt");
    println!("   -c command   Run one command line and exit");
    process::exit(1);
}

/// Prints a diagnostic as `jsh: what: err`.
pub fn report(what: &str, err: impl Display) {
    eprintln!("jsh: {}: {}", what, err);
}

pub fn fatal(msg: impl Display) -> ! {
    eprintln!("jsh: {}", msg);
    process::exit(1);
}
