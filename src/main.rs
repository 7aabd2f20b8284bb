use jsh::config::{self, LOG_ENV};
use jsh::shell::Shell;
use jsh::utils::{self, fatal};
use nix::unistd::isatty;
use std::env;
use std::fs::File;
use std::io::{self, BufReader};
use std::process;

fn main() {
    // Parse command-line arguments.
    let mut args = env::args().skip(1);
    let mut emit_prompt = true;
    let mut verbose = false;
    let mut command: Option<String> = None;
    let mut script: Option<String> = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" => utils::print_usage(),
            "-v" => verbose = true,
            "-p" => emit_prompt = false,
            "-c" => match args.next() {
                Some(line) => command = Some(line),
                None => utils::print_usage(),
            },
            _ if arg.starts_with('-') => utils::print_usage(),
            _ => {
                script = Some(arg);
                break;
            }
        }
    }

    init_logging(verbose);

    let status = if let Some(line) = command {
        let mut shell = Shell::detached();
        shell.execute_line(&line, &mut std::iter::empty::<String>())
    } else if let Some(path) = script {
        let file = File::open(&path).unwrap_or_else(|err| fatal(format!("{}: {}", path, err)));
        Shell::detached().run_script(BufReader::new(file))
    } else if isatty(0).unwrap_or(false) {
        run_interactive(emit_prompt)
    } else {
        Shell::detached().run_script(io::stdin().lock())
    };
    process::exit(status);
}

/// Log filter from `JSH_LOG`, `warn` by default and `debug` with `-v`.
fn init_logging(verbose: bool) {
    use tracing_subscriber::EnvFilter;
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

/// With `emit_prompt` off the editor still runs, behind an empty prompt.
fn run_interactive(emit_prompt: bool) -> i32 {
    let startup = config::load();
    let mut shell = Shell::interactive().unwrap_or_else(|err| fatal(err));
    shell.state.aliases.extend(startup.aliases.clone());
    shell.run_startup(&startup.commands);
    if let Some(code) = shell.state.exit_requested {
        return code;
    }
    match shell.run_interactive(startup.prompt_template(emit_prompt)) {
        Ok(status) => status,
        Err(err) => fatal(err),
    }
}
