use crate::error::{Result, ShellError};
use crate::expand;
use crate::jobs::{self, JobState};
use crate::parser::{CommandSegment, InputSource, OutputTarget, Pipeline};
use crate::shell::Shell;
use crate::signals;
use crate::utils::report;
use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use nix::sys::wait::waitpid;
use nix::unistd::{close, dup2, execvp, fork, getpid, pipe, setpgid, write, ForkResult, Pid};
use std::ffi::CString;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{FromRawFd, RawFd};
use std::process;
use tracing::{debug, warn};

const STDIN_FILENO: RawFd = 0;
const STDOUT_FILENO: RawFd = 1;

/// Exit status of a stage whose program could not be found or executed.
pub const EXIT_NOT_FOUND: i32 = 127;

/// The `n - 1` pipes of an `n`-stage pipeline. Stage `i` writes to pipe
/// `i` and stage `i + 1` reads from it.
struct Pipes {
    ends: Vec<(Option<RawFd>, Option<RawFd>)>,
}

impl Pipes {
    fn allocate(count: usize) -> Result<Self> {
        let mut pipes = Pipes {
            ends: Vec::with_capacity(count),
        };
        for _ in 0..count {
            // on error the ones already made close on drop
            let (read, write) = pipe().map_err(ShellError::Pipe)?;
            pipes.ends.push((Some(read), Some(write)));
        }
        Ok(pipes)
    }

    fn reader(&self, i: usize) -> Option<RawFd> {
        self.ends.get(i).and_then(|end| end.0)
    }

    fn writer(&self, i: usize) -> Option<RawFd> {
        self.ends.get(i).and_then(|end| end.1)
    }

    fn close_reader(&mut self, i: usize) {
        if let Some(fd) = self.ends.get_mut(i).and_then(|end| end.0.take()) {
            let _ = close(fd);
        }
    }

    fn close_writer(&mut self, i: usize) {
        if let Some(fd) = self.ends.get_mut(i).and_then(|end| end.1.take()) {
            let _ = close(fd);
        }
    }

    fn close_all(&mut self) {
        for i in 0..self.ends.len() {
            self.close_reader(i);
            self.close_writer(i);
        }
    }
}

impl Drop for Pipes {
    fn drop(&mut self) {
        self.close_all();
    }
}

/// Everything a freshly forked child needs to become its stage.
struct Stage<'a> {
    segment: &'a CommandSegment,
    stdin: Option<RawFd>,
    stdout: Option<RawFd>,
    /// Group of the stages spawned before this one; `None` for the first.
    pgid: Option<Pid>,
    foreground: bool,
    job_control: bool,
}

/// Spawns every stage of `pipeline` and either waits for it or records it
/// as a background job. The status is the last stage's; launching in the
/// background is status 0.
pub fn run_pipeline(shell: &mut Shell, pipeline: &Pipeline) -> Result<i32> {
    let stages = &pipeline.segments;
    let count = stages.len();
    let foreground = !pipeline.background;
    let job_control = shell.terminal().job_control();
    let mut pipes = Pipes::allocate(count.saturating_sub(1))?;
    let mut pgid: Option<Pid> = None;
    let mut pids = Vec::with_capacity(count);
    let mut last = None;
    let mut spawn_error = None;

    for (i, segment) in stages.iter().enumerate() {
        if segment.is_empty() {
            debug!(stage = i, "empty segment, nothing to spawn");
        } else {
            let stdin = if i > 0 { pipes.reader(i - 1) } else { None };
            let stdout = if i + 1 < count { pipes.writer(i) } else { None };
            match unsafe { fork() } {
                Ok(ForkResult::Child) => {
                    let stage = Stage {
                        segment,
                        stdin,
                        stdout,
                        pgid,
                        foreground,
                        job_control,
                    };
                    run_stage(shell, stage, &mut pipes);
                }
                Ok(ForkResult::Parent { child }) => {
                    let group = *pgid.get_or_insert(child);
                    if job_control {
                        // the child does the same; whichever runs first wins
                        if let Err(err) = setpgid(child, group) {
                            debug!(pid = %child, %err, "setpgid from parent");
                        }
                        if foreground && pids.is_empty() {
                            shell.terminal().give_to(group);
                        }
                    }
                    debug!(pid = %child, pgid = %group, stage = i, "spawned stage");
                    pids.push(child);
                    if i + 1 == count {
                        last = Some(child);
                    }
                }
                Err(err) => {
                    spawn_error = Some(ShellError::Fork(err));
                    break;
                }
            }
        }
        if i > 0 {
            pipes.close_reader(i - 1);
        }
        if i + 1 < count {
            pipes.close_writer(i);
        }
    }
    pipes.close_all();

    let status = settle(shell, pipeline, pgid, pids, last);
    match spawn_error {
        Some(err) => Err(err),
        None => Ok(status),
    }
}

/// Parent side once every stage is spawned.
fn settle(shell: &mut Shell, pipeline: &Pipeline, pgid: Option<Pid>, pids: Vec<Pid>, last: Option<Pid>) -> i32 {
    let Some(pgid) = pgid else {
        return 0;
    };
    let job_control = shell.terminal().job_control();
    if pipeline.background {
        let jid = jobs::add_job(&mut shell.state.jobs, pgid, pids, JobState::Running, pipeline.to_string());
        if let (Some(jid), true) = (jid, shell.is_interactive()) {
            eprintln!("[{}] {}", jid, pgid);
        }
        return 0;
    }
    let outcome = jobs::wait_foreground(&pids, last, job_control);
    shell.terminal().reclaim();
    if !outcome.stopped.is_empty() {
        let cmdline = pipeline.to_string();
        if let Some(jid) = jobs::add_job(&mut shell.state.jobs, pgid, pids, JobState::Stopped, cmdline.clone()) {
            eprintln!("\n[{}]+  Stopped  {}", jid, cmdline);
        }
    }
    outcome.status
}

/// Child side: become the stage and exec it. Never returns.
fn run_stage(shell: &mut Shell, stage: Stage<'_>, pipes: &mut Pipes) -> ! {
    if stage.job_control {
        let group = stage.pgid.unwrap_or_else(getpid);
        let _ = setpgid(Pid::from_raw(0), group);
        if stage.foreground {
            shell.terminal().give_to(group);
        }
    }
    // only now: taking the terminal from a background group needs SIGTTOU ignored
    signals::reset_for_child();
    shell.enter_subshell();

    let segment = stage.segment;
    if segment.input.is_none() {
        if let Some(fd) = stage.stdin {
            let _ = dup2(fd, STDIN_FILENO);
        }
    }
    if segment.output.is_none() {
        if let Some(fd) = stage.stdout {
            let _ = dup2(fd, STDOUT_FILENO);
        }
    }
    pipes.close_all();

    if let Some(input) = &segment.input {
        bind_input(shell, input);
    }
    if let Some(output) = &segment.output {
        bind_output(shell, output);
    }

    let argv = expand::expand(&segment.argv, shell);
    if argv.is_empty() {
        process::exit(0);
    }
    let status = exec_program(&argv);
    process::exit(status)
}

/// Expands a redirection target; it must come out as exactly one word.
fn expand_target(shell: &mut Shell, raw: &str) -> Option<String> {
    let mut words = expand::expand_token(raw, shell);
    if words.len() == 1 {
        words.pop()
    } else {
        report(raw, "ambiguous redirect");
        None
    }
}

/// Opens the input redirection onto stdin. On failure stdin stays as it
/// was inherited.
fn bind_input(shell: &mut Shell, input: &InputSource) {
    match input {
        InputSource::File(raw) => {
            let Some(path) = expand_target(shell, raw) else {
                return;
            };
            match open(path.as_str(), OFlag::O_RDONLY, Mode::empty()) {
                Ok(fd) => move_fd(fd, STDIN_FILENO),
                Err(err) => report(&path, err.desc()),
            }
        }
        InputSource::HereDoc(body) => match here_document(body) {
            Ok(fd) => move_fd(fd, STDIN_FILENO),
            Err(err) => report("here-document", err.desc()),
        },
    }
}

/// Opens the output redirection onto stdout, mode 0666 before umask. On
/// failure stdout stays as it was inherited.
fn bind_output(shell: &mut Shell, output: &OutputTarget) {
    let Some(path) = expand_target(shell, output.path()) else {
        return;
    };
    let mode_flag = if output.is_append() {
        OFlag::O_APPEND
    } else {
        OFlag::O_TRUNC
    };
    let flags = OFlag::O_WRONLY | OFlag::O_CREAT | mode_flag;
    match open(path.as_str(), flags, Mode::from_bits_truncate(0o666)) {
        Ok(fd) => move_fd(fd, STDOUT_FILENO),
        Err(err) => report(&path, err.desc()),
    }
}

fn move_fd(fd: RawFd, target: RawFd) {
    if fd != target {
        let _ = dup2(fd, target);
        let _ = close(fd);
    }
}

/// A pipe pre-filled with `body`, read end returned. A separate writer
/// process feeds it so a body larger than the pipe buffer cannot block the
/// stage that is about to read it.
fn here_document(body: &str) -> nix::Result<RawFd> {
    let (read, write_end) = pipe()?;
    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            let _ = close(read);
            let status = match write_all(write_end, body.as_bytes()) {
                Ok(()) => 0,
                Err(_) => 1,
            };
            process::exit(status)
        }
        Ok(ForkResult::Parent { .. }) => {
            close(write_end)?;
            Ok(read)
        }
        Err(err) => {
            let _ = close(read);
            let _ = close(write_end);
            Err(err)
        }
    }
}

fn write_all(fd: RawFd, mut bytes: &[u8]) -> nix::Result<()> {
    while !bytes.is_empty() {
        match write(fd, bytes) {
            Ok(n) => bytes = &bytes[n..],
            Err(Errno::EINTR) => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// Replaces the process image. Returns only on failure, with the status
/// the child should exit with.
fn exec_program(argv: &[String]) -> i32 {
    let args = match argv
        .iter()
        .map(|arg| CString::new(arg.as_bytes()))
        .collect::<std::result::Result<Vec<CString>, _>>()
    {
        Ok(args) => args,
        Err(_) => {
            report(&argv[0], "argument contains a nul byte");
            return EXIT_NOT_FOUND;
        }
    };
    let err = match execvp(&args[0], &args) {
        Ok(never) => match never {},
        Err(err) => err,
    };
    match err {
        Errno::ENOENT => report(&argv[0], "command not found"),
        err => report(&argv[0], err.desc()),
    }
    EXIT_NOT_FOUND
}

/// Runs `line` in a forked copy of the shell and returns what it wrote to
/// standard output. Failures degrade to an empty string.
pub fn capture_output(shell: &mut Shell, line: &str) -> String {
    let (read, write_end) = match pipe() {
        Ok(ends) => ends,
        Err(err) => {
            report("pipe", err.desc());
            return String::new();
        }
    };
    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            let _ = close(read);
            move_fd(write_end, STDOUT_FILENO);
            signals::reset_for_child();
            shell.enter_subshell();
            let status = shell.execute_line(line, &mut std::iter::empty::<String>());
            let _ = io::stdout().flush();
            process::exit(status)
        }
        Ok(ForkResult::Parent { child }) => {
            let _ = close(write_end);
            let mut output = Vec::new();
            let mut reader = unsafe { File::from_raw_fd(read) };
            if let Err(err) = reader.read_to_end(&mut output) {
                warn!(%err, "reading command substitution output");
            }
            drop(reader);
            while let Err(Errno::EINTR) = waitpid(child, None) {}
            String::from_utf8_lossy(&output).into_owned()
        }
        Err(err) => {
            let _ = close(read);
            let _ = close(write_end);
            report("fork", err.desc());
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_line;

    fn pipeline(line: &str) -> Pipeline {
        parse_line(line).entries.remove(0).pipeline
    }

    #[test]
    fn test_capture_output_flushes_before_exit() {
        let mut shell = Shell::detached();
        assert_eq!(capture_output(&mut shell, "printf 'a\\nb\\n'"), "a\nb\n");
        assert_eq!(capture_output(&mut shell, "true"), "");
    }

    #[test]
    fn test_child_exit_statuses() {
        let mut shell = Shell::detached();
        assert_eq!(run_pipeline(&mut shell, &pipeline("$JSH_EXEC_TEST_UNSET")).unwrap(), 0);
        assert_eq!(run_pipeline(&mut shell, &pipeline("jsh-exec-test-missing")).unwrap(), EXIT_NOT_FOUND);
        assert_eq!(run_pipeline(&mut shell, &pipeline("sh -c 'exit 9'")).unwrap(), 9);
    }

    #[test]
    fn test_here_document_larger_than_pipe_buffer() {
        let body = "line\n".repeat(40_000);
        let fd = here_document(&body).unwrap();
        let mut contents = String::new();
        unsafe { File::from_raw_fd(fd) }.read_to_string(&mut contents).unwrap();
        assert_eq!(contents.len(), body.len());
    }
}
