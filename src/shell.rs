use crate::builtins;
use crate::config;
use crate::error::Result;
use crate::exec;
use crate::expand::{self, ExpansionContext};
use crate::jobs::{self, JobList, Terminal};
use crate::parser::{self, LineSource, Pipeline, Sequence};
use crate::signals::{Phase, SignalController};
use crate::utils::report;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::collections::HashMap;
use std::env;
use std::io::BufRead;
use tracing::debug;

/// Lines longer than this never reach the engine.
pub const MAX_INPUT_LEN: usize = 4096;

/// Everything the engine keeps between lines.
#[derive(Debug, Default)]
pub struct ShellState {
    /// Alias name to replacement text.
    pub aliases: HashMap<String, String>,
    /// Shell-local variables, consulted before the environment.
    pub variables: HashMap<String, String>,
    /// Status of the last pipeline that ran.
    pub last_status: i32,
    pub jobs: JobList,
    /// Set by `exit`; the main loop stops once it sees it.
    pub exit_requested: Option<i32>,
}

/// The command execution engine: one value owns all shell state.
pub struct Shell {
    pub state: ShellState,
    terminal: Terminal,
    signals: SignalController,
    interactive: bool,
}

impl Shell {
    /// An interactive shell: takes the terminal, installs the interactive
    /// signal dispositions and captures the terminal modes.
    pub fn interactive() -> Result<Self> {
        let mut terminal = Terminal::open()?;
        let signals = SignalController::install()?;
        terminal.claim()?;
        Ok(Shell {
            state: ShellState::default(),
            terminal,
            signals,
            interactive: true,
        })
    }

    /// A non-interactive shell: no job control, dispositions untouched.
    pub fn detached() -> Self {
        Shell {
            state: ShellState::default(),
            terminal: Terminal::detached(),
            signals: SignalController::detached(),
            interactive: false,
        }
    }

    /// A non-interactive shell driving an already open terminal, whose
    /// saved modes are restored after every foreground pipeline.
    pub fn with_terminal(terminal: Terminal) -> Self {
        Shell {
            terminal,
            ..Self::detached()
        }
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    pub fn terminal(&self) -> &Terminal {
        &self.terminal
    }

    pub fn jobs(&self) -> &JobList {
        &self.state.jobs
    }

    pub fn last_status(&self) -> i32 {
        self.state.last_status
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.state.variables.insert(name.into(), value.into());
    }

    /// Turns a forked copy of the shell into a plain child: no terminal
    /// handling and no jobs of its own.
    pub fn enter_subshell(&mut self) {
        self.terminal.disable();
        self.signals.detach();
        self.interactive = false;
        self.state.jobs = JobList::new();
    }

    /// Runs one input line: alias substitution, parsing, then every
    /// pipeline in order as its connector allows. Here-document bodies are
    /// read from `input`.
    pub fn execute_line(&mut self, line: &str, input: &mut dyn LineSource) -> i32 {
        let line = parser::substitute_aliases(line, &self.state.aliases);
        let sequence = parser::parse(&line, input);
        self.run_sequence(&sequence)
    }

    /// Runs the pipelines of a parsed line. A pipeline whose gate does not
    /// open is skipped and the status carries over unchanged, as does an
    /// empty one left by a trailing separator.
    pub fn run_sequence(&mut self, sequence: &Sequence) -> i32 {
        let mut status = self.state.last_status;
        for entry in &sequence.entries {
            if self.state.exit_requested.is_some() {
                break;
            }
            if !entry.connector.permits(status) || entry.pipeline.is_empty() {
                continue;
            }
            status = self.run_pipeline(&entry.pipeline);
            self.state.last_status = status;
        }
        status
    }

    fn run_pipeline(&mut self, pipeline: &Pipeline) -> i32 {
        if let Some(status) = self.try_builtin(pipeline) {
            return status;
        }
        let _guard = match self.signals.enter_foreground() {
            Ok(guard) => guard,
            Err(err) => {
                report("signals", err);
                return 1;
            }
        };
        match exec::run_pipeline(self, pipeline) {
            Ok(status) => status,
            Err(err) => {
                report("pipeline", err);
                1
            }
        }
    }

    /// Internal directives run in the shell itself, and only as a lone,
    /// foreground, unredirected command.
    fn try_builtin(&mut self, pipeline: &Pipeline) -> Option<i32> {
        let [segment] = pipeline.segments.as_slice() else {
            return None;
        };
        if pipeline.background || segment.input.is_some() || segment.output.is_some() {
            return None;
        }
        let builtin = builtins::lookup(&segment.argv)?;
        let argv = expand::expand(&segment.argv, self);
        debug!(?builtin, ?argv, "running builtin");
        Some(builtins::run(self, builtin, &argv))
    }

    /// Continues job `jid`, in the foreground with the terminal or in the
    /// background without it.
    pub fn resume_job(&mut self, jid: i32, foreground: bool) -> Result<i32> {
        let job = match jobs::get_job_by_jid(&self.state.jobs, jid) {
            Some(job) => job.clone(),
            None => return Err(crate::error::ShellError::NoSuchJob(jid.to_string())),
        };
        if !foreground {
            jobs::continue_job(&job)?;
            if let Some(job) = self.state.jobs.jobs.get_mut(&jid) {
                job.state = jobs::JobState::Running;
            }
            println!("[{}] {} &", job.jid, job.cmdline);
            return Ok(0);
        }
        jobs::delete_job(&mut self.state.jobs, jid);
        println!("{}", job.cmdline);
        let _guard = self.signals.enter_foreground()?;
        self.terminal.give_to(job.pgid);
        if let Err(err) = jobs::continue_job(&job) {
            self.terminal.reclaim();
            return Err(err);
        }
        let last = job.pids.last().copied();
        let outcome = jobs::wait_foreground(&job.pids, last, self.terminal.job_control());
        self.terminal.reclaim();
        if !outcome.stopped.is_empty() {
            if let Some(jid) = jobs::add_job(
                &mut self.state.jobs,
                job.pgid,
                outcome.stopped.clone(),
                jobs::JobState::Stopped,
                job.cmdline.clone(),
            ) {
                eprintln!("\n[{}]+  Stopped  {}", jid, job.cmdline);
            }
        }
        Ok(outcome.status)
    }

    /// Collects finished background jobs and, when interactive, reports them.
    pub fn notify_finished_jobs(&mut self) {
        for job in jobs::reap_jobs(&mut self.state.jobs) {
            if self.interactive {
                println!("[{}]+  Done  {}", job.jid, job.cmdline);
            }
        }
    }

    /// Runs the startup commands from the rc file.
    pub fn run_startup(&mut self, commands: &[String]) {
        for line in commands {
            self.execute_line(line, &mut std::iter::empty::<String>());
            if self.state.exit_requested.is_some() {
                break;
            }
        }
    }

    /// Reads and runs lines from `reader` until end of input or `exit`.
    /// Here-document bodies come from the same stream.
    pub fn run_script<R: BufRead>(&mut self, reader: R) -> i32 {
        let mut lines = reader.lines().map_while(std::result::Result::ok);
        while let Some(line) = lines.next() {
            if line.trim().is_empty() {
                continue;
            }
            self.execute_line(&line, &mut lines);
            if let Some(code) = self.state.exit_requested {
                return code;
            }
        }
        self.state.last_status
    }

    /// The interactive loop: prompt, read a line with the editor, run it.
    pub fn run_interactive(&mut self, prompt_template: &str) -> Result<i32> {
        let mut editor = DefaultEditor::new()?;
        if let Err(err) = editor.load_history(config::HISTORY_FILE.as_path()) {
            debug!(%err, "no history loaded");
        }
        loop {
            self.notify_finished_jobs();
            if self.signals.take_interrupt() {
                println!();
            }
            let prompt = config::render_prompt(prompt_template);
            self.signals.set_phase(Phase::EditingLine);
            let read = editor.readline(&prompt);
            self.signals.set_phase(Phase::Idle);
            match read {
                Ok(line) => {
                    // interrupted while the line was in progress: drop it
                    if self.signals.take_interrupt() {
                        continue;
                    }
                    if line.len() > MAX_INPUT_LEN {
                        report("input", format!("line too long (max {} chars)", MAX_INPUT_LEN));
                        continue;
                    }
                    if line.trim().is_empty() {
                        continue;
                    }
                    let _ = editor.add_history_entry(line.as_str());
                    let mut heredoc = EditorLines { editor: &mut editor };
                    self.execute_line(&line, &mut heredoc);
                    if let Err(err) = editor.save_history(config::HISTORY_FILE.as_path()) {
                        debug!(%err, "could not save history");
                    }
                    if let Some(code) = self.state.exit_requested {
                        return Ok(code);
                    }
                }
                Err(ReadlineError::Interrupted) => continue,
                Err(ReadlineError::Eof) => {
                    println!("exit");
                    break;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(self.state.last_status)
    }
}

impl ExpansionContext for Shell {
    fn lookup(&self, name: &str) -> Option<String> {
        if name == "?" {
            return Some(self.state.last_status.to_string());
        }
        self.state
            .variables
            .get(name)
            .cloned()
            .or_else(|| env::var(name).ok())
    }

    fn capture_output(&mut self, line: &str) -> String {
        exec::capture_output(self, line)
    }
}

/// Here-document lines typed at a continuation prompt.
struct EditorLines<'a> {
    editor: &'a mut DefaultEditor,
}

impl Iterator for EditorLines<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.editor.readline("> ").ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_prefers_shell_variables() {
        let mut shell = Shell::detached();
        shell.set_variable("PATH", "shadowed");
        shell.set_variable("JSH_LOCAL", "1");
        assert_eq!(shell.lookup("PATH").as_deref(), Some("shadowed"));
        assert_eq!(shell.lookup("JSH_LOCAL").as_deref(), Some("1"));
        assert_eq!(shell.lookup("JSH_SURELY_UNSET_VARIABLE"), None);
    }

    #[test]
    fn test_lookup_falls_back_to_environment() {
        let shell = Shell::detached();
        assert_eq!(shell.lookup("HOME"), env::var("HOME").ok());
    }

    #[test]
    fn test_last_status_variable() {
        let mut shell = Shell::detached();
        shell.state.last_status = 42;
        assert_eq!(shell.lookup("?").as_deref(), Some("42"));
    }

    #[test]
    fn test_gated_pipelines_keep_status() {
        let mut shell = Shell::detached();
        let status = shell.execute_line("false && true", &mut std::iter::empty::<String>());
        assert_ne!(status, 0);
        let status = shell.execute_line("false || true", &mut std::iter::empty::<String>());
        assert_eq!(status, 0);
    }

    #[test]
    fn test_trailing_separator_keeps_status() {
        let mut shell = Shell::detached();
        assert_eq!(shell.execute_line("false;", &mut std::iter::empty::<String>()), 1);
    }

    #[test]
    fn test_exit_stops_sequence() {
        let mut shell = Shell::detached();
        shell.execute_line("exit 3; X=after", &mut std::iter::empty::<String>());
        assert_eq!(shell.state.exit_requested, Some(3));
        assert!(!shell.state.variables.contains_key("X"));
    }
}
