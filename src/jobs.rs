use crate::error::{Result, ShellError};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::termios::{tcgetattr, tcsetattr, SetArg, Termios};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{getpgrp, getpid, isatty, setpgid, tcgetpgrp, tcsetpgrp, Pid};
use std::collections::BTreeMap;
use std::os::unix::io::RawFd;
use std::time::Instant;
use tracing::debug;

const STDIN_FILENO: RawFd = 0;

/// Represents the state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Running,
    Stopped,
    Done,
}

/// A pipeline the shell is not currently waiting on.
#[derive(Debug, Clone)]
pub struct Job {
    pub jid: i32,
    /// Process group every stage was placed in.
    pub pgid: Pid,
    /// Stages that have not been collected yet.
    pub pids: Vec<Pid>,
    pub state: JobState,
    pub cmdline: String,
    pub started: Instant,
}

/// Background and stopped jobs, keyed by job ID.
#[derive(Debug)]
pub struct JobList {
    pub jobs: BTreeMap<i32, Job>,
    pub next_jid: i32,
}

impl JobList {
    /// Creates a new, empty job list.
    pub fn new() -> Self {
        JobList {
            jobs: BTreeMap::new(),
            next_jid: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

impl Default for JobList {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns the maximum job ID currently in the job list.
pub fn max_jid(job_list: &JobList) -> i32 {
    job_list.jobs.keys().next_back().copied().unwrap_or(0)
}

/// Adds a new job and returns its job ID, or `None` when there is no
/// process to track.
pub fn add_job(
    job_list: &mut JobList,
    pgid: Pid,
    pids: Vec<Pid>,
    state: JobState,
    cmdline: String,
) -> Option<i32> {
    if pids.is_empty() {
        return None;
    }
    let jid = job_list.next_jid;
    let job = Job {
        jid,
        pgid,
        pids,
        state,
        cmdline,
        started: Instant::now(),
    };
    job_list.jobs.insert(jid, job);
    job_list.next_jid += 1;
    Some(jid)
}

/// Deletes the job with the given job ID from the job list.
pub fn delete_job(job_list: &mut JobList, jid: i32) -> Option<Job> {
    let removed = job_list.jobs.remove(&jid);
    if removed.is_some() {
        job_list.next_jid = max_jid(job_list) + 1;
    }
    removed
}

/// Returns a reference to the job with the given job ID.
pub fn get_job_by_jid(job_list: &JobList, jid: i32) -> Option<&Job> {
    job_list.jobs.get(&jid)
}

/// The job `fg` and `bg` act on when no job is named: the most recent one.
pub fn current_jid(job_list: &JobList) -> Option<i32> {
    job_list.jobs.keys().next_back().copied()
}

/// Prints the list of jobs.
pub fn list_jobs(job_list: &JobList) {
    for job in job_list.jobs.values() {
        let state_str = match job.state {
            JobState::Running => "Running",
            JobState::Stopped => "Stopped",
            JobState::Done => "Done",
        };
        println!("[{}] ({}) {} {}", job.jid, job.pgid, state_str, job.cmdline);
    }
}

/// Collects whatever background processes have changed state, without
/// blocking, and removes jobs whose every stage has finished. Only the
/// job's own pids are waited on.
pub fn reap_jobs(job_list: &mut JobList) -> Vec<Job> {
    let flags = WaitPidFlag::WNOHANG | WaitPidFlag::WUNTRACED | WaitPidFlag::WCONTINUED;
    let mut finished = Vec::new();
    for job in job_list.jobs.values_mut() {
        let mut state = job.state;
        job.pids.retain(|&pid| match waitpid(pid, Some(flags)) {
            Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => false,
            Ok(WaitStatus::Stopped(..)) => {
                state = JobState::Stopped;
                true
            }
            Ok(WaitStatus::Continued(_)) => {
                state = JobState::Running;
                true
            }
            Ok(_) => true,
            Err(Errno::ECHILD) => false,
            Err(err) => {
                debug!(%pid, %err, "waitpid on background stage failed");
                true
            }
        });
        job.state = state;
        if job.pids.is_empty() {
            job.state = JobState::Done;
            finished.push(job.jid);
        }
    }
    let done: Vec<Job> = finished
        .into_iter()
        .filter_map(|jid| delete_job(job_list, jid))
        .collect();
    for job in &done {
        debug!(jid = job.jid, elapsed = ?job.started.elapsed(), "job finished");
    }
    done
}

/// Result of waiting on a foreground pipeline.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ForegroundOutcome {
    /// Status of the last stage, 128+signal when it was killed or stopped.
    pub status: i32,
    /// Stages that stopped instead of finishing.
    pub stopped: Vec<Pid>,
}

/// Blocks until every pid has finished, or stopped when `job_control` is
/// on. The status is the last stage's; `last` is `None` when the last
/// stage spawned nothing, which counts as 0.
pub fn wait_foreground(pids: &[Pid], last: Option<Pid>, job_control: bool) -> ForegroundOutcome {
    let flags = job_control.then_some(WaitPidFlag::WUNTRACED);
    let mut outcome = ForegroundOutcome::default();
    for &pid in pids {
        let status = loop {
            match waitpid(pid, flags) {
                Ok(WaitStatus::Exited(_, code)) => break Some(code),
                Ok(WaitStatus::Signaled(_, signal, _)) => break Some(128 + signal as i32),
                Ok(WaitStatus::Stopped(_, signal)) => {
                    outcome.stopped.push(pid);
                    break Some(128 + signal as i32);
                }
                Ok(_) | Err(Errno::EINTR) => continue,
                Err(err) => {
                    debug!(%pid, %err, "waitpid failed");
                    break None;
                }
            }
        };
        if Some(pid) == last {
            outcome.status = status.unwrap_or(1);
        }
    }
    outcome
}

/// Sends SIGCONT to every process of the job's group.
pub fn continue_job(job: &Job) -> Result<()> {
    kill(Pid::from_raw(-job.pgid.as_raw()), Signal::SIGCONT).map_err(ShellError::Signal)
}

/// The shell's controlling terminal: which process group owns it and the
/// line-discipline modes captured at startup.
#[derive(Debug)]
pub struct Terminal {
    fd: RawFd,
    shell_pgid: Pid,
    saved: Option<Termios>,
    enabled: bool,
}

impl Terminal {
    /// No terminal operations at all; stages stay in the shell's group.
    pub fn detached() -> Self {
        Terminal {
            fd: STDIN_FILENO,
            shell_pgid: getpgrp(),
            saved: None,
            enabled: false,
        }
    }

    /// Waits until the shell runs in the terminal's foreground group.
    ///
    /// Must run before SIGTTIN is ignored: a shell started in the
    /// background stops itself here until it is brought forward.
    pub fn open() -> Result<Self> {
        if !isatty(STDIN_FILENO).unwrap_or(false) {
            return Ok(Self::detached());
        }
        loop {
            let pgrp = getpgrp();
            let owner = tcgetpgrp(STDIN_FILENO).map_err(ShellError::Terminal)?;
            if owner == pgrp {
                break;
            }
            kill(Pid::from_raw(-pgrp.as_raw()), Signal::SIGTTIN).map_err(ShellError::Signal)?;
        }
        Ok(Terminal {
            fd: STDIN_FILENO,
            shell_pgid: getpgrp(),
            saved: None,
            enabled: true,
        })
    }

    /// Puts the shell in its own process group, takes the terminal and
    /// captures its modes. Needs SIGTTOU ignored.
    pub fn claim(&mut self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let pid = getpid();
        if getpgrp() != pid {
            if let Err(err) = setpgid(pid, pid) {
                debug!(%err, "could not lead a new process group");
            }
        }
        self.shell_pgid = getpgrp();
        tcsetpgrp(self.fd, self.shell_pgid).map_err(ShellError::Terminal)?;
        self.saved = Some(tcgetattr(self.fd).map_err(ShellError::Terminal)?);
        debug!(pgid = %self.shell_pgid, "terminal claimed");
        Ok(())
    }

    /// Wraps an already open terminal without touching process groups.
    pub fn with_modes(fd: RawFd) -> Result<Self> {
        Ok(Terminal {
            fd,
            shell_pgid: getpgrp(),
            saved: Some(tcgetattr(fd).map_err(ShellError::Terminal)?),
            enabled: true,
        })
    }

    pub fn job_control(&self) -> bool {
        self.enabled
    }

    /// Stops all terminal handling, as in a forked child.
    pub fn disable(&mut self) {
        self.enabled = false;
    }

    /// Makes `pgid` the terminal's foreground group.
    pub fn give_to(&self, pgid: Pid) {
        if !self.enabled {
            return;
        }
        if let Err(err) = tcsetpgrp(self.fd, pgid) {
            debug!(%pgid, %err, "terminal handover failed");
        }
    }

    /// Takes the terminal back for the shell and undoes any mode changes
    /// the finished job left behind.
    pub fn reclaim(&self) {
        if !self.enabled {
            return;
        }
        self.give_to(self.shell_pgid);
        self.restore_modes();
    }

    /// Reapplies the modes captured at startup.
    pub fn restore_modes(&self) {
        if let Some(saved) = &self.saved {
            if let Err(err) = tcsetattr(self.fd, SetArg::TCSADRAIN, saved) {
                debug!(%err, "could not restore terminal modes");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::termios::LocalFlags;
    use std::process::Command;

    fn spawn(program: &str, args: &[&str]) -> Pid {
        let child = Command::new(program).args(args).spawn().unwrap();
        Pid::from_raw(child.id() as i32)
    }

    #[test]
    fn test_add_and_delete_jobs() {
        let mut jobs = JobList::new();
        let pid = Pid::from_raw(4242);
        assert_eq!(add_job(&mut jobs, pid, vec![], JobState::Running, "x".into()), None);
        assert_eq!(add_job(&mut jobs, pid, vec![pid], JobState::Running, "a".into()), Some(1));
        assert_eq!(add_job(&mut jobs, pid, vec![pid], JobState::Stopped, "b".into()), Some(2));
        assert_eq!(current_jid(&jobs), Some(2));
        assert_eq!(get_job_by_jid(&jobs, 1).map(|j| j.cmdline.as_str()), Some("a"));
        assert!(delete_job(&mut jobs, 2).is_some());
        assert_eq!(jobs.next_jid, 2);
        assert!(delete_job(&mut jobs, 7).is_none());
        assert_eq!(jobs.len(), 1);
    }

    #[test]
    fn test_wait_foreground_reports_last_stage() {
        let first = spawn("sh", &["-c", "exit 3"]);
        let last = spawn("sh", &["-c", "exit 5"]);
        let outcome = wait_foreground(&[first, last], Some(last), false);
        assert_eq!(outcome, ForegroundOutcome { status: 5, stopped: vec![] });
    }

    #[test]
    fn test_wait_foreground_signal_status() {
        let pid = spawn("sh", &["-c", "kill -9 $$"]);
        let outcome = wait_foreground(&[pid], Some(pid), false);
        assert_eq!(outcome.status, 128 + 9);
    }

    #[test]
    fn test_wait_foreground_without_last_stage_is_zero() {
        let pid = spawn("sh", &["-c", "exit 4"]);
        assert_eq!(wait_foreground(&[pid], None, false).status, 0);
    }

    #[test]
    fn test_reap_jobs_removes_finished() {
        let mut jobs = JobList::new();
        let pid = spawn("true", &[]);
        add_job(&mut jobs, pid, vec![pid], JobState::Running, "true".into());
        let mut done = Vec::new();
        for _ in 0..200 {
            done.extend(reap_jobs(&mut jobs));
            if !done.is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].state, JobState::Done);
        assert!(jobs.is_empty());
    }

    #[test]
    fn test_reap_jobs_keeps_running() {
        let mut jobs = JobList::new();
        let pid = spawn("sleep", &["5"]);
        add_job(&mut jobs, pid, vec![pid], JobState::Running, "sleep 5".into());
        assert!(reap_jobs(&mut jobs).is_empty());
        assert_eq!(jobs.len(), 1);
        kill(pid, Signal::SIGKILL).unwrap();
        waitpid(pid, None).unwrap();
    }

    #[test]
    fn test_restore_modes_round_trip() {
        use nix::fcntl::OFlag;
        use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt};
        use std::fs::OpenOptions;
        use std::os::unix::io::AsRawFd;

        let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY).unwrap();
        grantpt(&master).unwrap();
        unlockpt(&master).unwrap();
        let slave_name = ptsname_r(&master).unwrap();
        let slave = OpenOptions::new().read(true).write(true).open(slave_name).unwrap();
        let fd = slave.as_raw_fd();

        let terminal = Terminal::with_modes(fd).unwrap();
        let before = tcgetattr(fd).unwrap();

        // what an editor leaves behind when it dies in raw mode
        let mut raw = before.clone();
        raw.local_flags.remove(LocalFlags::ECHO | LocalFlags::ICANON);
        tcsetattr(fd, SetArg::TCSANOW, &raw).unwrap();
        assert_ne!(tcgetattr(fd).unwrap().local_flags, before.local_flags);

        terminal.restore_modes();
        let after = tcgetattr(fd).unwrap();
        assert_eq!(after.local_flags, before.local_flags);
        assert_eq!(after.input_flags, before.input_flags);
        assert_eq!(after.output_flags, before.output_flags);
    }
}
