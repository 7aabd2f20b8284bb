use crate::jobs::{self, list_jobs};
use crate::shell::Shell;
use crate::utils::report;
use std::env;
use std::path::PathBuf;

/// Commands the shell runs itself instead of forking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Cd,
    Exit,
    Jobs,
    Fg,
    Bg,
    Alias,
    Unalias,
    Export,
    Help,
    /// A command made only of `NAME=value` words.
    Assign,
}

/// Checks if the command is a built-in command.
/// Supported built-ins include "cd", "exit"/"quit", "jobs", "fg", "bg",
/// "alias", "unalias", "export", "help", and bare variable assignments.
pub fn lookup(argv: &[String]) -> Option<Builtin> {
    let first = argv.first()?;
    let builtin = match first.as_str() {
        "cd" => Builtin::Cd,
        "exit" | "quit" => Builtin::Exit,
        "jobs" => Builtin::Jobs,
        "fg" => Builtin::Fg,
        "bg" => Builtin::Bg,
        "alias" => Builtin::Alias,
        "unalias" => Builtin::Unalias,
        "export" => Builtin::Export,
        "help" => Builtin::Help,
        _ if argv.iter().all(|word| split_assignment(word).is_some()) => Builtin::Assign,
        _ => return None,
    };
    Some(builtin)
}

/// Executes a built-in with already expanded arguments and returns its
/// status. Failures are reported on stderr and give status 1.
pub fn run(shell: &mut Shell, builtin: Builtin, argv: &[String]) -> i32 {
    let args = argv.get(1..).unwrap_or_default();
    match builtin {
        Builtin::Cd => change_directory(args),
        Builtin::Exit => exit(shell, args),
        Builtin::Jobs => {
            shell.notify_finished_jobs();
            list_jobs(shell.jobs());
            0
        }
        Builtin::Fg => resume(shell, args, true),
        Builtin::Bg => resume(shell, args, false),
        Builtin::Alias => alias(shell, args),
        Builtin::Unalias => unalias(shell, args),
        Builtin::Export => export(shell, args),
        Builtin::Help => {
            print_help();
            0
        }
        Builtin::Assign => {
            for word in argv {
                if let Some((name, value)) = split_assignment(word) {
                    shell.set_variable(name, value);
                }
            }
            0
        }
    }
}

/// Splits `NAME=value` where NAME is a valid variable name.
pub fn split_assignment(word: &str) -> Option<(&str, &str)> {
    let (name, value) = word.split_once('=')?;
    is_valid_name(name).then_some((name, value))
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn change_directory(args: &[String]) -> i32 {
    if args.len() > 1 {
        report("cd", "too many arguments");
        return 1;
    }
    let target = match args.first().map(String::as_str) {
        None | Some("~") => match dirs_next::home_dir() {
            Some(home) => home,
            None => {
                report("cd", "HOME not set");
                return 1;
            }
        },
        Some("-") => match env::var_os("OLDPWD") {
            Some(previous) => {
                let previous = PathBuf::from(previous);
                println!("{}", previous.display());
                previous
            }
            None => {
                report("cd", "OLDPWD not set");
                return 1;
            }
        },
        Some(dir) => PathBuf::from(dir),
    };
    let previous = env::current_dir().ok();
    if let Err(err) = env::set_current_dir(&target) {
        report(&format!("cd: {}", target.display()), err);
        return 1;
    }
    if let Some(previous) = previous {
        env::set_var("OLDPWD", previous);
    }
    if let Ok(now) = env::current_dir() {
        env::set_var("PWD", now);
    }
    0
}

fn exit(shell: &mut Shell, args: &[String]) -> i32 {
    let code = match args.first() {
        None => shell.last_status(),
        Some(arg) => match arg.parse::<i32>() {
            Ok(code) => code & 0xff,
            Err(_) => {
                report(&format!("exit: {}", arg), "numeric argument required");
                2
            }
        },
    };
    shell.state.exit_requested = Some(code);
    code
}

/// Parses `%n` or `n`; no argument means the most recent job.
fn job_argument(shell: &Shell, args: &[String]) -> Option<i32> {
    match args.first() {
        None => jobs::current_jid(shell.jobs()),
        Some(arg) => arg.strip_prefix('%').unwrap_or(arg).parse().ok(),
    }
}

fn resume(shell: &mut Shell, args: &[String], foreground: bool) -> i32 {
    let name = if foreground { "fg" } else { "bg" };
    if !shell.terminal().job_control() {
        report(name, "no job control");
        return 1;
    }
    let Some(jid) = job_argument(shell, args) else {
        report(name, "no such job");
        return 1;
    };
    match shell.resume_job(jid, foreground) {
        Ok(status) => status,
        Err(err) => {
            report(name, err);
            1
        }
    }
}

fn alias(shell: &mut Shell, args: &[String]) -> i32 {
    if args.is_empty() {
        let mut names: Vec<_> = shell.state.aliases.iter().collect();
        names.sort();
        for (name, value) in names {
            println!("alias {}='{}'", name, value);
        }
        return 0;
    }
    let mut status = 0;
    for arg in args {
        match arg.split_once('=') {
            Some((name, value)) if !name.is_empty() => {
                shell.state.aliases.insert(name.to_string(), value.to_string());
            }
            _ => match shell.state.aliases.get(arg.as_str()) {
                Some(value) => println!("alias {}='{}'", arg, value),
                None => {
                    report(&format!("alias: {}", arg), "not found");
                    status = 1;
                }
            },
        }
    }
    status
}

fn unalias(shell: &mut Shell, args: &[String]) -> i32 {
    if args.is_empty() {
        report("unalias", "usage: unalias name [name ...]");
        return 1;
    }
    let mut status = 0;
    for name in args {
        if shell.state.aliases.remove(name.as_str()).is_none() {
            report(&format!("unalias: {}", name), "not found");
            status = 1;
        }
    }
    status
}

fn export(shell: &mut Shell, args: &[String]) -> i32 {
    let mut status = 0;
    for arg in args {
        if let Some((name, value)) = split_assignment(arg) {
            shell.state.variables.remove(name);
            env::set_var(name, value);
        } else if is_valid_name(arg) {
            if let Some(value) = shell.state.variables.remove(arg.as_str()) {
                env::set_var(arg, value);
            }
        } else {
            report(&format!("export: {}", arg), "not a valid identifier");
            status = 1;
        }
    }
    status
}

fn print_help() {
    println!("jsh built-in commands:");
    println!("   cd [dir | -]        change the working directory");
    println!("   exit [n], quit      leave the shell");
    println!("   jobs                list background and stopped jobs");
    println!("   fg [%n]             continue a job in the foreground");
    println!("   bg [%n]             continue a stopped job in the background");
    println!("   alias [name=value]  define or list aliases");
    println!("   unalias name        remove an alias");
    println!("   export name[=value] move a variable into the environment");
    println!("   NAME=value          set a shell variable");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(line: &str) -> Vec<String> {
        line.split_whitespace().map(String::from).collect()
    }

    #[test]
    fn test_lookup() {
        assert_eq!(lookup(&words("cd /tmp")), Some(Builtin::Cd));
        assert_eq!(lookup(&words("quit")), Some(Builtin::Exit));
        assert_eq!(lookup(&words("A=1 B=2")), Some(Builtin::Assign));
        assert_eq!(lookup(&words("A=1 ls")), None);
        assert_eq!(lookup(&words("ls -l")), None);
        assert_eq!(lookup(&[]), None);
    }

    #[test]
    fn test_split_assignment() {
        assert_eq!(split_assignment("NAME=a=b"), Some(("NAME", "a=b")));
        assert_eq!(split_assignment("_x1="), Some(("_x1", "")));
        assert_eq!(split_assignment("1X=2"), None);
        assert_eq!(split_assignment("--opt=2"), None);
        assert_eq!(split_assignment("plain"), None);
    }

    #[test]
    fn test_assign_sets_shell_variables() {
        let mut shell = Shell::detached();
        assert_eq!(run(&mut shell, Builtin::Assign, &words("A=1 B=two")), 0);
        assert_eq!(shell.state.variables.get("A").map(String::as_str), Some("1"));
        assert_eq!(shell.state.variables.get("B").map(String::as_str), Some("two"));
    }

    #[test]
    fn test_alias_and_unalias() {
        let mut shell = Shell::detached();
        assert_eq!(run(&mut shell, Builtin::Alias, &words("alias ll=ls")), 0);
        assert_eq!(shell.state.aliases.get("ll").map(String::as_str), Some("ls"));
        assert_eq!(run(&mut shell, Builtin::Alias, &words("alias nope")), 1);
        assert_eq!(run(&mut shell, Builtin::Unalias, &words("unalias ll")), 0);
        assert_eq!(run(&mut shell, Builtin::Unalias, &words("unalias ll")), 1);
    }

    #[test]
    fn test_exit_codes() {
        let mut shell = Shell::detached();
        shell.state.last_status = 4;
        assert_eq!(run(&mut shell, Builtin::Exit, &words("exit")), 4);
        assert_eq!(shell.state.exit_requested, Some(4));
        assert_eq!(run(&mut shell, Builtin::Exit, &words("exit 256")), 0);
        assert_eq!(run(&mut shell, Builtin::Exit, &words("exit x")), 2);
    }

    #[test]
    fn test_cd_failure_is_status_one() {
        let mut shell = Shell::detached();
        let argv = words("cd /definitely/not/a/dir");
        assert_eq!(run(&mut shell, Builtin::Cd, &argv), 1);
        assert_eq!(run(&mut shell, Builtin::Cd, &words("cd a b")), 1);
    }

    #[test]
    fn test_fg_without_job_control() {
        let mut shell = Shell::detached();
        assert_eq!(run(&mut shell, Builtin::Fg, &words("fg %1")), 1);
        assert_eq!(run(&mut shell, Builtin::Bg, &words("bg")), 1);
    }

    #[test]
    fn test_export_moves_variable() {
        let mut shell = Shell::detached();
        shell.set_variable("JSH_EXPORT_TEST", "v");
        assert_eq!(run(&mut shell, Builtin::Export, &words("export JSH_EXPORT_TEST")), 0);
        assert!(!shell.state.variables.contains_key("JSH_EXPORT_TEST"));
        assert_eq!(env::var("JSH_EXPORT_TEST").as_deref(), Ok("v"));
        assert_eq!(run(&mut shell, Builtin::Export, &words("export 9bad")), 1);
    }
}
