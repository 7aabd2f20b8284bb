//! Startup file, prompt template and history location.

use nix::unistd::{gethostname, geteuid};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable holding the log filter.
pub const LOG_ENV: &str = "JSH_LOG";

pub const DEFAULT_PROMPT: &str = "[\\u@\\h \\w]\\$ ";

fn home() -> PathBuf {
    dirs_next::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

/// `~/.jshrc`
pub static RC_FILE: Lazy<PathBuf> = Lazy::new(|| home().join(".jshrc"));

/// `~/.jsh_history`
pub static HISTORY_FILE: Lazy<PathBuf> = Lazy::new(|| home().join(".jsh_history"));

/// What the startup file contributes.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct StartupConfig {
    pub aliases: HashMap<String, String>,
    pub prompt: Option<String>,
    /// Lines to execute before the first prompt.
    pub commands: Vec<String>,
}

impl StartupConfig {
    pub fn prompt(&self) -> &str {
        self.prompt.as_deref().unwrap_or(DEFAULT_PROMPT)
    }

    /// The template the editor shows; `-p` keeps the editor behind an
    /// empty prompt.
    pub fn prompt_template(&self, emit_prompt: bool) -> &str {
        if emit_prompt {
            self.prompt()
        } else {
            ""
        }
    }
}

/// Reads the startup file; a missing or unreadable file is an empty config.
pub fn load() -> StartupConfig {
    load_from(&RC_FILE)
}

pub fn load_from(path: &Path) -> StartupConfig {
    match fs::read_to_string(path) {
        Ok(text) => parse_rc(&text),
        Err(err) => {
            debug!(path = %path.display(), %err, "no startup file");
            StartupConfig::default()
        }
    }
}

/// Parses startup file text: `alias name=value`, `prompt=template`,
/// comments and blank lines; anything else is a command.
pub fn parse_rc(text: &str) -> StartupConfig {
    let mut config = StartupConfig::default();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("alias ") {
            if let Some((name, value)) = rest.trim().split_once('=') {
                config
                    .aliases
                    .insert(name.trim().to_string(), strip_quotes(value.trim()).to_string());
                continue;
            }
        }
        if let Some(template) = line.strip_prefix("prompt=") {
            config.prompt = Some(strip_quotes(template).to_string());
            continue;
        }
        config.commands.push(line.to_string());
    }
    config
}

fn strip_quotes(value: &str) -> &str {
    for quote in ['\'', '"'] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner;
        }
    }
    value
}

/// Expands `\u`, `\h`, `\w`, `\$` and `\\` in a prompt template.
/// Unknown escapes are kept as written.
pub fn render_prompt(template: &str) -> String {
    let mut out = String::with_capacity(template.len() + 32);
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('u') => out.push_str(&user_name()),
            Some('h') => out.push_str(&host_name()),
            Some('w') => out.push_str(&working_directory()),
            Some('$') => out.push(if geteuid().is_root() { '#' } else { '$' }),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn user_name() -> String {
    env::var("USER")
        .or_else(|_| env::var("LOGNAME"))
        .unwrap_or_else(|_| "?".to_string())
}

fn host_name() -> String {
    let name = gethostname()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string());
    // short form, like \h in other shells
    match name.split_once('.') {
        Some((short, _)) => short.to_string(),
        None => name,
    }
}

fn working_directory() -> String {
    let cwd = match env::current_dir() {
        Ok(cwd) => cwd,
        Err(_) => return "?".to_string(),
    };
    abbreviate_home(&cwd, dirs_next::home_dir().as_deref())
}

fn abbreviate_home(path: &Path, home: Option<&Path>) -> String {
    if let Some(home) = home {
        if let Ok(rest) = path.strip_prefix(home) {
            if rest.as_os_str().is_empty() {
                return "~".to_string();
            }
            return format!("~/{}", rest.display());
        }
    }
    path.display().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_rc() {
        let text = "\
# comment
alias ll='ls -l'
alias g=\"git status\"
prompt=\"\\w> \"

echo hello
";
        let config = parse_rc(text);
        assert_eq!(config.aliases.get("ll").map(String::as_str), Some("ls -l"));
        assert_eq!(config.aliases.get("g").map(String::as_str), Some("git status"));
        assert_eq!(config.prompt.as_deref(), Some("\\w> "));
        assert_eq!(config.commands, vec!["echo hello".to_string()]);
    }

    #[test]
    fn test_default_prompt() {
        assert_eq!(StartupConfig::default().prompt(), DEFAULT_PROMPT);
    }

    #[test]
    fn test_prompt_suppressed() {
        let config = parse_rc("prompt=\"> \"");
        assert_eq!(config.prompt_template(true), "> ");
        assert_eq!(config.prompt_template(false), "");
        assert_eq!(render_prompt(config.prompt_template(false)), "");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "alias k=v").unwrap();
        let config = load_from(file.path());
        assert_eq!(config.aliases.get("k").map(String::as_str), Some("v"));
        assert_eq!(load_from(Path::new("/nonexistent/jshrc")), StartupConfig::default());
    }

    #[test]
    fn test_render_prompt_escapes() {
        let marker = if geteuid().is_root() { "#" } else { "$" };
        assert_eq!(render_prompt("\\$ "), format!("{} ", marker));
        assert_eq!(render_prompt("a\\\\b"), "a\\b");
        assert_eq!(render_prompt("\\x\\"), "\\x\\");
        assert!(!render_prompt("\\h").is_empty());
    }

    #[test]
    fn test_abbreviate_home() {
        let home = Path::new("/home/me");
        assert_eq!(abbreviate_home(Path::new("/home/me"), Some(home)), "~");
        assert_eq!(abbreviate_home(Path::new("/home/me/src"), Some(home)), "~/src");
        assert_eq!(abbreviate_home(Path::new("/tmp"), Some(home)), "/tmp");
        assert_eq!(abbreviate_home(Path::new("/tmp"), None), "/tmp");
    }
}
