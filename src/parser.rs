//! Line lexer and pipeline parser.
//!
//! A single left-to-right scan turns one input line into a [`Sequence`]:
//! pipelines split on unquoted `;`, `&&` and `||`, each pipeline made of
//! [`CommandSegment`]s split on unquoted `|`. Argument tokens come out with
//! quotes stripped and escapes resolved but are otherwise raw; expansion
//! happens later, inside the child that runs the segment.
//!
//! Recovery policy for malformed input is best-effort, never a hard error:
//!
//! - an unterminated quote is closed implicitly at end of line;
//! - a redirection operator with no filename after it is dropped;
//! - a here-document whose terminator never arrives takes every line the
//!   source produced before it ran dry.

use std::collections::HashMap;
use std::fmt;
use tracing::warn;

/// How the previous pipeline's exit status gates the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connector {
    /// `;` or start of line: always run.
    Always,
    /// `&&`: run only after status 0.
    And,
    /// `||`: run only after a non-zero status.
    Or,
}

impl Connector {
    pub fn permits(self, last_status: i32) -> bool {
        match self {
            Connector::Always => true,
            Connector::And => last_status == 0,
            Connector::Or => last_status != 0,
        }
    }
}

/// Where a segment's standard input comes from when it is not inherited
/// or piped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSource {
    /// `< path`
    File(String),
    /// `<<TERM`, with the collected body.
    HereDoc(String),
}

/// Output redirection of a segment. Being an enum, a segment can never
/// carry both a truncating and an appending target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    Truncate(String),
    Append(String),
}

impl OutputTarget {
    pub fn path(&self) -> &str {
        match self {
            OutputTarget::Truncate(path) | OutputTarget::Append(path) => path,
        }
    }

    pub fn is_append(&self) -> bool {
        matches!(self, OutputTarget::Append(_))
    }
}

/// One pipeline stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSegment {
    /// Command and its arguments, unexpanded.
    pub argv: Vec<String>,
    /// Input redirection, if any.
    pub input: Option<InputSource>,
    /// Output redirection, if any.
    pub output: Option<OutputTarget>,
}

impl CommandSegment {
    /// Creates a new, empty segment.
    pub fn new() -> Self {
        Self::default()
    }

    /// True when the segment has nothing to run and nothing to open, as
    /// produced by a trailing `|` or a trailing `;`. Such a segment spawns
    /// no process and counts as status 0.
    pub fn is_empty(&self) -> bool {
        self.argv.is_empty() && self.input.is_none() && self.output.is_none()
    }
}

/// Segments connected stdout-to-stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    pub segments: Vec<CommandSegment>,
    /// Set by a single `&` anywhere in the pipeline.
    pub background: bool,
}

impl Pipeline {
    fn new() -> Self {
        Pipeline {
            segments: Vec::new(),
            background: false,
        }
    }

    /// True when no segment has anything to run.
    pub fn is_empty(&self) -> bool {
        self.segments.iter().all(CommandSegment::is_empty)
    }
}

impl fmt::Display for CommandSegment {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut parts: Vec<String> = self.argv.clone();
        match &self.input {
            Some(InputSource::File(path)) => parts.push(format!("< {}", path)),
            Some(InputSource::HereDoc(_)) => parts.push("<< (here-document)".to_string()),
            None => {}
        }
        match &self.output {
            Some(OutputTarget::Truncate(path)) => parts.push(format!("> {}", path)),
            Some(OutputTarget::Append(path)) => parts.push(format!(">> {}", path)),
            None => {}
        }
        write!(f, "{}", parts.join(" "))
    }
}

/// Renders the pipeline back as a command line, for job listings.
impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let segments: Vec<String> = self.segments.iter().map(|s| s.to_string()).collect();
        write!(f, "{}", segments.join(" | "))?;
        if self.background {
            write!(f, " &")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceEntry {
    /// Gate applied to the status of the entry before this one.
    pub connector: Connector,
    pub pipeline: Pipeline,
}

/// A whole input line: pipelines in order, each tagged with its gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sequence {
    pub entries: Vec<SequenceEntry>,
}

/// Supplies the raw lines of a here-document body.
///
/// The lines come from the same stream the line itself was read from and
/// bypass the parser entirely.
pub trait LineSource {
    fn next_line(&mut self) -> Option<String>;
}

impl<I: Iterator<Item = String>> LineSource for I {
    fn next_line(&mut self) -> Option<String> {
        self.next()
    }
}

/// Parses `line`, reading here-document bodies from `heredocs`.
pub fn parse(line: &str, heredocs: &mut dyn LineSource) -> Sequence {
    Lexer::new(line, heredocs).run()
}

/// Parses a line that has no further input behind it. Here-documents get
/// an empty body.
pub fn parse_line(line: &str) -> Sequence {
    parse(line, &mut std::iter::empty::<String>())
}

fn is_separator(c: char) -> bool {
    c.is_whitespace() || matches!(c, '|' | '<' | '>' | '&' | ';')
}

struct Lexer<'a> {
    chars: Vec<char>,
    pos: usize,
    heredocs: &'a mut dyn LineSource,
    entries: Vec<SequenceEntry>,
    pipeline: Pipeline,
    segment: CommandSegment,
    connector: Connector,
}

impl<'a> Lexer<'a> {
    fn new(line: &str, heredocs: &'a mut dyn LineSource) -> Self {
        Lexer {
            chars: line.chars().collect(),
            pos: 0,
            heredocs,
            entries: Vec::new(),
            pipeline: Pipeline::new(),
            segment: CommandSegment::new(),
            connector: Connector::Always,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn run(mut self) -> Sequence {
        while let Some(c) = self.peek() {
            match c {
                c if c.is_whitespace() => self.pos += 1,
                // comment: only at the start of a word
                '#' => break,
                '|' if self.peek_at(1) == Some('|') => {
                    self.pos += 2;
                    self.close_pipeline(Connector::Or);
                }
                '|' => {
                    self.pos += 1;
                    self.close_segment();
                }
                '&' if self.peek_at(1) == Some('&') => {
                    self.pos += 2;
                    self.close_pipeline(Connector::And);
                }
                '&' => {
                    self.pos += 1;
                    self.pipeline.background = true;
                }
                ';' => {
                    self.pos += 1;
                    self.close_pipeline(Connector::Always);
                }
                '>' => {
                    self.pos += 1;
                    let append = self.peek() == Some('>');
                    if append {
                        self.pos += 1;
                    }
                    self.redirect_output(append);
                }
                '<' => {
                    self.pos += 1;
                    if self.peek() == Some('<') {
                        self.pos += 1;
                        self.here_document();
                    } else {
                        self.redirect_input();
                    }
                }
                _ => {
                    if let Some(word) = self.read_word() {
                        self.segment.argv.push(word);
                    }
                }
            }
        }
        self.close_pipeline(Connector::Always);
        Sequence {
            entries: self.entries,
        }
    }

    fn close_segment(&mut self) {
        let segment = std::mem::take(&mut self.segment);
        self.pipeline.segments.push(segment);
    }

    fn close_pipeline(&mut self, next: Connector) {
        self.close_segment();
        let pipeline = std::mem::replace(&mut self.pipeline, Pipeline::new());
        self.entries.push(SequenceEntry {
            connector: self.connector,
            pipeline,
        });
        self.connector = next;
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    /// Reads the filename that follows a redirection operator.
    fn read_target(&mut self, operator: &str) -> Option<String> {
        self.skip_whitespace();
        match self.peek() {
            Some(c) if !is_separator(c) => self.read_word(),
            _ => {
                warn!(%operator, "missing filename after redirection, ignoring it");
                None
            }
        }
    }

    fn redirect_output(&mut self, append: bool) {
        let operator = if append { ">>" } else { ">" };
        if let Some(path) = self.read_target(operator) {
            self.segment.output = Some(if append {
                OutputTarget::Append(path)
            } else {
                OutputTarget::Truncate(path)
            });
        }
    }

    fn redirect_input(&mut self) {
        if let Some(path) = self.read_target("<") {
            self.segment.input = Some(InputSource::File(path));
        }
    }

    fn here_document(&mut self) {
        let Some(terminator) = self.read_target("<<") else {
            return;
        };
        let mut body = String::new();
        loop {
            match self.heredocs.next_line() {
                Some(line) => {
                    let line = line.trim_end_matches(['\n', '\r']);
                    if line == terminator {
                        break;
                    }
                    body.push_str(line);
                    body.push('\n');
                }
                None => {
                    warn!(%terminator, "here-document ended before its terminator");
                    break;
                }
            }
        }
        self.segment.input = Some(InputSource::HereDoc(body));
    }

    /// Reads one word with quotes stripped and escapes resolved. Returns
    /// `None` only when nothing was consumed; a quoted empty string is an
    /// empty word.
    fn read_word(&mut self) -> Option<String> {
        let mut word = String::new();
        let mut quoted = false;
        let mut quote: Option<char> = None;
        while let Some(c) = self.peek() {
            match quote {
                Some(q) if c == q => {
                    quote = None;
                    self.pos += 1;
                }
                Some('\'') => {
                    word.push(c);
                    self.pos += 1;
                }
                Some(_) => {
                    if c == '\\' {
                        if let Some(next @ ('"' | '\\')) = self.peek_at(1) {
                            word.push(next);
                            self.pos += 2;
                            continue;
                        }
                    }
                    word.push(c);
                    self.pos += 1;
                }
                None if c == '$' && self.peek_at(1) == Some('(') => self.read_substitution(&mut word),
                None if is_separator(c) => break,
                None => {
                    self.pos += 1;
                    match c {
                        '\'' | '"' => {
                            quote = Some(c);
                            quoted = true;
                        }
                        '\\' => {
                            if let Some(next) = self.peek() {
                                word.push(next);
                                self.pos += 1;
                            }
                        }
                        _ => word.push(c),
                    }
                }
            }
        }
        if word.is_empty() && !quoted {
            None
        } else {
            Some(word)
        }
    }

    /// Copies a `$(...)` group into `word` untouched, up to its matching
    /// parenthesis, so the enclosed line keeps its spaces and operators.
    fn read_substitution(&mut self, word: &mut String) {
        let mut depth = 0usize;
        while let Some(c) = self.peek() {
            word.push(c);
            self.pos += 1;
            match c {
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                _ => {}
            }
        }
    }
}

/// Replaces the first word at every command position with its alias text.
///
/// Command positions are the start of the line and the point after any
/// unquoted `|`, `;` or `&`. Only a bare word that is an alias name in full
/// is replaced, and the replacement is not scanned again.
pub fn substitute_aliases(line: &str, aliases: &HashMap<String, String>) -> String {
    if aliases.is_empty() {
        return line.to_string();
    }
    let chars: Vec<char> = line.chars().collect();
    let mut out = String::with_capacity(line.len());
    let mut command_position = true;
    let mut quote: Option<char> = None;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if let Some(q) = quote {
            out.push(c);
            if c == q {
                quote = None;
            } else if c == '\\' && q == '"' && i + 1 < chars.len() {
                out.push(chars[i + 1]);
                i += 1;
            }
            i += 1;
            continue;
        }
        match c {
            '\'' | '"' => {
                quote = Some(c);
                command_position = false;
                out.push(c);
                i += 1;
            }
            '\\' => {
                out.push(c);
                if i + 1 < chars.len() {
                    out.push(chars[i + 1]);
                    i += 1;
                }
                command_position = false;
                i += 1;
            }
            '|' | ';' | '&' => {
                out.push(c);
                command_position = true;
                i += 1;
            }
            '<' | '>' => {
                out.push(c);
                command_position = false;
                i += 1;
            }
            c if c.is_whitespace() => {
                out.push(c);
                i += 1;
            }
            _ => {
                let start = i;
                while i < chars.len() && !is_separator(chars[i]) && !matches!(chars[i], '\'' | '"' | '\\') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let whole_word = i == chars.len() || is_separator(chars[i]);
                match aliases.get(&word) {
                    Some(replacement) if command_position && whole_word => out.push_str(replacement),
                    _ => out.push_str(&word),
                }
                command_position = false;
            }
        }
    }
    out
}
