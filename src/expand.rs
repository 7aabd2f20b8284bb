//! Argument expansion.
//!
//! Each raw token goes through five passes in a fixed order: command
//! substitution, arithmetic, variables, brace ranges and finally filesystem
//! globbing. Every pass is a plain function over one token so it can be
//! exercised on its own; [`expand_token`] chains them.

use glob::glob;
use tracing::debug;

/// What the expansion passes need from the running shell.
pub trait ExpansionContext {
    /// Value of `name`: shell-local variable first, then the process
    /// environment. `?` is the last exit status.
    fn lookup(&self, name: &str) -> Option<String>;

    /// Runs `line` as a new top-level line and returns its standard output.
    fn capture_output(&mut self, line: &str) -> String;
}

/// Expands every token of a segment and concatenates the results in order.
pub fn expand(tokens: &[String], ctx: &mut dyn ExpansionContext) -> Vec<String> {
    let mut words = Vec::with_capacity(tokens.len());
    for token in tokens {
        words.extend(expand_token(token, ctx));
    }
    words
}

/// Expands one token into zero or more words.
pub fn expand_token(token: &str, ctx: &mut dyn ExpansionContext) -> Vec<String> {
    let token = substitute_commands(token, &mut |line| ctx.capture_output(line));
    let token = expand_arithmetic(&token, |name| ctx.lookup(name));
    let token = expand_variables(&token, |name| ctx.lookup(name));
    let words: Vec<String> = expand_braces(&token)
        .iter()
        .flat_map(|word| expand_glob(word))
        .collect();
    debug!(?words, "expanded token");
    words
}

/// Replaces every `$(...)` with the output of running its contents, minus
/// trailing newlines. `$((` is left alone for the arithmetic pass. An
/// unbalanced `$(` is kept literally.
pub fn substitute_commands(token: &str, run: &mut dyn FnMut(&str) -> String) -> String {
    let mut out = String::with_capacity(token.len());
    let mut rest = token;
    while let Some(start) = rest.find("$(") {
        out.push_str(&rest[..start]);
        let inner = &rest[start + 2..];
        if inner.starts_with('(') {
            out.push_str("$(");
            rest = inner;
            continue;
        }
        match closing_paren(inner) {
            Some(end) => {
                let output = run(&inner[..end]);
                out.push_str(output.trim_end_matches('\n'));
                rest = &inner[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Byte offset of the `)` that closes an already opened `(`.
fn closing_paren(s: &str) -> Option<usize> {
    let mut depth = 1usize;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Replaces every `$((lhs op rhs))` with its integer value.
///
/// `op` is one of `+ - * / %`; operands are integers or variable names
/// (with or without `$`), unset names counting as 0. Division or modulo by
/// zero yields 0, and so does an expression that does not have this shape.
pub fn expand_arithmetic<F>(token: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(token.len());
    let mut rest = token;
    while let Some(start) = rest.find("$((") {
        let inner = &rest[start + 3..];
        let Some(end) = inner.find("))") else {
            break;
        };
        out.push_str(&rest[..start]);
        let value = evaluate(&inner[..end], &lookup).unwrap_or(0);
        out.push_str(&value.to_string());
        rest = &inner[end + 2..];
    }
    out.push_str(rest);
    out
}

fn evaluate<F>(expr: &str, lookup: &F) -> Option<i64>
where
    F: Fn(&str) -> Option<String>,
{
    let expr = expr.trim();
    // skip(1) so a leading sign belongs to the left operand
    let Some((idx, op)) = expr
        .char_indices()
        .skip(1)
        .find(|&(_, c)| matches!(c, '+' | '-' | '*' | '/' | '%'))
    else {
        return operand(expr, lookup);
    };
    let lhs = operand(&expr[..idx], lookup)?;
    let rhs = operand(&expr[idx + 1..], lookup)?;
    Some(match op {
        '+' => lhs.wrapping_add(rhs),
        '-' => lhs.wrapping_sub(rhs),
        '*' => lhs.wrapping_mul(rhs),
        '/' if rhs == 0 => 0,
        '/' => lhs.wrapping_div(rhs),
        '%' if rhs == 0 => 0,
        _ => lhs.wrapping_rem(rhs),
    })
}

fn operand<F>(text: &str, lookup: &F) -> Option<i64>
where
    F: Fn(&str) -> Option<String>,
{
    let text = text.trim();
    if let Ok(n) = text.parse() {
        return Some(n);
    }
    let name = text.strip_prefix('$').unwrap_or(text);
    if !is_name(name) {
        return None;
    }
    Some(lookup(name).and_then(|v| v.trim().parse().ok()).unwrap_or(0))
}

fn is_name_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn is_name(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if is_name_start(c)) && chars.all(is_name_char)
}

/// Replaces `$NAME` and `$?` with their values, unset names with the empty
/// string. A `$` not followed by a name stays as it is.
pub fn expand_variables<F>(token: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(token.len());
    let mut chars = token.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('?') => {
                chars.next();
                out.push_str(&lookup("?").unwrap_or_default());
            }
            Some(&next) if is_name_start(next) => {
                let mut name = String::new();
                while let Some(&c) = chars.peek() {
                    if !is_name_char(c) {
                        break;
                    }
                    name.push(c);
                    chars.next();
                }
                out.push_str(&lookup(&name).unwrap_or_default());
            }
            _ => out.push('$'),
        }
    }
    out
}

/// Expands `{A..B}` integer ranges, one word per value from `A` up to `B`.
///
/// A range with `A > B` produces no words at all. Several ranges in one
/// token multiply out left to right.
pub fn expand_braces(token: &str) -> Vec<String> {
    match find_range(token) {
        Some((open, close, first, last)) => {
            let prefix = &token[..open];
            let suffix = &token[close + 1..];
            (first..=last)
                .flat_map(|n| expand_braces(&format!("{prefix}{n}{suffix}")))
                .collect()
        }
        None => vec![token.to_string()],
    }
}

fn find_range(token: &str) -> Option<(usize, usize, i64, i64)> {
    let mut from = 0;
    while let Some(offset) = token[from..].find('{') {
        let open = from + offset;
        if let Some(len) = token[open..].find('}') {
            let close = open + len;
            if let Some((a, b)) = token[open + 1..close].split_once("..") {
                if let (Ok(a), Ok(b)) = (a.parse::<i64>(), b.parse::<i64>()) {
                    return Some((open, close, a, b));
                }
            }
        }
        from = open + 1;
    }
    None
}

/// Matches `pattern` against the filesystem. A pattern that matches
/// nothing, or is not a valid pattern, comes back unchanged.
pub fn expand_glob(pattern: &str) -> Vec<String> {
    if !pattern.contains(['*', '?', '[']) {
        return vec![pattern.to_string()];
    }
    let matches: Vec<String> = match glob(pattern) {
        Ok(paths) => paths
            .filter_map(|p| p.ok())
            .map(|p| p.to_string_lossy().into_owned())
            .collect(),
        Err(err) => {
            debug!(%pattern, %err, "invalid glob pattern");
            Vec::new()
        }
    };
    if matches.is_empty() {
        vec![pattern.to_string()]
    } else {
        matches
    }
}
