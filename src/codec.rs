//! Line-oriented `key=value` encoding of the backing file.
//!
//! The file is always rewritten whole, sorted by key, one property per line.
//! Backslash escapes keep separators and line breaks inside keys and values.
//! Reading is lenient: blank lines and `#`/`!` comment lines are skipped and
//! either `=` or `:` may separate a key from its value.

use crate::action::Properties;

/// Render properties to the file format.
pub fn encode(props: &Properties) -> String {
    let mut out = String::new();
    for (key, value) in props {
        escape_into(&mut out, key, true);
        out.push('=');
        escape_into(&mut out, value, false);
        out.push('\n');
    }
    out
}

/// Parse the file format.
pub fn decode(text: &str) -> Properties {
    let mut props = Properties::new();
    for line in text.lines() {
        let line = line.trim_start_matches(is_blank);
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }
        let (key, value) = split_line(line);
        props.insert(
            unescape(trim_key(key)),
            unescape(value.trim_start_matches(is_blank)),
        );
    }
    props
}

/// Whitespace the reader drops around separators and at line starts.
fn is_blank(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\x0c')
}

fn escape_into(out: &mut String, text: &str, is_key: bool) {
    for (i, c) in text.chars().enumerate() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\x0c' => out.push_str("\\f"),
            '=' | ':' if is_key => {
                out.push('\\');
                out.push(c);
            }
            '#' | '!' if is_key && i == 0 => {
                out.push('\\');
                out.push(c);
            }
            ' ' if is_key || i == 0 => out.push_str("\\ "),
            c => out.push(c),
        }
    }
}

/// Split at the first unescaped separator.
fn split_line(line: &str) -> (&str, &str) {
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '=' | ':' => return (&line[..i], &line[i + 1..]),
            _ => {}
        }
    }
    (line, "")
}

/// Drop trailing whitespace that is not escaped.
fn trim_key(key: &str) -> &str {
    let bytes = key.as_bytes();
    let mut end = bytes.len();
    while end > 0 && matches!(bytes[end - 1], b' ' | b'\t' | 0x0c) {
        if end >= 2 && bytes[end - 2] == b'\\' {
            break;
        }
        end -= 1;
    }
    &key[..end]
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('f') => out.push('\x0c'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}
