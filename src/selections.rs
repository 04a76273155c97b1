//! Selection files: `"<name>" "<action>"` per line, `#` comments.

use std::io::{BufRead, Write};

use tracing::debug;

use crate::error::{ParseError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionAction {
    Install,
    Uninstall,
}

impl SelectionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Uninstall => "uninstall",
        }
    }

    fn parse(action: &str) -> Option<Self> {
        match action {
            "install" => Some(Self::Install),
            "uninstall" => Some(Self::Uninstall),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub name: String,
    pub action: SelectionAction,
}

/// Parse a whole selection file.
///
/// Lines longer than `line_limit` bytes (newline excluded) are rejected.
/// Lines with an unknown action are skipped. Nothing is returned unless the
/// whole input parses.
pub fn read_selections<R: BufRead>(mut reader: R, line_limit: usize) -> Result<Vec<Selection>> {
    let mut selections = Vec::new();
    let mut buf = Vec::new();
    let mut line_no = 0usize;

    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        line_no += 1;

        if buf.last() == Some(&b'\n') {
            buf.pop();
        }
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
        if buf.len() > line_limit {
            return Err(ParseError::LineTooLong {
                line: line_no,
                len: buf.len(),
                limit: line_limit,
            }
            .into());
        }

        let line = String::from_utf8_lossy(&buf);
        let mut rest = line.trim();
        if rest.is_empty() || rest.starts_with('#') {
            continue;
        }

        let malformed = || ParseError::Malformed { line: line_no };
        let name = parse_quote_word(&mut rest).ok_or_else(malformed)?;
        let action = parse_quote_word(&mut rest).ok_or_else(malformed)?;

        match SelectionAction::parse(&action) {
            Some(action) => selections.push(Selection { name, action }),
            None => debug!(line = line_no, action, "ignoring unknown selection action"),
        }
    }

    Ok(selections)
}

/// Write one line per selection, quoted so `read_selections` reads it back
pub fn write_selections<'a, W: Write>(
    mut writer: W,
    selections: impl IntoIterator<Item = (&'a str, SelectionAction)>,
) -> Result<()> {
    for (name, action) in selections {
        writeln!(writer, "\"{}\" \"{}\"", quote(name), action.as_str())?;
    }
    writer.flush()?;
    Ok(())
}

/// Take the next whitespace separated word from `input`. Double quotes group
/// words and are dropped; `%XX` escapes are decoded.
fn parse_quote_word(input: &mut &str) -> Option<String> {
    let s = input.trim_start();
    if s.is_empty() {
        return None;
    }

    let mut word = String::new();
    let mut in_quote = false;
    let mut end = s.len();
    for (i, c) in s.char_indices() {
        match c {
            '"' => in_quote = !in_quote,
            c if c.is_whitespace() && !in_quote => {
                end = i;
                break;
            }
            c => word.push(c),
        }
    }

    *input = &s[end..];
    Some(dequote(&word))
}

fn dequote(word: &str) -> String {
    let bytes = word.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let decoded = std::str::from_utf8(&bytes[i + 1..i + 3])
                .ok()
                .and_then(|hex| u8::from_str_radix(hex, 16).ok());
            if let Some(byte) = decoded {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn quote(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c == '%' || c == '"' || c.is_whitespace() {
            let mut buf = [0u8; 4];
            for byte in c.encode_utf8(&mut buf).bytes() {
                out.push_str(&format!("%{byte:02x}"));
            }
        } else {
            out.push(c);
        }
    }
    out
}
