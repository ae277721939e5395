//! Script parsing.
//!
//! A script is a list of instructions followed by an optional archive of
//! embedded files:
//!
//! ```text
//! # comment
//! [unix] exec cat hello.txt
//! stdout 'hello world'
//! ! exists missing.txt
//!
//! -- hello.txt --
//! hello world
//! ```
//!
//! Arguments are split on whitespace; `'...'` and `"..."` group words. Text
//! inside single quotes is taken literally, everything else is subject to
//! `$VAR` substitution when the instruction is dispatched.

use crate::error::ParseError;

/// A parsed script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    /// Instructions in execution order.
    pub instructions: Vec<Instruction>,
    /// Embedded files in archive order.
    pub files: Vec<ArchiveFile>,
    /// Raw text preceding the first archive separator.
    preamble: String,
}

/// One file from the archive section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveFile {
    /// Slash-separated path relative to the sandbox root.
    pub name: String,
    pub data: Vec<u8>,
    /// Line ending of the separator line, kept for re-serialization.
    eol: String,
}

/// What the script expects from an instruction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Expect {
    #[default]
    Success,
    /// `!` prefix: the command must fail.
    Failure,
    /// `?` prefix: either outcome is accepted.
    Either,
}

impl Expect {
    /// The prefix character written in the script, if any.
    pub fn prefix(self) -> Option<char> {
        match self {
            Expect::Success => None,
            Expect::Failure => Some('!'),
            Expect::Either => Some('?'),
        }
    }

    /// Whether this is the negated form.
    pub fn is_negated(self) -> bool {
        self == Expect::Failure
    }
}

/// A `[tag]` or `[!tag]` line condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    pub negated: bool,
    pub tag: String,
}

/// A single parsed directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    /// 1-based source line.
    pub line: usize,
    /// The source line without its line ending.
    pub text: String,
    pub conditions: Vec<Condition>,
    pub expect: Expect,
    pub name: String,
    pub args: Vec<Word>,
}

/// An argument before substitution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Word {
    parts: Vec<WordPart>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum WordPart {
    /// Single-quoted text, never substituted.
    Literal(String),
    /// Unquoted or double-quoted text.
    Subst(String),
}

impl Word {
    /// Build a word whose text is subject to substitution.
    pub fn new(text: impl Into<String>) -> Self {
        Word {
            parts: vec![WordPart::Subst(text.into())],
        }
    }

    /// Build a word that is never substituted.
    pub fn literal(text: impl Into<String>) -> Self {
        Word {
            parts: vec![WordPart::Literal(text.into())],
        }
    }

    /// Produce the final argument, substituting through `lookup`.
    pub fn expand<F>(&self, mut lookup: F) -> String
    where
        F: FnMut(&str) -> Option<String>,
    {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                WordPart::Literal(s) => out.push_str(s),
                WordPart::Subst(s) => out.push_str(&crate::env::expand(s, &mut lookup)),
            }
        }
        out
    }

    /// The argument text with no substitution applied.
    pub fn raw(&self) -> String {
        self.parts
            .iter()
            .map(|p| match p {
                WordPart::Literal(s) | WordPart::Subst(s) => s.as_str(),
            })
            .collect()
    }

    fn push(&mut self, c: char, literal: bool) {
        match self.parts.last_mut() {
            Some(WordPart::Literal(s)) if literal => s.push(c),
            Some(WordPart::Subst(s)) if !literal => s.push(c),
            _ => self.parts.push(if literal {
                WordPart::Literal(c.to_string())
            } else {
                WordPart::Subst(c.to_string())
            }),
        }
    }
}

impl Script {
    /// Look up an embedded file by name.
    pub fn file(&self, name: &str) -> Option<&ArchiveFile> {
        self.files.iter().find(|f| f.name == name)
    }

    /// Replace the content of an embedded file. Returns `false` if no file by
    /// that name exists.
    pub fn set_file(&mut self, name: &str, data: Vec<u8>) -> bool {
        match self.files.iter_mut().find(|f| f.name == name) {
            Some(file) => {
                file.data = data;
                true
            }
            None => false,
        }
    }

    /// Serialize the script back to source text.
    ///
    /// For a script that has not been modified this reproduces the parsed
    /// input exactly.
    pub fn to_source(&self) -> String {
        let mut out = self.preamble.clone();
        let last = self.files.len().saturating_sub(1);
        for (i, file) in self.files.iter().enumerate() {
            out.push_str("-- ");
            out.push_str(&file.name);
            out.push_str(" --");
            out.push_str(&file.eol);
            let data = String::from_utf8_lossy(&file.data);
            out.push_str(&data);
            if i != last && !data.is_empty() && !data.ends_with('\n') {
                out.push('\n');
            }
        }
        out
    }
}

/// Parse script source text.
pub fn parse(source: &str) -> Result<Script, ParseError> {
    let mut instructions = Vec::new();
    let mut files: Vec<ArchiveFile> = Vec::new();
    let mut preamble_len = 0;

    for (idx, raw) in source.split_inclusive('\n').enumerate() {
        let line_no = idx + 1;
        let (text, eol) = split_eol(raw);

        if let Some(name) = parse_separator(text, line_no)? {
            if files.iter().any(|f| f.name == name) {
                return Err(ParseError::DuplicateFile {
                    line: line_no,
                    name: name.to_string(),
                });
            }
            files.push(ArchiveFile {
                name: name.to_string(),
                data: Vec::new(),
                eol: eol.to_string(),
            });
            continue;
        }

        if let Some(file) = files.last_mut() {
            file.data.extend_from_slice(raw.as_bytes());
            continue;
        }

        preamble_len += raw.len();
        let trimmed = text.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if trimmed.starts_with("--") {
            return Err(ParseError::MalformedSeparator {
                line: line_no,
                text: text.to_string(),
            });
        }
        instructions.push(parse_instruction(text, line_no)?);
    }

    Ok(Script {
        instructions,
        files,
        preamble: source[..preamble_len].to_string(),
    })
}

fn split_eol(raw: &str) -> (&str, &str) {
    if let Some(text) = raw.strip_suffix("\r\n") {
        (text, "\r\n")
    } else if let Some(text) = raw.strip_suffix('\n') {
        (text, "\n")
    } else {
        (raw, "")
    }
}

/// Whether `text` has a line that would parse as an archive separator, so
/// it cannot be stored as an archive file's contents.
pub fn has_separator_line(text: &str) -> bool {
    text.split_inclusive('\n').enumerate().any(|(idx, raw)| {
        let (line, _) = split_eol(raw);
        !matches!(parse_separator(line, idx + 1), Ok(None))
    })
}

/// Recognize a `-- name --` line. Returns `Ok(None)` for any other line.
fn parse_separator(text: &str, line: usize) -> Result<Option<&str>, ParseError> {
    let text = text.trim_end();
    if !text.starts_with("-- ") || !text.ends_with(" --") {
        return Ok(None);
    }
    let name = if text.len() >= 6 {
        text[3..text.len() - 3].trim()
    } else {
        ""
    };
    if name.is_empty() {
        return Err(ParseError::MalformedSeparator {
            line,
            text: text.to_string(),
        });
    }
    Ok(Some(name))
}

fn parse_instruction(text: &str, line: usize) -> Result<Instruction, ParseError> {
    let mut rest = text.trim();
    let mut conditions = Vec::new();

    while let Some(after) = rest.strip_prefix('[') {
        let end = after.find(']').ok_or_else(|| ParseError::MalformedCondition {
            line,
            text: rest.to_string(),
        })?;
        let inner = after[..end].trim();
        let (negated, tag) = match inner.strip_prefix('!') {
            Some(tag) => (true, tag.trim()),
            None => (false, inner),
        };
        if tag.is_empty() || tag.contains(char::is_whitespace) {
            return Err(ParseError::MalformedCondition {
                line,
                text: format!("[{inner}]"),
            });
        }
        conditions.push(Condition {
            negated,
            tag: tag.to_string(),
        });
        rest = after[end + 1..].trim_start();
    }

    let expect = if let Some(after) = rest.strip_prefix('!') {
        rest = after.trim_start();
        Expect::Failure
    } else if let Some(after) = rest.strip_prefix('?') {
        rest = after.trim_start();
        Expect::Either
    } else {
        Expect::Success
    };

    let mut words = split_words(rest, line)?.into_iter();
    let name = words
        .next()
        .map(|w| w.raw())
        .filter(|n| !n.is_empty())
        .ok_or(ParseError::MissingCommand { line })?;

    Ok(Instruction {
        line,
        text: text.to_string(),
        conditions,
        expect,
        name,
        args: words.collect(),
    })
}

fn split_words(s: &str, line: usize) -> Result<Vec<Word>, ParseError> {
    let mut words = Vec::new();
    let mut current = Word::default();
    let mut started = false;
    let mut quote: Option<char> = None;

    for c in s.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(q) => current.push(c, q == '\''),
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    started = true;
                }
                c if c.is_whitespace() => {
                    if started {
                        words.push(std::mem::take(&mut current));
                        started = false;
                    }
                }
                c => {
                    current.push(c, false);
                    started = true;
                }
            },
        }
    }

    if let Some(quote) = quote {
        return Err(ParseError::UnterminatedQuote { line, quote });
    }
    if started {
        words.push(current);
    }
    Ok(words)
}
