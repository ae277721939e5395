//! Error types for script parsing, loading and execution.

use std::path::PathBuf;
use std::time::Duration;

use crate::process::ProcessError;

/// A malformed script. Always fatal to that script.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("line {line}: unterminated {quote} quote")]
    UnterminatedQuote { line: usize, quote: char },

    #[error("line {line}: malformed archive separator {text:?}")]
    MalformedSeparator { line: usize, text: String },

    #[error("line {line}: duplicate file {name:?} in archive")]
    DuplicateFile { line: usize, name: String },

    #[error("line {line}: missing command")]
    MissingCommand { line: usize },

    #[error("line {line}: malformed condition {text:?}")]
    MalformedCondition { line: usize, text: String },
}

impl ParseError {
    /// Returns the 1-based line the error was found on.
    pub fn line(&self) -> usize {
        match self {
            ParseError::UnterminatedQuote { line, .. }
            | ParseError::MalformedSeparator { line, .. }
            | ParseError::DuplicateFile { line, .. }
            | ParseError::MissingCommand { line }
            | ParseError::MalformedCondition { line, .. } => *line,
        }
    }
}

/// Error loading scripts or suite configuration from disk.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{}: {source}", path.display())]
    Parse { path: PathBuf, source: ParseError },
}

/// Outcome of a command handler that did not succeed.
///
/// Only [`CommandError::Failed`] takes part in negation: a `!` instruction
/// turns it into success. Every other variant aborts the run regardless.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// The command ran and its check did not hold.
    #[error("{0}")]
    Failed(String),

    /// Misuse of the command (bad arguments, unsupported flags).
    #[error("{0}")]
    Usage(String),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("{0}")]
    Io(#[from] std::io::Error),

    /// Halt the run successfully, skipping the remaining instructions.
    #[error("stop: {0}")]
    Stop(String),

    /// Halt the run and report the script as skipped.
    #[error("skip: {0}")]
    Skip(String),
}

impl CommandError {
    pub fn usage(msg: impl Into<String>) -> Self {
        CommandError::Usage(msg.into())
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        CommandError::Failed(msg.into())
    }
}

/// Errors reported for a script run or for run configuration.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("unknown command {name:?}")]
    UnknownCommand { name: String },

    #[error("unknown condition {name:?}")]
    UnknownCondition { name: String },

    #[error("command {name:?} is registered more than once")]
    CommandCollision { name: String },

    #[error("{command} does not support {prefix:?}")]
    NegationUnsupported { command: String, prefix: char },

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("script timed out after {0:.2?}")]
    Timeout(Duration),

    #[error("failed to create sandbox: {0}")]
    Sandbox(std::io::Error),

    #[error("{failed} of {total} script(s) failed")]
    ScriptsFailed { failed: usize, total: usize },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
