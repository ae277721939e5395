//! Text comparison and golden-file updates.

use std::borrow::Cow;

use similar::TextDiff;

use crate::script::Script;

/// A single comparison between observed and expected text.
#[derive(Debug, Clone)]
pub struct Comparison<'a> {
    /// Label for the actual side in the diff header (`stdout`, a file name).
    pub actual_name: &'a str,
    pub actual: &'a str,
    pub expected_name: &'a str,
    pub expected: &'a str,
    /// Archive entry the expected text came from. Only these can be
    /// rewritten in update mode.
    pub golden: Option<&'a str>,
}

/// Successful comparison outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compared {
    Matched,
    /// The texts differed and the archive entry was rewritten.
    Updated,
}

/// A failed comparison, carrying a unified diff.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{actual_name} and {expected_name} differ\n{diff}")]
pub struct Mismatch {
    pub actual_name: String,
    pub expected_name: String,
    pub diff: String,
}

/// Add a trailing newline to non-empty text that lacks one.
pub fn normalize(text: &str) -> Cow<'_, str> {
    if text.is_empty() || text.ends_with('\n') {
        Cow::Borrowed(text)
    } else {
        Cow::Owned(format!("{text}\n"))
    }
}

/// Render a unified diff from `expected` to `actual`.
pub fn unified_diff(expected_name: &str, expected: &str, actual_name: &str, actual: &str) -> String {
    TextDiff::from_lines(expected, actual)
        .unified_diff()
        .context_radius(3)
        .header(expected_name, actual_name)
        .to_string()
}

/// Compare the texts in `cmp`.
///
/// With `update` set and an archive-backed expectation, a mismatch rewrites
/// the archive entry in `script` with the actual text instead of failing.
pub fn compare(cmp: &Comparison<'_>, script: &mut Script, update: bool) -> Result<Compared, Mismatch> {
    let actual = normalize(cmp.actual);
    let expected = normalize(cmp.expected);
    if actual == expected {
        return Ok(Compared::Matched);
    }

    if update
        && let Some(name) = cmp.golden
        && script.set_file(name, cmp.actual.as_bytes().to_vec())
    {
        tracing::info!(file = name, "updated golden file");
        return Ok(Compared::Updated);
    }

    Err(Mismatch {
        actual_name: cmp.actual_name.to_string(),
        expected_name: cmp.expected_name.to_string(),
        diff: unified_diff(cmp.expected_name, &expected, cmp.actual_name, &actual),
    })
}
