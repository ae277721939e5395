//! Line condition evaluation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::Error;
use crate::script::Condition;

const KNOWN_OS: &[&str] = &[
    "android",
    "dragonfly",
    "freebsd",
    "illumos",
    "ios",
    "linux",
    "macos",
    "netbsd",
    "openbsd",
    "solaris",
    "windows",
];

const KNOWN_ARCH: &[&str] = &[
    "aarch64",
    "arm",
    "loongarch64",
    "powerpc64",
    "riscv64",
    "s390x",
    "wasm32",
    "x86",
    "x86_64",
];

/// The set of tags a script may test with `[tag]`.
#[derive(Debug, Clone, Default)]
pub struct Conditions {
    custom: HashMap<String, bool>,
}

impl Conditions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a caller-defined tag.
    pub fn set(&mut self, tag: impl Into<String>, value: bool) {
        self.custom.insert(tag.into(), value);
    }

    /// Whether `tag` was registered with [`Conditions::set`].
    pub fn contains(&self, tag: &str) -> bool {
        self.custom.contains_key(tag)
    }

    /// Evaluate a single condition. `path` is the session's `PATH` used for
    /// `exec:NAME` tags.
    pub fn evaluate(&self, cond: &Condition, path: Option<&str>) -> Result<bool, Error> {
        let value = self.lookup(&cond.tag, path)?;
        Ok(value != cond.negated)
    }

    /// Evaluate every condition on a line; all must hold.
    pub fn all(&self, conds: &[Condition], path: Option<&str>) -> Result<bool, Error> {
        for cond in conds {
            if !self.evaluate(cond, path)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn lookup(&self, tag: &str, path: Option<&str>) -> Result<bool, Error> {
        if let Some(value) = self.custom.get(tag) {
            return Ok(*value);
        }
        if let Some(program) = tag.strip_prefix("exec:") {
            return Ok(find_executable(program, path).is_some());
        }
        match tag {
            "unix" => Ok(cfg!(unix)),
            "windows" => Ok(cfg!(windows)),
            _ if KNOWN_OS.contains(&tag) => Ok(tag == std::env::consts::OS),
            _ if KNOWN_ARCH.contains(&tag) => Ok(tag == std::env::consts::ARCH),
            _ => Err(Error::UnknownCondition {
                name: tag.to_string(),
            }),
        }
    }
}

/// Search `path` (a `PATH`-style list) for an executable called `name`.
pub fn find_executable(name: &str, path: Option<&str>) -> Option<PathBuf> {
    if name.contains(std::path::MAIN_SEPARATOR) || name.contains('/') {
        let candidate = PathBuf::from(name);
        return is_executable(&candidate).then_some(candidate);
    }
    let path = path?;
    std::env::split_paths(path).find_map(|dir| {
        let candidate = dir.join(name);
        if is_executable(&candidate) {
            return Some(candidate);
        }
        if cfg!(windows) {
            let exe = dir.join(format!("{name}.exe"));
            if is_executable(&exe) {
                return Some(exe);
            }
        }
        None
    })
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cond(tag: &str, negated: bool) -> Condition {
        Condition {
            negated,
            tag: tag.to_string(),
        }
    }

    #[test]
    fn platform_tags() {
        let conds = Conditions::new();
        let os = std::env::consts::OS;
        assert!(conds.evaluate(&cond(os, false), None).unwrap());
        assert!(!conds.evaluate(&cond(os, true), None).unwrap());
        assert_eq!(conds.evaluate(&cond("unix", false), None).unwrap(), cfg!(unix));
        assert_eq!(
            conds.evaluate(&cond("windows", false), None).unwrap(),
            cfg!(windows)
        );
        let arch = std::env::consts::ARCH;
        assert!(conds.evaluate(&cond(arch, false), None).unwrap());
    }

    #[test]
    fn other_os_is_false_not_unknown() {
        let conds = Conditions::new();
        let other = if std::env::consts::OS == "linux" {
            "windows"
        } else {
            "linux"
        };
        assert!(!conds.evaluate(&cond(other, false), None).unwrap());
    }

    #[test]
    fn custom_tags() {
        let mut conds = Conditions::new();
        conds.set("short", true);
        conds.set("net", false);
        assert!(conds.all(&[cond("short", false), cond("net", true)], None).unwrap());
        assert!(!conds.all(&[cond("short", false), cond("net", false)], None).unwrap());
    }

    #[test]
    fn unknown_tag_is_error() {
        let conds = Conditions::new();
        let err = conds.evaluate(&cond("no-such-tag", false), None).unwrap_err();
        assert!(matches!(err, Error::UnknownCondition { ref name } if name == "no-such-tag"));
    }

    #[test]
    #[cfg(unix)]
    fn exec_tag_searches_path() {
        let conds = Conditions::new();
        let path = std::env::var("PATH").ok();
        assert!(conds.evaluate(&cond("exec:sh", false), path.as_deref()).unwrap());
        assert!(
            !conds
                .evaluate(&cond("exec:definitely-not-a-program-12345", false), path.as_deref())
                .unwrap()
        );
        assert!(!conds.evaluate(&cond("exec:sh", false), None).unwrap());
    }
}
