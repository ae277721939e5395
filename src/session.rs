//! Per-run session state.
//!
//! A [`Session`] owns the sandbox directory, the script's environment, its
//! working directory, background processes and the most recent command
//! output. Command handlers receive `&mut Session` and use it to read and
//! change that state.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use crate::error::CommandError;
use crate::process::BackgroundProcess;
use crate::script::{Expect, Script, Word};

/// Grace period for background processes to die after being killed at
/// teardown.
pub const DEFAULT_TEARDOWN_GRACE: Duration = Duration::from_secs(5);

/// Settings a session is created with.
#[derive(Debug, Clone)]
pub(crate) struct SessionOptions {
    /// Variables applied on top of the defaults.
    pub env: HashMap<String, String>,
    pub update: bool,
    pub deadline: Option<Instant>,
    pub wait_timeout: Duration,
    pub teardown_grace: Duration,
    pub programs: Arc<HashSet<String>>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            env: HashMap::new(),
            update: false,
            deadline: None,
            wait_timeout: Duration::ZERO,
            teardown_grace: DEFAULT_TEARDOWN_GRACE,
            programs: Arc::default(),
        }
    }
}

/// Mutable state threaded through one script run.
pub struct Session {
    work_dir: PathBuf,
    cwd: PathBuf,
    env: HashMap<String, String>,
    background: Vec<BackgroundProcess>,
    stdout: String,
    stderr: String,
    stdin: Option<Vec<u8>>,
    log: String,
    unique: u64,
    warnings: Vec<String>,
    pub(crate) script: Script,
    pub(crate) update: bool,
    pub(crate) updated: bool,
    pub(crate) deadline: Option<Instant>,
    pub(crate) wait_timeout: Duration,
    teardown_grace: Duration,
    pub(crate) programs: Arc<HashSet<String>>,
    /// Set once any instruction has executed; `skip` is only valid before.
    pub(crate) started: bool,
    /// Prefix of the instruction being dispatched.
    pub(crate) expect: Expect,
    /// Set by a command whose outcome is judged later (`exec ... &`).
    pub(crate) deferred: bool,
    // Dropped last, after background processes are gone.
    _sandbox: TempDir,
}

impl Session {
    /// Set up a session in `sandbox`, writing the script's embedded files.
    pub(crate) fn new(
        script: Script,
        sandbox: TempDir,
        options: SessionOptions,
    ) -> std::io::Result<Self> {
        let work_dir = sandbox.path().to_path_buf();

        for file in &script.files {
            let path = sandbox_path(&work_dir, &file.name)?;
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, &file.data)?;
        }

        let tmp = work_dir.join(".tmp");
        std::fs::create_dir_all(&tmp)?;

        let mut env: HashMap<String, String> = std::env::vars().collect();
        env.insert("WORK".to_string(), work_dir.display().to_string());
        env.insert("PWD".to_string(), work_dir.display().to_string());
        env.insert("HOME".to_string(), "/no-home".to_string());
        env.insert("TMPDIR".to_string(), tmp.display().to_string());
        env.insert(
            "devnull".to_string(),
            if cfg!(windows) { "NUL" } else { "/dev/null" }.to_string(),
        );
        env.extend(options.env);

        Ok(Session {
            cwd: work_dir.clone(),
            work_dir,
            env,
            background: Vec::new(),
            stdout: String::new(),
            stderr: String::new(),
            stdin: None,
            log: String::new(),
            unique: 0,
            warnings: Vec::new(),
            script,
            update: options.update,
            updated: false,
            deadline: options.deadline,
            wait_timeout: options.wait_timeout,
            teardown_grace: options.teardown_grace,
            programs: options.programs,
            started: false,
            expect: Expect::Success,
            deferred: false,
            _sandbox: sandbox,
        })
    }

    /// The sandbox root (`$WORK`).
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// The current working directory, always inside the sandbox.
    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub(crate) fn set_cwd(&mut self, dir: PathBuf) {
        self.env
            .insert("PWD".to_string(), dir.display().to_string());
        self.cwd = dir;
    }

    /// Set an environment variable for subsequent instructions.
    pub fn setenv(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.env.insert(key.into(), value.into());
    }

    /// Get an environment variable; unset variables read as empty.
    pub fn getenv(&self, key: &str) -> String {
        self.env.get(key).cloned().unwrap_or_default()
    }

    pub fn unsetenv(&mut self, key: &str) {
        self.env.remove(key);
    }

    /// The full environment passed to subprocesses.
    pub fn env(&self) -> &HashMap<String, String> {
        &self.env
    }

    /// Resolve `path` against the current working directory, removing `.`
    /// and `..` components lexically.
    pub fn mk_abs(&self, path: &str) -> PathBuf {
        clean(&self.cwd.join(path))
    }

    /// Background processes in start order.
    pub fn background_cmds(&mut self) -> &mut [BackgroundProcess] {
        &mut self.background
    }

    pub(crate) fn push_background(&mut self, process: BackgroundProcess) {
        self.background.push(process);
    }

    /// Remove background processes for `wait`: the one named `name`, or all.
    pub(crate) fn take_background(
        &mut self,
        name: Option<&str>,
    ) -> Result<Vec<BackgroundProcess>, CommandError> {
        match name {
            None => Ok(std::mem::take(&mut self.background)),
            Some(name) => {
                let idx = self
                    .background
                    .iter()
                    .position(|p| p.name() == Some(name))
                    .ok_or_else(|| {
                        CommandError::usage(format!("no background process named {name:?}"))
                    })?;
                Ok(vec![self.background.remove(idx)])
            }
        }
    }

    /// Stdout of the most recent `exec` or `wait`.
    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    /// Stderr of the most recent `exec` or `wait`.
    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    pub(crate) fn set_output(&mut self, stdout: String, stderr: String) {
        self.stdout = stdout;
        self.stderr = stderr;
    }

    pub(crate) fn take_stdin(&mut self) -> Option<Vec<u8>> {
        self.stdin.take()
    }

    pub(crate) fn set_stdin(&mut self, data: Vec<u8>) {
        self.stdin = Some(data);
    }

    /// Append a line to the run log.
    pub fn log(&mut self, msg: impl AsRef<str>) {
        let msg = msg.as_ref();
        self.log.push_str(msg);
        if !msg.ends_with('\n') {
            self.log.push('\n');
        }
    }

    /// Append captured output to the log under a `[stdout]`-style header.
    pub(crate) fn log_output(&mut self, stdout: &str, stderr: &str) {
        for (label, text) in [("stdout", stdout), ("stderr", stderr)] {
            if !text.is_empty() {
                let _ = writeln!(self.log, "[{label}]");
                self.log(text);
            }
        }
    }

    /// The run log so far.
    pub fn log_text(&self) -> &str {
        &self.log
    }

    /// Build the error for a failed check. A `!` instruction turns it into
    /// success.
    pub fn fail(&self, msg: impl Into<String>) -> CommandError {
        CommandError::Failed(msg.into())
    }

    /// Read a file relative to the cwd, or the last output for the names
    /// `stdout` and `stderr`.
    pub fn read_file(&self, name: &str) -> Result<String, CommandError> {
        match name {
            "stdout" => Ok(self.stdout.clone()),
            "stderr" => Ok(self.stderr.clone()),
            _ => std::fs::read(self.mk_abs(name))
                .map(|data| String::from_utf8_lossy(&data).into_owned())
                .map_err(|e| CommandError::failed(format!("cannot read {name}: {e}"))),
        }
    }

    /// The archive entry backing `name`, if the sandbox file at `name` still
    /// holds exactly the archived content.
    pub(crate) fn golden_name(&self, name: &str) -> Option<String> {
        let path = self.mk_abs(name);
        let rel = path.strip_prefix(&self.work_dir).ok()?;
        let rel = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let file = self.script.file(&rel)?;
        let on_disk = std::fs::read(&path).ok()?;
        (on_disk == file.data).then_some(rel)
    }

    /// Substitute variables and reserved names in an argument.
    pub fn expand(&mut self, word: &Word) -> String {
        word.expand(|name| self.lookup(name))
    }

    fn lookup(&mut self, name: &str) -> Option<String> {
        match name {
            "/" => Some(std::path::MAIN_SEPARATOR.to_string()),
            ":" => Some(if cfg!(windows) { ";" } else { ":" }.to_string()),
            "$" => Some("$".to_string()),
            "@cwd" => Some(self.cwd.display().to_string()),
            "@unique" => {
                self.unique += 1;
                Some(format!("u{}", self.unique))
            }
            _ => self.env.get(name).cloned(),
        }
    }

    /// Warnings recorded so far (processes that would not die).
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Kill any remaining background processes.
    pub(crate) fn teardown(&mut self) {
        for mut process in std::mem::take(&mut self.background) {
            if let Err(e) = process.terminate(self.teardown_grace) {
                tracing::warn!(pid = process.id(), "{e}");
                self.warnings.push(e.to_string());
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// Join an archive name onto the sandbox root, rejecting names that would
/// escape it.
fn sandbox_path(root: &Path, name: &str) -> std::io::Result<PathBuf> {
    let rel = Path::new(name);
    let escapes = rel
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("archive file {name:?} is outside the sandbox"),
        ));
    }
    Ok(root.join(rel))
}
