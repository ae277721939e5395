//! Script execution engine.
//!
//! Runs scripts in isolated sandboxes and reports a [`ScriptResult`] per
//! script. [`RunParams`] collects everything a run needs; scripts in a
//! directory run in parallel unless `serial` is set.

use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::commands::{Command, Registry};
use crate::condition::Conditions;
use crate::error::{CommandError, Error, LoadError};
use crate::loader;
use crate::schema::SuiteConfig;
use crate::script::{Expect, Instruction};
use crate::session::{DEFAULT_TEARDOWN_GRACE, Session, SessionOptions};

/// Default time `wait` blocks on a background process.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Hook run against each session before its first instruction.
pub type SetupHook = dyn Fn(&mut Session) -> Result<(), CommandError> + Send + Sync;

/// How a script run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Passed,
    Failed,
    Skipped,
}

/// Where and why a script failed.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Failure {
    /// Script line of the failing instruction, if the failure belongs to one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    pub message: String,
}

/// Result of running a single script.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ScriptResult {
    pub name: String,
    pub path: PathBuf,
    pub outcome: Outcome,
    #[serde(serialize_with = "serialize_duration")]
    pub duration: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
    /// Reason given to `skip`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    /// Whether golden files in the script were rewritten.
    pub updated: bool,
    /// Background processes that would not die at teardown.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// Executed instructions and their output.
    pub log: String,
}

impl ScriptResult {
    fn new(name: String, path: &Path) -> Self {
        ScriptResult {
            name,
            path: path.to_path_buf(),
            outcome: Outcome::Passed,
            duration: Duration::ZERO,
            failure: None,
            skip_reason: None,
            updated: false,
            warnings: Vec::new(),
            log: String::new(),
        }
    }

    fn fail(&mut self, line: Option<usize>, message: impl Into<String>) {
        self.outcome = Outcome::Failed;
        self.failure = Some(Failure {
            line,
            message: message.into(),
        });
    }

    /// Passed or skipped.
    pub fn passed(&self) -> bool {
        self.outcome != Outcome::Failed
    }
}

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Parameters for running a directory (or single file) of scripts.
#[derive(Clone)]
pub struct RunParams {
    dir: PathBuf,
    commands: Vec<(String, Arc<dyn Command>)>,
    conditions: Conditions,
    programs: HashSet<String>,
    workdir_root: Option<PathBuf>,
    update: bool,
    timeout: Option<Duration>,
    wait_timeout: Duration,
    teardown_grace: Duration,
    env: HashMap<String, String>,
    setup: Option<Arc<SetupHook>>,
    serial: bool,
    filter: Option<String>,
}

impl std::fmt::Debug for RunParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let commands: Vec<_> = self.commands.iter().map(|(name, _)| name).collect();
        f.debug_struct("RunParams")
            .field("dir", &self.dir)
            .field("commands", &commands)
            .field("conditions", &self.conditions)
            .field("programs", &self.programs)
            .field("workdir_root", &self.workdir_root)
            .field("update", &self.update)
            .field("timeout", &self.timeout)
            .field("wait_timeout", &self.wait_timeout)
            .field("teardown_grace", &self.teardown_grace)
            .field("serial", &self.serial)
            .field("filter", &self.filter)
            .finish_non_exhaustive()
    }
}

impl RunParams {
    /// Parameters for the scripts under `dir` (a directory or one file).
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        RunParams {
            dir: dir.into(),
            commands: Vec::new(),
            conditions: Conditions::new(),
            programs: HashSet::new(),
            workdir_root: None,
            update: false,
            timeout: None,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            teardown_grace: DEFAULT_TEARDOWN_GRACE,
            env: HashMap::new(),
            setup: None,
            serial: false,
            filter: None,
        }
    }

    /// Register a custom command implemented by a closure.
    pub fn command<F>(self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&mut Session, bool, &[String]) -> Result<(), CommandError> + Send + Sync + 'static,
    {
        self.register(name, handler)
    }

    /// Register a custom command.
    pub fn register(mut self, name: impl Into<String>, command: impl Command + 'static) -> Self {
        self.commands.push((name.into(), Arc::new(command)));
        self
    }

    /// Define a `[tag]` condition.
    pub fn condition(mut self, tag: impl Into<String>, value: bool) -> Self {
        self.conditions.set(tag, value);
        self
    }

    /// Run `exec NAME` as the current executable re-exec'd into `NAME`.
    pub fn program(mut self, name: impl Into<String>) -> Self {
        self.programs.insert(name.into());
        self
    }

    /// Create sandboxes under `root` instead of the system temp directory.
    pub fn workdir_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workdir_root = Some(root.into());
        self
    }

    /// Rewrite golden files in scripts instead of failing on mismatch.
    pub fn update_scripts(mut self, update: bool) -> Self {
        self.update = update;
        self
    }

    /// Per-script time limit.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// How long `wait` blocks on a background process.
    pub fn wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    /// How long a killed background process may take to exit at teardown
    /// before a warning is recorded.
    pub fn teardown_grace(mut self, grace: Duration) -> Self {
        self.teardown_grace = grace;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Adjust each session before its first instruction.
    pub fn setup<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut Session) -> Result<(), CommandError> + Send + Sync + 'static,
    {
        self.setup = Some(Arc::new(hook));
        self
    }

    pub fn serial(mut self, serial: bool) -> Self {
        self.serial = serial;
        self
    }

    /// Only run scripts whose name contains `pattern`.
    pub fn filter(mut self, pattern: impl Into<String>) -> Self {
        self.filter = Some(pattern.into());
        self
    }

    /// Apply a suite configuration file. Values already set on `self` for
    /// `env` and conditions win over the file.
    pub fn with_config(mut self, config: &SuiteConfig) -> Self {
        if let Some(secs) = config.timeout {
            self.timeout = Some(Duration::from_secs(secs));
        }
        if let Some(secs) = config.wait_timeout {
            self.wait_timeout = Duration::from_secs(secs);
        }
        for (key, value) in &config.env {
            self.env.entry(key.clone()).or_insert_with(|| value.clone());
        }
        for (tag, value) in &config.conditions {
            if !self.conditions.contains(tag) {
                self.conditions.set(tag.clone(), *value);
            }
        }
        if let Some(root) = &config.workdir_root {
            self.workdir_root = Some(root.resolve(&self.root()));
        }
        self.serial |= config.serial;
        self.update |= config.update;
        self
    }

    /// The directory holding the scripts (the parent for a single file).
    pub fn root(&self) -> PathBuf {
        if self.dir.is_file() {
            self.dir
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."))
        } else {
            self.dir.clone()
        }
    }

    /// Run every script, failing if any script failed.
    pub fn execute(&self) -> Result<(), Error> {
        let results = self.run_scripts()?;
        let failed = results.iter().filter(|r| !r.passed()).count();
        if failed > 0 {
            return Err(Error::ScriptsFailed {
                failed,
                total: results.len(),
            });
        }
        Ok(())
    }

    /// Run every script and return the per-script results in path order.
    ///
    /// Fails before running anything if the command registry cannot be built
    /// or the scripts cannot be listed.
    pub fn run_scripts(&self) -> Result<Vec<ScriptResult>, Error> {
        let engine = Engine::new(self)?;
        let root = self.root();
        let paths = loader::find_scripts(&self.dir).map_err(|source| LoadError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let scripts: Vec<(String, PathBuf)> = paths
            .into_iter()
            .map(|p| (loader::script_name(&root, &p), p))
            .filter(|(name, _)| self.filter.as_deref().is_none_or(|f| name.contains(f)))
            .collect();

        tracing::debug!(count = scripts.len(), dir = %self.dir.display(), "running scripts");

        let results = if self.serial {
            scripts
                .iter()
                .map(|(name, path)| {
                    panic::catch_unwind(AssertUnwindSafe(|| engine.run(name.clone(), path)))
                        .unwrap_or_else(|_| panicked(name, path))
                })
                .collect()
        } else {
            thread::scope(|s| {
                let handles: Vec<_> = scripts
                    .iter()
                    .map(|(name, path)| {
                        let engine = &engine;
                        s.spawn(move || engine.run(name.clone(), path))
                    })
                    .collect();

                handles
                    .into_iter()
                    .zip(&scripts)
                    .map(|(h, (name, path))| h.join().unwrap_or_else(|_| panicked(name, path)))
                    .collect()
            })
        };
        Ok(results)
    }

    /// Run one script file with these parameters.
    pub fn run_script(&self, path: &Path) -> Result<ScriptResult, Error> {
        let engine = Engine::new(self)?;
        let name = loader::script_name(&self.root(), path);
        Ok(engine.run(name, path))
    }
}

fn panicked(name: &str, path: &Path) -> ScriptResult {
    let mut result = ScriptResult::new(name.to_string(), path);
    result.fail(None, "script thread panicked");
    result
}

/// Terminal state of a run that did not fail.
enum Halt {
    Completed,
    Skipped(String),
}

#[derive(Debug, Clone, Copy)]
enum State {
    Setup,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// Shared, read-only state for one run configuration.
struct Engine<'a> {
    params: &'a RunParams,
    registry: Registry,
    programs: Arc<HashSet<String>>,
}

impl<'a> Engine<'a> {
    fn new(params: &'a RunParams) -> Result<Self, Error> {
        let registry = Registry::with_custom(params.commands.iter().cloned())?;
        Ok(Engine {
            params,
            registry,
            programs: Arc::new(params.programs.clone()),
        })
    }

    fn sandbox(&self) -> std::io::Result<tempfile::TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("scriptest-");
        match &self.params.workdir_root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        }
    }

    fn run(&self, name: String, path: &Path) -> ScriptResult {
        let start = Instant::now();
        let mut result = ScriptResult::new(name, path);
        let state = self.run_inner(path, start, &mut result);
        result.duration = start.elapsed();

        tracing::info!(
            script = %result.name,
            state = ?state,
            duration = ?result.duration,
            "script finished"
        );
        result
    }

    fn run_inner(&self, path: &Path, start: Instant, result: &mut ScriptResult) -> State {
        tracing::debug!(script = %result.name, state = ?State::Setup, "setting up");

        let script = match loader::load_script(path) {
            Ok(script) => script,
            Err(e) => {
                let line = match &e {
                    LoadError::Parse { source, .. } => Some(source.line()),
                    _ => None,
                };
                result.fail(line, e.to_string());
                return State::Failed;
            }
        };

        let sandbox = match self.sandbox() {
            Ok(dir) => dir,
            Err(e) => {
                result.fail(None, Error::Sandbox(e).to_string());
                return State::Failed;
            }
        };
        let options = SessionOptions {
            env: self.params.env.clone(),
            update: self.params.update,
            deadline: self.params.timeout.map(|t| start + t),
            wait_timeout: self.params.wait_timeout,
            teardown_grace: self.params.teardown_grace,
            programs: Arc::clone(&self.programs),
        };
        let mut session = match Session::new(script, sandbox, options) {
            Ok(session) => session,
            Err(e) => {
                result.fail(None, Error::Sandbox(e).to_string());
                return State::Failed;
            }
        };

        let state = match self.setup_and_execute(&mut session) {
            Ok(Halt::Completed) => {
                if session.updated {
                    match std::fs::write(path, session.script.to_source()) {
                        Ok(()) => {
                            result.updated = true;
                            tracing::info!(script = %result.name, "rewrote golden files");
                        }
                        Err(e) => result.fail(None, format!("failed to update script: {e}")),
                    }
                }
                if result.passed() {
                    State::Completed
                } else {
                    State::Failed
                }
            }
            Ok(Halt::Skipped(reason)) => {
                result.outcome = Outcome::Skipped;
                result.skip_reason = Some(reason);
                State::Skipped
            }
            Err((line, e)) => {
                result.fail(line, e.to_string());
                State::Failed
            }
        };

        session.teardown();
        result.warnings = session.warnings().to_vec();
        result.log = session.log_text().to_string();
        state
    }

    fn setup_and_execute(&self, ts: &mut Session) -> Result<Halt, (Option<usize>, Error)> {
        if let Some(hook) = &self.params.setup {
            hook(ts).map_err(|e| (None, Error::Command(e)))?;
        }

        tracing::debug!(state = ?State::Running, "running");
        let instructions = ts.script.instructions.clone();
        for inst in &instructions {
            match self.step(ts, inst) {
                Ok(None) => {}
                Ok(Some(halt)) => return Ok(halt),
                Err(e) => return Err((Some(inst.line), e)),
            }
        }
        Ok(Halt::Completed)
    }

    /// Execute one instruction. `Some` ends the run early.
    fn step(&self, ts: &mut Session, inst: &Instruction) -> Result<Option<Halt>, Error> {
        if let Some(deadline) = ts.deadline
            && Instant::now() >= deadline
        {
            return Err(Error::Timeout(self.params.timeout.unwrap_or_default()));
        }

        let path = ts.env().get("PATH").cloned();
        if !self.params.conditions.all(&inst.conditions, path.as_deref())? {
            return Ok(None);
        }

        ts.log(format!("> {}", inst.text.trim()));
        tracing::debug!(line = inst.line, "{}", inst.text.trim());

        let cmd = self
            .registry
            .get(&inst.name)
            .ok_or_else(|| Error::UnknownCommand {
                name: inst.name.clone(),
            })?;
        if let Some(prefix) = inst.expect.prefix()
            && !cmd.negatable()
        {
            return Err(Error::NegationUnsupported {
                command: inst.name.clone(),
                prefix,
            });
        }

        let args: Vec<String> = inst.args.iter().map(|w| ts.expand(w)).collect();
        let first = !ts.started;
        ts.started = true;
        ts.expect = inst.expect;
        ts.deferred = false;

        let outcome = cmd.run(ts, inst.expect.is_negated(), &args);
        if ts.deferred {
            // Judged by `wait`.
            return outcome.map(|()| None).map_err(Error::from);
        }

        match (outcome, inst.expect) {
            (Ok(()), Expect::Failure) => Err(CommandError::failed("unexpected command success").into()),
            (Ok(()), _) => Ok(None),
            (Err(CommandError::Failed(msg)), Expect::Failure | Expect::Either) => {
                ts.log(format!("[failure expected] {msg}"));
                Ok(None)
            }
            (Err(CommandError::Stop(msg)), _) => {
                if !msg.is_empty() {
                    ts.log(format!("stop: {msg}"));
                }
                Ok(Some(Halt::Completed))
            }
            (Err(CommandError::Skip(msg)), _) if first => {
                ts.log(format!("skip: {msg}"));
                Ok(Some(Halt::Skipped(msg)))
            }
            (Err(CommandError::Skip(_)), _) => Err(CommandError::usage(
                "skip is only allowed before any other instruction",
            )
            .into()),
            (Err(e), _) => Err(e.into()),
        }
    }
}
