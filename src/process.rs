//! Subprocess management.
//!
//! Foreground processes block the script until they exit. Background
//! processes keep running alongside the script; their output is drained by
//! reader threads into shared buffers until they are waited on or torn down.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::str::FromStr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::script::Expect;

/// Interval between exit checks while waiting on a child.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long to wait for reader threads after the child has exited. A
/// grandchild that inherited the pipes can keep them open indefinitely.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Errors from spawning and controlling subprocesses.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("{program} timed out after {after:.2?}")]
    Timeout { program: String, after: Duration },

    #[error("{program} has already exited")]
    Exited { program: String },

    #[error("signal {signal} is not supported on this platform")]
    NotSupported { signal: Signal },

    #[error("failed to send {signal} to {program}: {message}")]
    Signal {
        program: String,
        signal: Signal,
        message: String,
    },

    #[error("{program} did not exit within {grace:.2?} of being killed")]
    StillRunning { program: String, grace: Duration },

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// A signal that can be delivered to a background process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Terminate,
    Kill,
    Quit,
    Hangup,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Signal::Interrupt => "SIGINT",
            Signal::Terminate => "SIGTERM",
            Signal::Kill => "SIGKILL",
            Signal::Quit => "SIGQUIT",
            Signal::Hangup => "SIGHUP",
        };
        f.write_str(name)
    }
}

impl FromStr for Signal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_ascii_uppercase();
        match upper.strip_prefix("SIG").unwrap_or(&upper) {
            "INT" | "2" => Ok(Signal::Interrupt),
            "TERM" | "15" => Ok(Signal::Terminate),
            "KILL" | "9" => Ok(Signal::Kill),
            "QUIT" | "3" => Ok(Signal::Quit),
            "HUP" | "1" => Ok(Signal::Hangup),
            _ => Err(format!("unknown signal {s:?}")),
        }
    }
}

#[cfg(unix)]
impl From<Signal> for nix::sys::signal::Signal {
    fn from(sig: Signal) -> Self {
        use nix::sys::signal::Signal as Nix;
        match sig {
            Signal::Interrupt => Nix::SIGINT,
            Signal::Terminate => Nix::SIGTERM,
            Signal::Kill => Nix::SIGKILL,
            Signal::Quit => Nix::SIGQUIT,
            Signal::Hangup => Nix::SIGHUP,
        }
    }
}

/// Everything needed to start a process.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub argv: Vec<String>,
    /// Complete environment; the parent's environment is not inherited.
    pub env: HashMap<String, String>,
    pub cwd: PathBuf,
    pub stdin: Option<Vec<u8>>,
}

impl ProcessSpec {
    fn program(&self) -> String {
        self.argv.first().cloned().unwrap_or_default()
    }
}

/// Captured result of a finished process.
#[derive(Debug, Clone, Default)]
pub struct Output {
    /// Exit code if the process exited normally.
    pub exit_code: Option<i32>,
    /// Signal number if the process was terminated by a signal (Unix only).
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl Output {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Human-readable exit status, e.g. `exit status 1`.
    pub fn describe_status(&self) -> String {
        match (self.exit_code, self.signal) {
            (Some(code), _) => format!("exit status {code}"),
            (None, Some(sig)) => format!("terminated by signal {sig}"),
            (None, None) => "unknown exit status".to_string(),
        }
    }

    fn from_parts(status: ExitStatus, stdout: Vec<u8>, stderr: Vec<u8>) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Output {
            exit_code: status.code(),
            signal,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        }
    }
}

/// An output stream drained into a shared buffer by a reader thread.
struct Capture {
    buf: Arc<Mutex<Vec<u8>>>,
    reader: Option<JoinHandle<()>>,
}

impl Capture {
    fn start<R: Read + Send + 'static>(stream: Option<R>) -> Self {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let reader = stream.map(|mut stream| {
            let buf = Arc::clone(&buf);
            thread::spawn(move || {
                let mut chunk = [0u8; 8192];
                loop {
                    match stream.read(&mut chunk) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => buf.lock().extend_from_slice(&chunk[..n]),
                    }
                }
            })
        });
        Capture { buf, reader }
    }

    fn snapshot(&self) -> Vec<u8> {
        self.buf.lock().clone()
    }

    /// Wait for the reader to hit end of stream, giving up after `grace`.
    fn drain(&mut self, grace: Duration) -> Vec<u8> {
        if let Some(reader) = self.reader.take() {
            let start = Instant::now();
            while !reader.is_finished() && start.elapsed() < grace {
                thread::sleep(POLL_INTERVAL);
            }
            if reader.is_finished() {
                let _ = reader.join();
            } else {
                tracing::debug!("output reader still open after {grace:?}; detaching");
            }
        }
        self.snapshot()
    }
}

struct Spawned {
    child: Child,
    stdout: Capture,
    stderr: Capture,
}

fn spawn(spec: &ProcessSpec) -> Result<Spawned, ProcessError> {
    let program = spec.program();
    let mut cmd = Command::new(&program);
    cmd.args(spec.argv.iter().skip(1));
    cmd.current_dir(&spec.cwd);
    cmd.env_clear();
    cmd.envs(&spec.env);
    cmd.stdin(if spec.stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|source| ProcessError::Spawn { program, source })?;

    if let Some(data) = spec.stdin.clone()
        && let Some(mut stdin) = child.stdin.take()
    {
        // Written from a thread so a child that does not read its input
        // cannot block us on a full pipe.
        thread::spawn(move || {
            let _ = stdin.write_all(&data);
        });
    }

    let stdout = Capture::start(child.stdout.take());
    let stderr = Capture::start(child.stderr.take());
    Ok(Spawned {
        child,
        stdout,
        stderr,
    })
}

/// Run a process to completion, capturing its output.
///
/// If `deadline` passes before the process exits it is killed and a timeout
/// is reported.
pub fn run_foreground(spec: &ProcessSpec, deadline: Option<Instant>) -> Result<Output, ProcessError> {
    let start = Instant::now();
    let mut spawned = spawn(spec)?;

    let status = match deadline {
        None => spawned.child.wait()?,
        Some(deadline) => loop {
            if let Some(status) = spawned.child.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                let _ = spawned.child.kill();
                let _ = spawned.child.wait();
                return Err(ProcessError::Timeout {
                    program: spec.program(),
                    after: start.elapsed(),
                });
            }
            thread::sleep(POLL_INTERVAL);
        },
    };

    let stdout = spawned.stdout.drain(DRAIN_GRACE);
    let stderr = spawned.stderr.drain(DRAIN_GRACE);
    Ok(Output::from_parts(status, stdout, stderr))
}

/// Start a process without waiting for it.
pub fn run_background(
    spec: &ProcessSpec,
    name: Option<String>,
    expect: Expect,
) -> Result<BackgroundProcess, ProcessError> {
    let spawned = spawn(spec)?;
    tracing::debug!(pid = spawned.child.id(), argv = ?spec.argv, "started background process");
    Ok(BackgroundProcess {
        name,
        argv: spec.argv.clone(),
        expect,
        child: spawned.child,
        stdout: spawned.stdout,
        stderr: spawned.stderr,
        output: None,
    })
}

/// A live (or finished but not yet collected) background process.
pub struct BackgroundProcess {
    name: Option<String>,
    argv: Vec<String>,
    expect: Expect,
    child: Child,
    stdout: Capture,
    stderr: Capture,
    output: Option<Output>,
}

impl fmt::Debug for BackgroundProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundProcess")
            .field("name", &self.name)
            .field("argv", &self.argv)
            .field("pid", &self.child.id())
            .field("finished", &self.output.is_some())
            .finish()
    }
}

impl BackgroundProcess {
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// The expectation the process was started with (`!exec ... &`).
    pub fn expect(&self) -> Expect {
        self.expect
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    fn program(&self) -> String {
        self.argv.first().cloned().unwrap_or_default()
    }

    /// Whether the process is still running.
    pub fn is_running(&mut self) -> Result<bool, ProcessError> {
        if self.output.is_some() {
            return Ok(false);
        }
        Ok(self.child.try_wait()?.is_none())
    }

    /// Output written to stdout so far.
    pub fn stdout_so_far(&self) -> String {
        String::from_utf8_lossy(&self.stdout.snapshot()).into_owned()
    }

    /// Output written to stderr so far.
    pub fn stderr_so_far(&self) -> String {
        String::from_utf8_lossy(&self.stderr.snapshot()).into_owned()
    }

    /// Wait for the process to exit.
    ///
    /// On timeout the process is left running; callers that want it gone
    /// must signal it.
    pub fn wait(&mut self, timeout: Duration) -> Result<Output, ProcessError> {
        if let Some(output) = &self.output {
            return Ok(output.clone());
        }
        let start = Instant::now();
        let status = loop {
            if let Some(status) = self.child.try_wait()? {
                break status;
            }
            if start.elapsed() >= timeout {
                return Err(ProcessError::Timeout {
                    program: self.program(),
                    after: start.elapsed(),
                });
            }
            thread::sleep(POLL_INTERVAL);
        };
        let output = Output::from_parts(
            status,
            self.stdout.drain(DRAIN_GRACE),
            self.stderr.drain(DRAIN_GRACE),
        );
        self.output = Some(output.clone());
        Ok(output)
    }

    /// Deliver a signal. Fails if the process has already exited.
    pub fn signal(&mut self, signal: Signal) -> Result<(), ProcessError> {
        if !self.is_running()? {
            return Err(ProcessError::Exited {
                program: self.program(),
            });
        }
        self.send(signal)
    }

    #[cfg(unix)]
    fn send(&mut self, signal: Signal) -> Result<(), ProcessError> {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let pid = Pid::from_raw(self.child.id() as i32);
        kill(pid, nix::sys::signal::Signal::from(signal)).map_err(|errno| {
            ProcessError::Signal {
                program: self.program(),
                signal,
                message: errno.desc().to_string(),
            }
        })
    }

    #[cfg(not(unix))]
    fn send(&mut self, signal: Signal) -> Result<(), ProcessError> {
        match signal {
            Signal::Kill => Ok(self.child.kill()?),
            other => Err(ProcessError::NotSupported { signal: other }),
        }
    }

    /// Kill the process if it is still running and wait up to `grace` for it
    /// to exit.
    pub fn terminate(&mut self, grace: Duration) -> Result<(), ProcessError> {
        if !self.is_running()? {
            return Ok(());
        }
        let _ = self.child.kill();
        let deadline = Instant::now() + grace;
        loop {
            // A zero grace never observes the exit.
            if Instant::now() >= deadline {
                return Err(ProcessError::StillRunning {
                    program: self.program(),
                    grace,
                });
            }
            if self.child.try_wait()?.is_some() {
                return Ok(());
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}
