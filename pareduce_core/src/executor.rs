use crate::cancel::CancelToken;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const TERMINATION_GRACE: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("interrupted while running `{0}`")]
    Interrupted(String),
    #[error("I/O error while running `{program}`: {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// An external tool invocation: program, arguments and optional working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub working_dir: Option<PathBuf>,
}

impl ToolCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn program_name(&self) -> String {
        self.program.display().to_string()
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}

impl ProcessOutput {
    pub fn describe(&self) -> String {
        match (self.exit_code, self.signal) {
            (Some(code), _) => format!("Exited with code {code}"),
            (None, Some(signal)) => format!("Terminated by signal {signal}"),
            (None, None) => "Exited abnormally".to_string(),
        }
    }

    /// Last `max_bytes` of stdout followed by stderr, lossily decoded.
    pub fn output_tail(&self, max_bytes: usize) -> String {
        let mut combined = self.stdout.clone();
        combined.extend_from_slice(&self.stderr);
        let start = combined.len().saturating_sub(max_bytes);
        String::from_utf8_lossy(&combined[start..]).into_owned()
    }
}

/// How a tool run ended. Only spawn failures and interrupts are errors; a
/// non-zero exit and a timeout are ordinary outcomes for the caller to classify.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOutcome {
    Completed(ProcessOutput),
    Failed(ProcessOutput),
    TimedOut,
}

/// Runs external tools under a wall-clock timeout and a soft address-space cap.
///
/// Every child is placed in its own process group so that a timeout or an
/// interrupt also reaches the helpers a tool forks (compiler drivers,
/// minimizers re-invoking this program).
#[derive(Debug, Clone)]
pub struct ResourceLimitedExecutor {
    memory_limit: Option<u64>,
    cancel: CancelToken,
}

impl ResourceLimitedExecutor {
    pub fn new(memory_limit: Option<u64>, cancel: CancelToken) -> Self {
        Self {
            memory_limit,
            cancel,
        }
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Runs `tool` to completion, or kills it once `timeout` elapses.
    /// `None` means no wall-clock bound.
    pub fn run(
        &self,
        tool: &ToolCommand,
        timeout: Option<Duration>,
    ) -> Result<ToolOutcome, ExecError> {
        if self.cancel.is_cancelled() {
            return Err(ExecError::Interrupted(tool.program_name()));
        }
        debug!("Running {tool}");

        let mut cmd = Command::new(&tool.program);
        cmd.args(&tool.args);
        if let Some(cwd) = &tool.working_dir {
            cmd.current_dir(cwd);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        apply_limits(&mut cmd, self.memory_limit);

        let mut child = cmd.spawn().map_err(|source| ExecError::Spawn {
            program: tool.program_name(),
            source,
        })?;

        let stdout_reader = child.stdout.take().map(spawn_reader);
        let stderr_reader = child.stderr.take().map(spawn_reader);

        let waited = self.wait_with_timeout(&mut child, timeout);
        let stdout = join_reader(stdout_reader);
        let stderr = join_reader(stderr_reader);

        match waited {
            Ok(WaitResult::Exited(status)) => {
                let output = ProcessOutput {
                    stdout,
                    stderr,
                    exit_code: status.code(),
                    signal: exit_signal(&status),
                };
                if status.success() {
                    Ok(ToolOutcome::Completed(output))
                } else {
                    debug!("`{}` failed: {}", tool.program_name(), output.describe());
                    Ok(ToolOutcome::Failed(output))
                }
            }
            Ok(WaitResult::TimedOut) => Ok(ToolOutcome::TimedOut),
            Ok(WaitResult::Cancelled) => Err(ExecError::Interrupted(tool.program_name())),
            Err(source) => Err(ExecError::Io {
                program: tool.program_name(),
                source,
            }),
        }
    }

    fn wait_with_timeout(
        &self,
        child: &mut Child,
        timeout: Option<Duration>,
    ) -> io::Result<WaitResult> {
        let start_time = Instant::now();
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(WaitResult::Exited(status));
            }
            if self.cancel.is_cancelled() {
                terminate(child);
                return Ok(WaitResult::Cancelled);
            }
            if timeout.is_some_and(|t| start_time.elapsed() > t) {
                warn!("Process {} timed out, killing", child.id());
                terminate(child);
                return Ok(WaitResult::TimedOut);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

enum WaitResult {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn join_reader(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

/// SIGTERM to the whole group, then SIGKILL once the grace period is over.
fn terminate(child: &mut Child) {
    signal_group(child, false);
    let start = Instant::now();
    while start.elapsed() < TERMINATION_GRACE {
        match child.try_wait() {
            Ok(Some(_)) => {
                // The leader is gone; make sure stragglers in its group follow.
                signal_group(child, true);
                return;
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(_) => break,
        }
    }
    signal_group(child, true);
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(unix)]
fn apply_limits(cmd: &mut Command, memory_limit: Option<u64>) {
    use std::os::unix::process::CommandExt;

    cmd.process_group(0);
    if let Some(limit) = memory_limit {
        // SAFETY: the closure only issues getrlimit/setrlimit syscalls, which
        // are async-signal-safe, between fork and exec.
        unsafe {
            cmd.pre_exec(move || limit_virtual_memory(limit));
        }
    }
}

#[cfg(not(unix))]
fn apply_limits(_cmd: &mut Command, _memory_limit: Option<u64>) {}

/// Lowers only the soft limit so that it can be raised again later; the hard
/// limit is left as inherited.
#[cfg(unix)]
fn limit_virtual_memory(limit: u64) -> io::Result<()> {
    use nix::sys::resource::{Resource, getrlimit, setrlimit};

    let (_, hard) = getrlimit(Resource::RLIMIT_AS)?;
    setrlimit(Resource::RLIMIT_AS, limit.min(hard), hard)?;
    Ok(())
}

#[cfg(unix)]
fn signal_group(child: &Child, force: bool) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let signal = if force {
        Signal::SIGKILL
    } else {
        Signal::SIGTERM
    };
    let _ = killpg(Pid::from_raw(child.id() as i32), signal);
}

#[cfg(not(unix))]
fn signal_group(_child: &Child, _force: bool) {}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

/// Writes an executable `/bin/sh` script; used by tests and by the
/// source-level reducer's interestingness wrapper.
#[cfg(unix)]
pub(crate) fn write_script(path: &Path, body: &str) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::write(path, format!("#!/bin/sh\n{body}\n"))?;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
pub(crate) fn write_script(path: &Path, body: &str) -> io::Result<()> {
    std::fs::write(path, body)
}
