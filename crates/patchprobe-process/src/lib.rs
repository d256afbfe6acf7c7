//! Helpers for the external programs patchprobe drives: the debuggee JVM,
//! the line differ and `git`.
//!
//! Every child is placed in its own process group on Unix so that killing it
//! also takes down wrapper-script grandchildren that would otherwise keep the
//! output pipes open.

use std::ffi::OsString;
use std::fmt;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

pub use tokio_util::sync::CancellationToken;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A full command invocation (cwd + program + args).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub cwd: Option<PathBuf>,
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            cwd: None,
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// `std::process::Command` with piped stdout/stderr and a fresh process
    /// group.
    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        new_process_group(&mut cmd);
        cmd
    }

    pub fn spawn(&self) -> Result<Child, RunCommandError> {
        self.to_command()
            .spawn()
            .map_err(|source| RunCommandError::Spawn {
                command: self.to_string(),
                source,
            })
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Human-readable, not a round-trippable shell snippet.
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            let arg = arg.to_string_lossy();
            if arg.contains(' ') || arg.contains('\t') || arg.is_empty() {
                write!(f, " \"{}\"", arg.replace('"', "\\\""))?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Kill the process if it hasn't exited after this duration.
    pub timeout: Option<Duration>,
    /// Maximum bytes captured per stream.
    pub max_bytes: usize,
    pub cancellation: Option<CancellationToken>,
    /// Delay between SIGTERM and SIGKILL when tearing a process tree down.
    pub kill_grace: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            max_bytes: 4 * 1024 * 1024,
            cancellation: None,
            kill_grace: Duration::from_millis(250),
        }
    }
}

/// Output of a command that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    /// Either stream produced more than `max_bytes`.
    pub truncated: bool,
}

#[derive(Debug, Error)]
pub enum RunCommandError {
    #[error("failed to run `{command}`")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("I/O error while running `{command}`")]
    Io {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("`{command}` exited with {status}{}", stderr_suffix(.stderr))]
    Failed {
        command: String,
        status: ExitStatus,
        stderr: String,
    },
    #[error("`{command}` timed out after {timeout:?}")]
    TimedOut { command: String, timeout: Duration },
    #[error("`{command}` was cancelled")]
    Cancelled { command: String },
}

fn stderr_suffix(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(": {trimmed}")
    }
}

/// Run a command with bounded capture; non-zero exit, timeout and
/// cancellation are errors.
pub fn run_checked(spec: &CommandSpec, opts: &RunOptions) -> Result<CommandOutput, RunCommandError> {
    let io_err = |source| RunCommandError::Io {
        command: spec.to_string(),
        source,
    };

    tracing::debug!(target = "patchprobe.process", command = %spec, "running command");
    let mut child = spec.spawn()?;
    let stdout = take_pipe(child.stdout.take(), "stdout").map_err(io_err)?;
    let stderr = take_pipe(child.stderr.take(), "stderr").map_err(io_err)?;

    let max_bytes = opts.max_bytes;
    let stdout_handle = thread::spawn(move || read_bounded(stdout, max_bytes));
    let stderr_handle = thread::spawn(move || read_bounded(stderr, max_bytes));

    let outcome = wait_with_deadline(&mut child, opts).map_err(io_err)?;

    let (stdout, stdout_truncated) = join_reader(stdout_handle, "stdout").map_err(io_err)?;
    let (stderr, stderr_truncated) = join_reader(stderr_handle, "stderr").map_err(io_err)?;

    let status = match outcome {
        WaitOutcome::Exited(status) => status,
        WaitOutcome::TimedOut(timeout) => {
            return Err(RunCommandError::TimedOut {
                command: spec.to_string(),
                timeout,
            })
        }
        WaitOutcome::Cancelled => {
            return Err(RunCommandError::Cancelled {
                command: spec.to_string(),
            })
        }
    };

    let stdout = String::from_utf8_lossy(&stdout).into_owned();
    let stderr = String::from_utf8_lossy(&stderr).into_owned();
    if !status.success() {
        return Err(RunCommandError::Failed {
            command: spec.to_string(),
            status,
            stderr,
        });
    }
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        truncated: stdout_truncated || stderr_truncated,
    })
}

/// Run a command and hand each stdout line to `on_line` while the command is
/// still running. Stderr is captured (bounded) for error reporting.
///
/// Returns the exit status when `accept` approves it; any other status is
/// [`RunCommandError::Failed`] carrying the captured stderr. Line-level
/// differs exit with 1 when the inputs differ, so they accept 0 and 1.
pub fn stream_lines(
    spec: &CommandSpec,
    opts: &RunOptions,
    accept: impl Fn(&ExitStatus) -> bool,
    mut on_line: impl FnMut(&str),
) -> Result<ExitStatus, RunCommandError> {
    let io_err = |source| RunCommandError::Io {
        command: spec.to_string(),
        source,
    };

    tracing::debug!(target = "patchprobe.process", command = %spec, "streaming command output");
    let mut child = spec.spawn()?;
    let stdout = take_pipe(child.stdout.take(), "stdout").map_err(io_err)?;
    let stderr = take_pipe(child.stderr.take(), "stderr").map_err(io_err)?;
    let max_bytes = opts.max_bytes;
    let stderr_handle = thread::spawn(move || read_bounded(stderr, max_bytes));

    let mut reader = BufReader::new(stdout);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => on_line(line.trim_end_matches(['\n', '\r'])),
            Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                // Non UTF-8 output; skip the line rather than aborting.
                continue;
            }
            Err(err) => {
                let _ = terminate_process_tree(&mut child, opts.kill_grace);
                return Err(io_err(err));
            }
        }
    }

    let outcome = wait_with_deadline(&mut child, opts).map_err(io_err)?;
    let (stderr, _) = join_reader(stderr_handle, "stderr").map_err(io_err)?;
    match outcome {
        WaitOutcome::Exited(status) if accept(&status) => Ok(status),
        WaitOutcome::Exited(status) => Err(RunCommandError::Failed {
            command: spec.to_string(),
            status,
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        }),
        WaitOutcome::TimedOut(timeout) => Err(RunCommandError::TimedOut {
            command: spec.to_string(),
            timeout,
        }),
        WaitOutcome::Cancelled => Err(RunCommandError::Cancelled {
            command: spec.to_string(),
        }),
    }
}

/// Forward every line of a child stream to `tracing` on a background thread
/// until the stream closes, so the child never blocks on a full pipe.
pub fn forward_lines<R>(reader: R, stream: &'static str) -> thread::JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || log_lines(BufReader::new(reader), stream))
}

/// First line of a forwarded stream: `None` when the stream closed before
/// producing one.
pub type FirstLine = io::Result<Option<String>>;

/// Like [`forward_lines`], but the stream's first line is sent to the
/// returned receiver instead of being logged.
pub fn forward_lines_after_first<R>(
    reader: R,
    stream: &'static str,
) -> (thread::JoinHandle<()>, mpsc::Receiver<FirstLine>)
where
    R: Read + Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel(1);
    let handle = thread::spawn(move || {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        let first = match reader.read_until(b'\n', &mut buf) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(String::from_utf8_lossy(&buf).trim_end().to_string())),
            Err(err) => Err(err),
        };
        // The receiver may have stopped waiting.
        let _ = tx.send(first);
        log_lines(reader, stream);
    });
    (handle, rx)
}

fn log_lines<R: Read>(mut reader: BufReader<R>, stream: &'static str) {
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                tracing::debug!(
                    target = "patchprobe.debuggee",
                    stream,
                    "{}",
                    line.trim_end()
                );
            }
        }
    }
}

/// Owns a spawned child and tears its process tree down exactly once, either
/// through [`ChildGuard::terminate`] or on drop.
#[derive(Debug)]
pub struct ChildGuard {
    child: Option<Child>,
    kill_grace: Duration,
}

impl ChildGuard {
    pub fn new(child: Child) -> Self {
        Self {
            child: Some(child),
            kill_grace: RunOptions::default().kill_grace,
        }
    }

    pub fn id(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.as_mut().and_then(|child| child.stdout.take())
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.as_mut().and_then(|child| child.stderr.take())
    }

    /// Non-blocking exit check.
    pub fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        match self.child.as_mut() {
            Some(child) => child.try_wait(),
            None => Ok(None),
        }
    }

    /// Kill (if still running) and reap the child. Later calls are no-ops and
    /// return `None`.
    pub fn terminate(&mut self) -> io::Result<Option<ExitStatus>> {
        let Some(mut child) = self.child.take() else {
            return Ok(None);
        };
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        terminate_process_tree(&mut child, self.kill_grace).map(Some)
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if let Err(err) = self.terminate() {
            tracing::warn!(target = "patchprobe.process", error = %err, "failed to reap child process");
        }
    }
}

enum WaitOutcome {
    Exited(ExitStatus),
    TimedOut(Duration),
    Cancelled,
}

fn wait_with_deadline(child: &mut Child, opts: &RunOptions) -> io::Result<WaitOutcome> {
    if opts.timeout.is_none() && opts.cancellation.is_none() {
        return child.wait().map(WaitOutcome::Exited);
    }

    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(WaitOutcome::Exited(status));
        }
        if opts
            .cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
        {
            terminate_process_tree(child, opts.kill_grace)?;
            return Ok(WaitOutcome::Cancelled);
        }
        if let Some(timeout) = opts.timeout {
            if start.elapsed() >= timeout {
                terminate_process_tree(child, opts.kill_grace)?;
                return Ok(WaitOutcome::TimedOut(timeout));
            }
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn new_process_group(cmd: &mut Command) {
    #[cfg(unix)]
    unsafe {
        use std::os::unix::process::CommandExt;

        cmd.pre_exec(|| {
            // SAFETY: `setpgid` is async-signal-safe and does not allocate.
            if libc::setpgid(0, 0) != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
    #[cfg(not(unix))]
    let _ = cmd;
}

/// SIGTERM the child's process group, then SIGKILL after `grace`.
fn terminate_process_tree(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    #[cfg(unix)]
    {
        let pid = child.id() as i32;
        // Negative pid addresses the group created in `new_process_group`.
        unsafe {
            let _ = libc::kill(-pid, libc::SIGTERM);
        }
        let start = Instant::now();
        while start.elapsed() < grace {
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
            thread::sleep(Duration::from_millis(25));
        }
        unsafe {
            let _ = libc::kill(-pid, libc::SIGKILL);
        }
        child.wait()
    }

    #[cfg(not(unix))]
    {
        let _ = grace;
        let _ = child.kill();
        child.wait()
    }
}

fn take_pipe<T>(pipe: Option<T>, name: &str) -> io::Result<T> {
    pipe.ok_or_else(|| io::Error::other(format!("child {name} was not captured")))
}

fn join_reader(
    handle: thread::JoinHandle<io::Result<(Vec<u8>, bool)>>,
    stream: &'static str,
) -> io::Result<(Vec<u8>, bool)> {
    handle
        .join()
        .map_err(|_| io::Error::other(format!("{stream} reader thread panicked")))?
}

fn read_bounded(mut reader: impl Read, max_bytes: usize) -> io::Result<(Vec<u8>, bool)> {
    let mut out = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 8 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        let keep = max_bytes.saturating_sub(out.len()).min(n);
        out.extend_from_slice(&buf[..keep]);
        truncated |= keep < n;
    }
    Ok((out, truncated))
}

/// Program path relative to `cwd` when it is not absolute and contains a
/// separator (`./scripts/diffn.sh`), otherwise unchanged so `PATH` lookup
/// still applies.
pub fn resolve_program(cwd: &Path, program: &str) -> PathBuf {
    let path = Path::new(program);
    if path.is_absolute() || !program.contains(std::path::MAIN_SEPARATOR) {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}
