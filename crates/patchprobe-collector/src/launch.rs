//! Starting the test JVM under the JDWP agent and attaching to it.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use patchprobe_config::LaunchConfig;
use patchprobe_jdwp::{CancellationToken, TcpJdwpClient, TcpJdwpClientConfig};
use patchprobe_process::{
    forward_lines, forward_lines_after_first, ChildGuard, CommandSpec, FirstLine,
};
use regex::Regex;

use crate::error::LaunchError;
use crate::session::DebugSession;

/// Agent options: listen on an ephemeral port and hold the VM until a
/// debugger attaches.
pub const JDWP_AGENT: &str = "-agentlib:jdwp=transport=dt_socket,server=y,suspend=y";

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// What to run in the debuggee.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchRequest {
    /// Compiled classes and dependencies of the project under test.
    pub classpath: Vec<PathBuf>,
    /// Test selectors handed to the runner (`pkg.FooTest::testBar`).
    pub tests: Vec<String>,
}

/// Absolute, de-duplicated, `:`-joined classpath. Entries that do not exist
/// are dropped with a warning.
pub fn assemble_classpath<'a>(entries: impl IntoIterator<Item = &'a Path>) -> String {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for entry in entries {
        if !entry.exists() {
            tracing::warn!(
                target = "patchprobe.collector",
                entry = %entry.display(),
                "classpath entry does not exist; skipping"
            );
            continue;
        }
        let absolute = std::path::absolute(entry).unwrap_or_else(|_| entry.to_path_buf());
        let rendered = absolute.display().to_string();
        if seen.insert(rendered.clone()) {
            out.push(rendered);
        }
    }
    out.join(":")
}

/// The port in the agent's announcement line: the first run of four or more
/// digits.
pub fn parse_port(line: &str) -> Option<u16> {
    static PORT: OnceLock<Regex> = OnceLock::new();
    let re = PORT.get_or_init(|| Regex::new(r"([0-9]{4,})").expect("valid port regex"));
    re.find(line)?.as_str().parse().ok()
}

pub fn launch_command(config: &LaunchConfig, request: &LaunchRequest) -> CommandSpec {
    let classpath = assemble_classpath(
        request
            .classpath
            .iter()
            .chain(config.runner_classpath.iter())
            .map(PathBuf::as_path),
    );
    CommandSpec::new(&config.java)
        .args(config.jvm_args.iter())
        .arg(JDWP_AGENT)
        .arg("-cp")
        .arg(classpath)
        .arg(&config.runner_class)
        .arg(request.tests.join(" "))
}

/// Spawn the test JVM, read its JDWP port from the first stdout line and
/// attach. The remaining stdout and all of stderr are forwarded to `tracing`.
/// The JVM is torn down if `cancel` fires or the port is not announced
/// within the configured startup timeout.
pub fn launch(
    config: &LaunchConfig,
    request: &LaunchRequest,
    cancel: &CancellationToken,
) -> Result<DebugSession<TcpJdwpClient>, LaunchError> {
    let spec = launch_command(config, request);
    tracing::info!(target = "patchprobe.collector", command = %spec, "launching test JVM");

    let mut child = ChildGuard::new(spec.spawn().map_err(LaunchError::Spawn)?);
    let stdout = child.take_stdout().ok_or(LaunchError::NoOutput)?;
    let (stdout_forwarder, first_line) = forward_lines_after_first(stdout, "stdout");
    let mut forwarders = vec![stdout_forwarder];
    if let Some(stderr) = child.take_stderr() {
        forwarders.push(forward_lines(stderr, "stderr"));
    }

    let first = wait_for_first_line(&first_line, config.startup_timeout(), cancel)?;
    tracing::debug!(target = "patchprobe.debuggee", stream = "stdout", "{first}");
    let port = parse_port(&first).ok_or(LaunchError::NoPort { line: first })?;

    let client_config = TcpJdwpClientConfig {
        connect_timeout: config.connect_timeout(),
        ..TcpJdwpClientConfig::default()
    };
    let client = TcpJdwpClient::connect("127.0.0.1", port, client_config)
        .map_err(|source| LaunchError::Attach { port, source })?;
    tracing::info!(target = "patchprobe.collector", port, "attached to test JVM");

    Ok(DebugSession::with_child(client, child, forwarders))
}

fn wait_for_first_line(
    first_line: &Receiver<FirstLine>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<String, LaunchError> {
    let deadline = Instant::now() + timeout;
    loop {
        if cancel.is_cancelled() {
            return Err(LaunchError::Cancelled);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(LaunchError::StartupTimedOut { timeout });
        }
        match first_line.recv_timeout(remaining.min(POLL_INTERVAL)) {
            Ok(Ok(Some(line))) => return Ok(line),
            Ok(Ok(None)) | Err(RecvTimeoutError::Disconnected) => return Err(LaunchError::NoOutput),
            Ok(Err(err)) => return Err(LaunchError::ReadOutput(err)),
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
}
