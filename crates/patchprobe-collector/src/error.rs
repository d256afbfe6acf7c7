use std::io;
use std::path::PathBuf;
use std::time::Duration;

use patchprobe_jdwp::JdwpError;
use patchprobe_process::RunCommandError;
use thiserror::Error;

/// Failures before the first debug event: the debuggee could not be started
/// or attached to.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to start the test JVM")]
    Spawn(#[source] RunCommandError),
    #[error("the test JVM closed stdout before announcing its JDWP port")]
    NoOutput,
    #[error("failed to read the JDWP announcement from the test JVM")]
    ReadOutput(#[source] io::Error),
    #[error("the test JVM did not announce its JDWP port within {timeout:?}")]
    StartupTimedOut { timeout: Duration },
    #[error("cancelled while waiting for the test JVM to start")]
    Cancelled,
    #[error("no JDWP port in the test JVM's first output line: {line:?}")]
    NoPort { line: String },
    #[error("failed to attach to the test JVM on port {port}")]
    Attach {
        port: u16,
        #[source]
        source: JdwpError,
    },
}

#[derive(Debug, Error)]
pub enum SpecError {
    #[error("failed to read {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{path}:{line_number}: expected `qualified.Type=line,line,...`, found {line:?}")]
    InvalidLine {
        path: PathBuf,
        line_number: usize,
        line: String,
    },
    #[error("{path}:{line_number}: invalid line number {value:?}")]
    InvalidLineNumber {
        path: PathBuf,
        line_number: usize,
        value: String,
    },
    #[error("{path} is not valid instrumentation JSON")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum CollectError {
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error(transparent)]
    Spec(#[from] SpecError),
    #[error("JDWP request failed")]
    Jdwp(#[from] JdwpError),
    /// The innermost frame of a breakpoint hit has no variable table; the
    /// instrumented classes were compiled without `-g`.
    #[error("{type_name}.{method} was compiled without debug information (compile with -g)")]
    MissingDebugInfo { type_name: String, method: String },
    #[error("failed to write {path}")]
    Output {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl CollectError {
    /// The debuggee went away while an event was being processed.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Jdwp(err) if err.is_disconnect())
    }
}
