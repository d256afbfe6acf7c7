//! Configuration for patchprobe.
//!
//! A single TOML file configures both pipelines:
//!
//! ```toml
//! [collector]
//! stack_trace_depth = 3
//! execution_depth = 1
//!
//! [launch]
//! java = "/usr/lib/jvm/java-17/bin/java"
//!
//! [logging]
//! level = "patchprobe.collector=debug,info"
//! ```
//!
//! Every key is optional; missing keys take the defaults below.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, Once};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Environment variable consulted when no `--config` flag is given.
pub const CONFIG_ENV_VAR: &str = "PATCHPROBE_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PatchprobeConfig {
    pub collector: CollectorConfig,
    pub launch: LaunchConfig,
    pub matched_lines: MatchedLinesConfig,
    pub logging: LoggingConfig,
}

/// Bounds on how much runtime state one event captures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CollectorConfig {
    /// Stack frames captured per breakpoint hit (clamped to the real depth).
    pub stack_trace_depth: usize,
    /// Levels of object/array expansion below each captured value.
    pub execution_depth: usize,
    /// Maximum array elements rendered or expanded per array.
    pub array_elements: usize,
    /// Capture only local variables, not the fields of the frame's type.
    pub skip_fields: bool,
    /// Call-stack entries whose declaring type contains any of these
    /// fragments are dropped from recorded stack traces.
    pub stack_trace_exclusions: Vec<String>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            stack_trace_depth: 1,
            execution_depth: 0,
            array_elements: 10,
            skip_fields: false,
            stack_trace_exclusions: [
                "java.lang",
                "java.util",
                "org.junit",
                "junit",
                "jdk",
                "se.kth.debug",
            ]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

/// How the debuggee JVM is started and attached to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LaunchConfig {
    /// `java` executable; resolved through `PATH` when not absolute.
    pub java: PathBuf,
    /// Main class that runs the selected tests and prints nothing on stdout
    /// before the JDWP agent's listening line.
    pub runner_class: String,
    /// Entries appended to the user classpath (typically the jar holding
    /// the runner class).
    pub runner_classpath: Vec<PathBuf>,
    /// Extra JVM options placed before `-cp`.
    pub jvm_args: Vec<String>,
    /// Seconds allowed for connecting to the JDWP port.
    pub connect_timeout_secs: u64,
    /// Seconds to wait for the JVM to announce its JDWP port.
    pub startup_timeout_secs: u64,
}

impl LaunchConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs.max(1))
    }
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            java: PathBuf::from("java"),
            runner_class: "se.kth.debug.JUnitTestRunner".to_string(),
            runner_classpath: Vec::new(),
            jvm_args: Vec::new(),
            connect_timeout_secs: 10,
            startup_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpecFormat {
    #[default]
    Json,
    Text,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MatchedLinesConfig {
    /// Line differ, resolved against and run from the working directory as
    /// `<differ> --no-index <left> <right>`.
    pub differ: String,
    /// Format of the emitted breakpoint files.
    pub format: SpecFormat,
    /// Scratch directories (relative to the project) holding each revision.
    pub left_dir: String,
    pub right_dir: String,
}

impl Default for MatchedLinesConfig {
    fn default() -> Self {
        Self {
            differ: "./scripts/diffn.sh".to_string(),
            format: SpecFormat::Json,
            left_dir: "gumtree-left".to_string(),
            right_dir: "gumtree-right".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// A simple level (`info`, `debug`, ...) or an `EnvFilter` directive string.
    pub level: String,
    /// Emit logs as JSON lines.
    pub json: bool,
    /// Also append logs to this file.
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: None,
        }
    }
}

impl LoggingConfig {
    fn normalize_level_directives(input: &str) -> String {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return "info".to_string();
        }
        match trimmed.to_ascii_lowercase().as_str() {
            "trace" | "debug" | "info" | "error" => trimmed.to_ascii_lowercase(),
            "warn" | "warning" => "warn".to_string(),
            // Anything else is an `EnvFilter` directive string.
            _ => trimmed.to_string(),
        }
    }

    fn config_env_filter(&self) -> tracing_subscriber::EnvFilter {
        tracing_subscriber::EnvFilter::try_new(Self::normalize_level_directives(&self.level))
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    }

    /// Effective filter: the configured level, with `RUST_LOG` merged on top
    /// when set.
    pub fn env_filter(&self) -> tracing_subscriber::EnvFilter {
        let env_directives = std::env::var("RUST_LOG")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        match env_directives {
            Some(env_directives) => {
                let combined = format!(
                    "{},{env_directives}",
                    Self::normalize_level_directives(&self.level)
                );
                tracing_subscriber::EnvFilter::try_new(combined)
                    .or_else(|_| tracing_subscriber::EnvFilter::try_new(&env_directives))
                    .unwrap_or_else(|_| self.config_env_filter())
            }
            None => self.config_env_filter(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {message}")]
    Toml { path: String, message: String },
}

impl PatchprobeConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text).map_err(|err| ConfigError::Toml {
            path: path.display().to_string(),
            message: err.message().to_string(),
        })
    }

    /// `--config` path, else `$PATCHPROBE_CONFIG`, else defaults.
    ///
    /// An explicitly named file that cannot be loaded is an error.
    pub fn load(cli_path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = cli_path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV_VAR).map(PathBuf::from));
        match path {
            Some(path) => Self::load_from_path(path),
            None => Ok(Self::default()),
        }
    }
}

static TRACING_INIT: Once = Once::new();

/// Install the global `tracing` subscriber: fmt output on stderr (plain or
/// JSON), optionally mirrored to `logging.file`.
///
/// Safe to call more than once; only the first call has an effect. A log file
/// that cannot be opened disables file output only.
pub fn init_tracing(logging: &LoggingConfig) {
    TRACING_INIT.call_once(|| {
        let filter = logging.env_filter();

        let file = logging.file.as_ref().and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });
        let file_failed = logging.file.is_some() && file.is_none();

        let mut make_writer = BoxMakeWriter::new(std::io::stderr);
        if let Some(file) = file {
            make_writer = BoxMakeWriter::new(make_writer.and(Mutex::new(file)));
        }

        let registry = tracing_subscriber::registry().with(filter);
        let result = if logging.json {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(make_writer)
                        .with_ansi(false),
                )
                .try_init()
        } else {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(make_writer)
                        .with_target(true),
                )
                .try_init()
        };
        if result.is_err() {
            // Another subscriber was installed first (tests, embedding).
            return;
        }
        if file_failed {
            tracing::warn!(
                target = "patchprobe.config",
                path = ?logging.file,
                "could not open log file; logging to stderr only"
            );
        }
    });
}
