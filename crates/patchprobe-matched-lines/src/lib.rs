//! Derives instrumentation for a patch from two revisions of one Java file.
//!
//! The pipeline: check both revisions out into scratch copies
//! ([`prepare_revision`]), diff them line by line with an external differ
//! ([`run_differ`]), locate the single method or constructor the patch
//! touches in each revision ([`match_members`]) and emit a breakpoint spec per
//! revision plus an exit watch for that member ([`write_outputs`]).

pub mod diff;
pub mod error;
pub mod java;
pub mod mapper;
pub mod output;
pub mod revision;

use std::path::{Path, PathBuf};

use patchprobe_config::MatchedLinesConfig;
use patchprobe_process::RunOptions;

pub use diff::{run_differ, LineDiff};
pub use error::{MapperError, Side};
pub use java::Member;
pub use mapper::{match_files, match_members, MatchedLineSpec, MatchedLines};
pub use output::{write_outputs, MapperOutputs};
pub use revision::prepare_revision;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchRequest {
    /// Root of the git checkout.
    pub project: PathBuf,
    /// The patched file, relative to `project`.
    pub file: PathBuf,
    pub left_revision: String,
    pub right_revision: String,
    pub output_dir: PathBuf,
}

/// Diff two prepared copies and write the instrumentation into `output_dir`.
/// The differ is resolved against and run from `cwd`.
///
/// Nothing is written when the copies do not differ.
pub fn map_copies(
    config: &MatchedLinesConfig,
    cwd: &Path,
    left: &Path,
    right: &Path,
    output_dir: &Path,
) -> Result<MapperOutputs, MapperError> {
    let diff = run_differ(cwd, &config.differ, left, right, &RunOptions::default())?;
    let matched = match_files(left, right, &diff)?;
    let outputs = write_outputs(output_dir, &matched, config.format)?;
    tracing::info!(
        target = "patchprobe.matched_lines",
        class = %matched.exit_watch.class_name,
        method = %matched.exit_watch.name,
        left_lines = matched.left.lines.len(),
        right_lines = matched.right.lines.len(),
        dir = %output_dir.display(),
        "wrote matched lines"
    );
    Ok(outputs)
}

/// Prepare both revisions of the patched file and map them.
pub fn run(
    config: &MatchedLinesConfig,
    cwd: &Path,
    request: &MatchRequest,
) -> Result<MapperOutputs, MapperError> {
    let opts = RunOptions::default();
    let left = prepare_revision(
        &request.project,
        &request.left_revision,
        &request.file,
        &config.left_dir,
        &opts,
    )?;
    let right = prepare_revision(
        &request.project,
        &request.right_revision,
        &request.file,
        &config.right_dir,
        &opts,
    )?;
    map_copies(config, cwd, &left, &right, &request.output_dir)
}
