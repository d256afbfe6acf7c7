//! Line-level diff between the two revisions, delegated to an external
//! differ that prints `Left:<n>` and `Right:<n>` for every changed line.

use std::collections::BTreeSet;
use std::path::Path;
use std::process::ExitStatus;

use patchprobe_process::{resolve_program, stream_lines, CommandSpec, RunOptions};

use crate::error::{MapperError, Side};

/// Changed line numbers of each revision.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineDiff {
    pub left: BTreeSet<u32>,
    pub right: BTreeSet<u32>,
}

impl LineDiff {
    pub fn is_empty(&self) -> bool {
        self.left.is_empty() && self.right.is_empty()
    }

    pub fn side(&self, side: Side) -> &BTreeSet<u32> {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }

    /// Record one line of differ output. Anything that is not a
    /// `Left:<n>` / `Right:<n>` marker is ignored.
    pub fn record(&mut self, line: &str) {
        let Some((prefix, value)) = line.trim().split_once(':') else {
            return;
        };
        let set = match prefix {
            "Left" => &mut self.left,
            "Right" => &mut self.right,
            _ => return,
        };
        match value.trim().parse::<u32>() {
            Ok(number) => {
                set.insert(number);
            }
            Err(_) => {
                tracing::debug!(target = "patchprobe.matched_lines", line, "ignoring malformed differ line");
            }
        }
    }

    pub fn parse(output: &str) -> Self {
        let mut diff = Self::default();
        for line in output.lines() {
            diff.record(line);
        }
        diff
    }
}

/// Run `<differ> --no-index <left> <right>` from `cwd`, consuming its output
/// while it runs. Exit codes 0 and 1 (inputs differ) are accepted; anything
/// else, including death by signal, fails with the differ's stderr.
pub fn run_differ(
    cwd: &Path,
    differ: &str,
    left: &Path,
    right: &Path,
    opts: &RunOptions,
) -> Result<LineDiff, MapperError> {
    let spec = CommandSpec::new(resolve_program(cwd, differ))
        .current_dir(cwd)
        .arg("--no-index")
        .arg(left.as_os_str())
        .arg(right.as_os_str());

    let mut diff = LineDiff::default();
    let status = stream_lines(&spec, opts, differ_succeeded, |line| diff.record(line))?;
    tracing::debug!(
        target = "patchprobe.matched_lines",
        %status,
        left = diff.left.len(),
        right = diff.right.len(),
        "differ finished"
    );

    if diff.is_empty() {
        return Err(MapperError::NoDiff);
    }
    Ok(diff)
}

fn differ_succeeded(status: &ExitStatus) -> bool {
    matches!(status.code(), Some(0 | 1))
}
