use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use patchprobe_process::{run_checked, CommandSpec, RunOptions};

use crate::error::MapperError;

/// Check out `revision` in `project` and copy `file` (relative to the
/// project) into `<project>/<scratch>/<file name>`, returning the copy.
///
/// The checkout changes the project's working tree; callers prepare the
/// left revision first and the right one last.
pub fn prepare_revision(
    project: &Path,
    revision: &str,
    file: &Path,
    scratch: &str,
    opts: &RunOptions,
) -> Result<PathBuf, MapperError> {
    let checkout = CommandSpec::new("git")
        .current_dir(project)
        .args(["checkout", revision]);
    run_checked(&checkout, opts)?;

    let file_name = file.file_name().ok_or_else(|| MapperError::Io {
        path: file.to_path_buf(),
        source: io::Error::new(io::ErrorKind::InvalidInput, "not a file path"),
    })?;
    let dir = project.join(scratch);
    fs::create_dir_all(&dir).map_err(|source| MapperError::Io {
        path: dir.clone(),
        source,
    })?;

    let source_path = project.join(file);
    let target = dir.join(file_name);
    fs::copy(&source_path, &target).map_err(|source| MapperError::Io {
        path: source_path.clone(),
        source,
    })?;
    tracing::debug!(
        target = "patchprobe.matched_lines",
        revision,
        copy = %target.display(),
        "prepared revision"
    );
    Ok(target)
}
