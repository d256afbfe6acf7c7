use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::CollectError;
use crate::model::CollectionResults;

pub const BREAKPOINTS_FILE: &str = "breakpoints.json";
pub const METHOD_EXITS_FILE: &str = "method-exits.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPaths {
    pub breakpoints: PathBuf,
    pub method_exits: PathBuf,
}

/// Write breakpoint hits and method exits as pretty-printed JSON arrays into
/// `dir`, creating it if needed.
pub fn write_results(dir: &Path, results: &CollectionResults) -> Result<OutputPaths, CollectError> {
    fs::create_dir_all(dir).map_err(|source| CollectError::Output {
        path: dir.to_path_buf(),
        source,
    })?;
    let paths = OutputPaths {
        breakpoints: dir.join(BREAKPOINTS_FILE),
        method_exits: dir.join(METHOD_EXITS_FILE),
    };
    write_json(&paths.breakpoints, &results.breakpoint_hits)?;
    write_json(&paths.method_exits, &results.method_exits)?;
    tracing::info!(
        target = "patchprobe.collector",
        dir = %dir.display(),
        "wrote collection results"
    );
    Ok(paths)
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), CollectError> {
    let output_err = |source| CollectError::Output {
        path: path.to_path_buf(),
        source,
    };
    let file = File::create(path).map_err(output_err)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value).map_err(|err| output_err(err.into()))?;
    writer.flush().map_err(output_err)
}
