use std::fs;
use std::path::{Path, PathBuf};

use patchprobe_collector::spec::{write_breakpoints, write_exit_watch};
use patchprobe_config::SpecFormat;

use crate::error::MapperError;
use crate::mapper::MatchedLines;

pub const LEFT_FILE: &str = "input-left.txt";
pub const RIGHT_FILE: &str = "input-right.txt";
pub const METHODS_FILE: &str = "methods.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapperOutputs {
    pub left: PathBuf,
    pub right: PathBuf,
    pub methods: PathBuf,
}

/// Write both breakpoint specs and the exit watch into `dir`.
pub fn write_outputs(
    dir: &Path,
    matched: &MatchedLines,
    format: SpecFormat,
) -> Result<MapperOutputs, MapperError> {
    fs::create_dir_all(dir).map_err(|source| MapperError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let outputs = MapperOutputs {
        left: dir.join(LEFT_FILE),
        right: dir.join(RIGHT_FILE),
        methods: dir.join(METHODS_FILE),
    };
    write_breakpoints(&outputs.left, &matched.left.to_breakpoints(), format)?;
    write_breakpoints(&outputs.right, &matched.right.to_breakpoints(), format)?;
    write_exit_watch(&outputs.methods, &matched.exit_watch)?;
    Ok(outputs)
}
