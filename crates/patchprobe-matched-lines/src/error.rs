use std::fmt;
use std::io;
use std::path::PathBuf;

use patchprobe_collector::SpecError;
use patchprobe_process::RunCommandError;
use thiserror::Error;

/// Which revision of the patched file a result refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Left,
    Right,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Side::Left => "left",
            Side::Right => "right",
        })
    }
}

#[derive(Debug, Error)]
pub enum MapperError {
    #[error("the two revisions have no differing lines")]
    NoDiff,
    #[error("changes on the {side} side span more than one method: {members:?}")]
    AmbiguousPatchLocation { side: Side, members: Vec<String> },
    #[error("the patch changes the signature of `{left}` to `{right}`")]
    SignatureChanged { left: String, right: String },
    #[error("no method or constructor encloses the changed lines")]
    NoEnclosingMember,
    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("failed to access {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Command(#[from] RunCommandError),
    #[error(transparent)]
    Spec(#[from] SpecError),
}
