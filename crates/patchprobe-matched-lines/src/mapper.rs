use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use patchprobe_collector::{BreakpointMap, MethodWatch};

use crate::diff::LineDiff;
use crate::error::{MapperError, Side};
use crate::java::{self, Member};

/// Unchanged statement lines of the patched member in one revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedLineSpec {
    /// Binary name of the type declaring the member.
    pub type_name: String,
    pub lines: BTreeSet<u32>,
}

impl MatchedLineSpec {
    pub fn to_breakpoints(&self) -> BreakpointMap {
        BreakpointMap::from([(self.type_name.clone(), self.lines.clone())])
    }
}

/// Instrumentation derived from one patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedLines {
    pub left: MatchedLineSpec,
    pub right: MatchedLineSpec,
    pub exit_watch: MethodWatch,
}

/// The member enclosing the side's changed lines, if any.
pub fn changed_member<'a>(
    members: &'a [Member],
    changed: &BTreeSet<u32>,
    side: Side,
) -> Result<Option<&'a Member>, MapperError> {
    let enclosing: Vec<&Member> = members
        .iter()
        .filter(|member| changed.iter().any(|&line| member.encloses(line)))
        .collect();
    match enclosing.as_slice() {
        [] => Ok(None),
        [member] => Ok(Some(*member)),
        many => Err(MapperError::AmbiguousPatchLocation {
            side,
            members: many
                .iter()
                .map(|member| format!("{}.{}", member.type_name, member.signature))
                .collect(),
        }),
    }
}

fn starting_at(members: &[Member], line: u32) -> Result<&Member, MapperError> {
    members
        .iter()
        .find(|member| member.start_line == line)
        .ok_or(MapperError::NoEnclosingMember)
}

/// Pair the patched member across revisions and derive the breakpoint lines
/// and exit watch for it.
pub fn match_members(
    left_members: &[Member],
    right_members: &[Member],
    diff: &LineDiff,
) -> Result<MatchedLines, MapperError> {
    let left = changed_member(left_members, &diff.left, Side::Left)?;
    let right = changed_member(right_members, &diff.right, Side::Right)?;
    let (left, right) = match (left, right) {
        (Some(left), Some(right)) => (left, right),
        // A pure insertion or deletion only shows up on one side.
        (Some(left), None) => (left, starting_at(right_members, left.start_line)?),
        (None, Some(right)) => (starting_at(left_members, right.start_line)?, right),
        (None, None) => return Err(MapperError::NoEnclosingMember),
    };

    if left.signature != right.signature {
        return Err(MapperError::SignatureChanged {
            left: left.signature.clone(),
            right: right.signature.clone(),
        });
    }
    tracing::info!(
        target = "patchprobe.matched_lines",
        class = %left.type_name,
        member = %left.signature,
        "patch located"
    );

    let matched = |member: &Member, side: Side| MatchedLineSpec {
        type_name: member.type_name.clone(),
        lines: member
            .statement_lines
            .difference(diff.side(side))
            .copied()
            .collect(),
    };
    Ok(MatchedLines {
        left: matched(left, Side::Left),
        right: matched(right, Side::Right),
        exit_watch: MethodWatch {
            name: left.name.clone(),
            class_name: left.type_name.clone(),
        },
    })
}

/// Parse both revisions from disk and match them.
pub fn match_files(left: &Path, right: &Path, diff: &LineDiff) -> Result<MatchedLines, MapperError> {
    let left_members = read_members(left)?;
    let right_members = read_members(right)?;
    match_members(&left_members, &right_members, diff)
}

fn read_members(path: &Path) -> Result<Vec<Member>, MapperError> {
    let source = fs::read_to_string(path).map_err(|source| MapperError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    java::members(&source).map_err(|message| MapperError::Parse {
        path: path.to_path_buf(),
        message,
    })
}
