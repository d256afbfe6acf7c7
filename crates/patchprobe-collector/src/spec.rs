//! Instrumentation spec: which lines to break at and which method's exits to
//! record.
//!
//! Breakpoints come in two interchangeable encodings:
//!
//! ```text
//! com.example.Foo=10,12,31
//! com.example.Foo$Inner=7
//! ```
//!
//! ```json
//! [{"fileName": "com.example.Foo", "breakpoints": [10, 12, 31]}]
//! ```
//!
//! The exit watch is a single JSON object `{"name": .., "className": ..}`.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use patchprobe_config::SpecFormat;
use serde::{Deserialize, Serialize};

use crate::error::SpecError;

/// Qualified (binary) type name to breakpoint lines.
pub type BreakpointMap = BTreeMap<String, BTreeSet<u32>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BreakpointEntry {
    file_name: String,
    breakpoints: Vec<u32>,
}

/// A method whose every exit is recorded. Overloads are not distinguished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodWatch {
    pub name: String,
    pub class_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstrumentationSpec {
    /// `None` when no breakpoint file was supplied; breakpoint events are then
    /// not recorded at all.
    pub breakpoints: Option<BreakpointMap>,
    pub exit_watch: Option<MethodWatch>,
}

impl InstrumentationSpec {
    pub fn load(
        breakpoints: Option<&Path>,
        exit_watch: Option<&Path>,
    ) -> Result<Self, SpecError> {
        Ok(Self {
            breakpoints: breakpoints.map(read_breakpoints).transpose()?,
            exit_watch: exit_watch.map(read_exit_watch).transpose()?,
        })
    }

    /// Types that need a class-prepare request.
    pub fn watched_types(&self) -> BTreeSet<String> {
        let mut types: BTreeSet<String> = self
            .breakpoints
            .iter()
            .flat_map(|map| map.keys().cloned())
            .collect();
        if let Some(watch) = &self.exit_watch {
            types.insert(watch.class_name.clone());
        }
        types
    }

    pub fn lines_for(&self, type_name: &str) -> Option<&BTreeSet<u32>> {
        self.breakpoints.as_ref()?.get(type_name)
    }

    /// Whether a method exit at `line` of `method` (declared by `type_name`)
    /// should be recorded: the line is instrumented for that type (a type
    /// listed with no lines accepts every exit), or the method is the
    /// watched one.
    pub fn method_exit_qualifies(&self, type_name: &str, method: &str, line: Option<u32>) -> bool {
        let within_breakpoints = match self.lines_for(type_name) {
            Some(lines) if lines.is_empty() => true,
            Some(lines) => line.is_some_and(|line| lines.contains(&line)),
            None => false,
        };
        within_breakpoints
            || self
                .exit_watch
                .as_ref()
                .is_some_and(|watch| watch.name == method && watch.class_name == type_name)
    }
}

pub fn read_breakpoints(path: &Path) -> Result<BreakpointMap, SpecError> {
    let text = fs::read_to_string(path).map_err(|source| SpecError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_breakpoints(&text, path)
}

/// Parse either encoding; a leading `[` selects JSON.
pub fn parse_breakpoints(text: &str, path: &Path) -> Result<BreakpointMap, SpecError> {
    if text.trim_start().starts_with('[') {
        let entries: Vec<BreakpointEntry> =
            serde_json::from_str(text).map_err(|source| SpecError::Json {
                path: path.to_path_buf(),
                source,
            })?;
        let mut map = BreakpointMap::new();
        for entry in entries {
            map.entry(entry.file_name)
                .or_default()
                .extend(entry.breakpoints);
        }
        return Ok(map);
    }

    let mut map = BreakpointMap::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        let Some((type_name, lines)) = line.split_once('=') else {
            return Err(SpecError::InvalidLine {
                path: path.to_path_buf(),
                line_number: idx + 1,
                line: raw.to_string(),
            });
        };
        let type_name = type_name.trim();
        if type_name.is_empty() {
            return Err(SpecError::InvalidLine {
                path: path.to_path_buf(),
                line_number: idx + 1,
                line: raw.to_string(),
            });
        }
        let set = map.entry(type_name.to_string()).or_default();
        for value in lines.split(',').map(str::trim).filter(|v| !v.is_empty()) {
            let number = value
                .parse::<u32>()
                .map_err(|_| SpecError::InvalidLineNumber {
                    path: path.to_path_buf(),
                    line_number: idx + 1,
                    value: value.to_string(),
                })?;
            set.insert(number);
        }
    }
    Ok(map)
}

pub fn render_breakpoints(map: &BreakpointMap, format: SpecFormat) -> String {
    match format {
        SpecFormat::Text => map
            .iter()
            .map(|(type_name, lines)| {
                let lines: Vec<String> = lines.iter().map(u32::to_string).collect();
                format!("{type_name}={}\n", lines.join(","))
            })
            .collect(),
        SpecFormat::Json => {
            let entries: Vec<BreakpointEntry> = map
                .iter()
                .map(|(type_name, lines)| BreakpointEntry {
                    file_name: type_name.clone(),
                    breakpoints: lines.iter().copied().collect(),
                })
                .collect();
            // Serializing plain strings and integers cannot fail.
            serde_json::to_string_pretty(&entries).unwrap_or_default()
        }
    }
}

pub fn write_breakpoints(
    path: &Path,
    map: &BreakpointMap,
    format: SpecFormat,
) -> Result<(), SpecError> {
    fs::write(path, render_breakpoints(map, format)).map_err(|source| SpecError::Write {
        path: path.to_path_buf(),
        source,
    })
}

pub fn read_exit_watch(path: &Path) -> Result<MethodWatch, SpecError> {
    let text = fs::read_to_string(path).map_err(|source| SpecError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let json_err = |source| SpecError::Json {
        path: path.to_path_buf(),
        source,
    };
    // Older tooling wrote the record wrapped in a one-element array.
    match serde_json::from_str(&text).map_err(json_err)? {
        ExitWatchFile::Single(watch) | ExitWatchFile::Wrapped([watch]) => Ok(watch),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ExitWatchFile {
    Single(MethodWatch),
    Wrapped([MethodWatch; 1]),
}

pub fn write_exit_watch(path: &Path, watch: &MethodWatch) -> Result<(), SpecError> {
    let text = serde_json::to_string_pretty(watch).map_err(|source| SpecError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    fs::write(path, text).map_err(|source| SpecError::Write {
        path: path.to_path_buf(),
        source,
    })
}
