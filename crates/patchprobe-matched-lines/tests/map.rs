#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use patchprobe_config::{MatchedLinesConfig, SpecFormat};
use patchprobe_matched_lines::{map_copies, MapperError};
use patchprobe_process::RunCommandError;
use pretty_assertions::assert_eq;
use serde_json::json;

const LEFT: &str = r#"package calc;

public class Calculator {
    private int total;

    public int add(int a, int b) {
        int sum = a + b;
        total += sum;
        return sum;
    }

    public void reset() {
        total = 0;
    }
}
"#;

const RIGHT: &str = r#"package calc;

public class Calculator {
    private int total;

    public int add(int a, int b) {
        int sum = a + b;
        if (sum < 0)
            throw new IllegalArgumentException("overflow");
        total += sum;
        return sum;
    }

    public void reset() {
        total = 0;
    }
}
"#;

struct Workspace {
    dir: tempfile::TempDir,
}

impl Workspace {
    /// A scratch project whose differ prints `markers` regardless of input.
    fn new(markers: &[&str]) -> Self {
        let mut body = String::new();
        for marker in markers {
            body.push_str(&format!("echo '{marker}'\n"));
        }
        // Exit like `git diff --no-index` does when files differ.
        body.push_str(if markers.is_empty() { "exit 0\n" } else { "exit 1\n" });
        Self::with_differ(&body)
    }

    fn with_differ(body: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let differ = dir.path().join("diffn.sh");
        std::fs::write(&differ, format!("#!/bin/sh\n{body}")).unwrap();
        std::fs::set_permissions(&differ, std::fs::Permissions::from_mode(0o755)).unwrap();
        Self { dir }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn write(&self, relative: &str, source: &str) -> PathBuf {
        let path = self.root().join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, source).unwrap();
        path
    }

    fn config(&self, format: SpecFormat) -> MatchedLinesConfig {
        MatchedLinesConfig {
            differ: "./diffn.sh".to_string(),
            format,
            ..MatchedLinesConfig::default()
        }
    }
}

fn read_json(path: &Path) -> serde_json::Value {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

#[test]
fn inserted_guard_yields_context_lines_and_exit_watch() {
    let ws = Workspace::new(&["Right:8", "Right:9"]);
    let left = ws.write("gumtree-left/Calculator.java", LEFT);
    let right = ws.write("gumtree-right/Calculator.java", RIGHT);
    let out = ws.root().join("out");

    let outputs = map_copies(&ws.config(SpecFormat::Json), ws.root(), &left, &right, &out).unwrap();

    assert_eq!(
        read_json(&outputs.left),
        json!([{"fileName": "calc.Calculator", "breakpoints": [7, 8, 9]}])
    );
    assert_eq!(
        read_json(&outputs.right),
        json!([{"fileName": "calc.Calculator", "breakpoints": [7, 10, 11]}])
    );
    assert_eq!(
        read_json(&outputs.methods),
        json!({"name": "add", "className": "calc.Calculator"})
    );
}

#[test]
fn text_format_and_nested_constructor() {
    let left = "package calc;\n\npublic class Outer {\n    static class Memory {\n        private int value;\n\n        Memory(int value) {\n            this.value = value;\n            log();\n        }\n\n        void log() {}\n    }\n}\n";
    let right = left.replace("this.value = value;", "this.value = Math.abs(value);");
    let ws = Workspace::new(&["Left:8", "Right:8"]);
    let left = ws.write("gumtree-left/Outer.java", left);
    let right = ws.write("gumtree-right/Outer.java", &right);
    let out = ws.root().join("out");

    let outputs = map_copies(&ws.config(SpecFormat::Text), ws.root(), &left, &right, &out).unwrap();

    assert_eq!(
        std::fs::read_to_string(&outputs.left).unwrap(),
        "calc.Outer$Memory=9\n"
    );
    assert_eq!(
        std::fs::read_to_string(&outputs.right).unwrap(),
        "calc.Outer$Memory=9\n"
    );
    assert_eq!(
        read_json(&outputs.methods),
        json!({"name": "<init>", "className": "calc.Outer$Memory"})
    );
}

#[test]
fn identical_revisions_write_nothing() {
    let ws = Workspace::new(&[]);
    let left = ws.write("gumtree-left/Calculator.java", LEFT);
    let right = ws.write("gumtree-right/Calculator.java", LEFT);
    let out = ws.root().join("out");

    let err = map_copies(&ws.config(SpecFormat::Json), ws.root(), &left, &right, &out).unwrap_err();
    assert!(matches!(err, MapperError::NoDiff), "{err:?}");
    assert!(!out.exists());
}

#[test]
fn changed_signature_is_rejected_before_writing() {
    let ws = Workspace::new(&["Left:6", "Right:6", "Left:8", "Right:8"]);
    let left = ws.write("gumtree-left/Calculator.java", LEFT);
    let right = ws.write(
        "gumtree-right/Calculator.java",
        &LEFT
            .replace("add(int a, int b)", "add(long a, long b)")
            .replace("total += sum;", "total += (int) sum;"),
    );
    let out = ws.root().join("out");

    let err = map_copies(&ws.config(SpecFormat::Json), ws.root(), &left, &right, &out).unwrap_err();
    match err {
        MapperError::SignatureChanged { left, right } => {
            assert_eq!(left, "add(int,int)");
            assert_eq!(right, "add(long,long)");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!out.exists());
}

#[test]
fn crashing_differ_is_a_command_failure() {
    let ws = Workspace::with_differ("echo 'fatal: could not open file' >&2\nexit 128\n");
    let left = ws.write("gumtree-left/Calculator.java", LEFT);
    let right = ws.write("gumtree-right/Calculator.java", RIGHT);
    let out = ws.root().join("out");

    let err = map_copies(&ws.config(SpecFormat::Json), ws.root(), &left, &right, &out).unwrap_err();
    match &err {
        MapperError::Command(RunCommandError::Failed { status, stderr, .. }) => {
            assert_eq!(status.code(), Some(128));
            assert_eq!(stderr.trim(), "fatal: could not open file");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!out.exists());
}
