#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use event_schema::data::Record;
use serde_json::Value;
use tempfile::{TempDir, tempdir};

/// Absolute path of an event or config fixture in `tests/data`.
pub fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("data")
        .join(name)
}

pub fn fixture_bytes(name: &str) -> Vec<u8> {
    fs::read(fixture_path(name)).expect("read fixture")
}

/// Builds a record from a `serde_json::json!` object literal.
pub fn record(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

/// Temporary directory for configs, payloads and processed output.
pub struct TestWorkspace {
    temp_dir: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Self {
        Self {
            temp_dir: tempdir().expect("temp dir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Writes a payload or config file and returns its path.
    pub fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        fs::write(&path, contents).expect("write temp file");
        path
    }

    /// Reads a JSON-lines file under the workspace.
    pub fn read_json_lines(&self, name: &str) -> Vec<Value> {
        let contents = fs::read_to_string(self.temp_dir.path().join(name)).expect("read output");
        contents
            .lines()
            .map(|line| serde_json::from_str(line).expect("valid JSON line"))
            .collect()
    }
}
