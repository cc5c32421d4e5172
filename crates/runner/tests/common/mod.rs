//! Shared fixtures for runner integration tests

#![allow(dead_code)]

use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use tensorbridge_common::{BridgeConfig, ExecutionMode};

/// Reference model: `y` is a copy of `x`
pub const MANIFEST: &str = r#"
inputs:
  - name: x
    endpoint: "serving_default_x:0"
outputs:
  - name: y
    endpoint: "Identity:0"
    source: "serving_default_x:0"
"#;

/// Directory holding an unpacked reference model
pub fn model_dir() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("model.yaml"), MANIFEST).unwrap();
    dir
}

/// Directory holding only a packed reference model
pub fn packed_model_dir() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    let file = std::fs::File::create(dir.path().join("weights.zip")).unwrap();
    let mut writer = zip::ZipWriter::new(file);
    writer
        .start_file("model.yaml", zip::write::SimpleFileOptions::default())
        .unwrap();
    writer.write_all(MANIFEST.as_bytes()).unwrap();
    writer.finish().unwrap();
    dir
}

/// Out-of-process configuration with its own segment directory
pub fn config(shm_dir: &Path, reader_closes_segment: bool) -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.execution.mode = ExecutionMode::OutOfProcess;
    config.shm.dir = Some(shm_dir.to_path_buf());
    config.shm.reader_closes_segment = Some(reader_closes_segment);
    config.worker.poll_interval_ms = 20;
    config.worker.shutdown_grace_ms = 2000;
    config
}

/// Command line for the real worker
pub fn worker_command() -> Vec<String> {
    vec![env!("CARGO_BIN_EXE_tensorbridge").to_string(), "worker".to_string()]
}

/// Command line for a scripted stand-in worker
pub fn fake_worker(script: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.to_string()]
}

/// Segment files left in `dir`
pub fn segment_count(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
}

pub const SHORT: Duration = Duration::from_millis(50);
