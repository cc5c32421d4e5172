//! Worker command line resolution

use std::path::PathBuf;
use tensorbridge_common::{BridgeConfig, BridgeError, Result};

/// File name of the worker executable
pub const WORKER_BINARY: &str = "tensorbridge-worker";

/// `tensorbridge-worker` next to the running executable
pub fn default_worker_program() -> Result<PathBuf> {
    let exe = std::env::current_exe()
        .map_err(|e| BridgeError::config(format!("Cannot find own executable: {}", e)))?;
    let dir = exe
        .parent()
        .ok_or_else(|| BridgeError::config(format!("{} has no parent directory", exe.display())))?;

    let program = dir.join(format!("{}{}", WORKER_BINARY, std::env::consts::EXE_SUFFIX));
    if !program.is_file() {
        return Err(BridgeError::config(format!(
            "Worker executable not found at {}; set worker.program",
            program.display()
        )));
    }
    Ok(program)
}

/// Full worker command line: program followed by its arguments
pub fn resolve_command_line(config: &BridgeConfig) -> Result<Vec<String>> {
    let program = match &config.worker.program {
        Some(program) => program.clone(),
        None => default_worker_program()?,
    };

    let mut command_line = vec![program.to_string_lossy().into_owned()];
    command_line.extend(config.worker.args.iter().cloned());
    Ok(command_line)
}
