//! TensorBridge Worker - Main Entry Point
//!
//! Spawned by a host process. Reads tasks from stdin, writes replies to
//! stdout and logs to stderr. Exits after CLOSE or when stdin closes.

use tensorbridge_common::BridgeConfig;
use tensorbridge_worker::{init_tracing, serve_stdio};
use tracing::{error, info};

fn main() -> anyhow::Result<()> {
    let config = BridgeConfig::load()?;
    init_tracing(&config.observability.log_level);

    info!(pid = std::process::id(), engine = %config.model.engine, "Starting TensorBridge worker");

    if let Err(e) = serve_stdio(&config) {
        error!(error = %e, "Worker stopped");
        return Err(e.into());
    }

    info!("TensorBridge worker shutdown complete");
    Ok(())
}
