//! TensorBridge - Main Entry Point
//!
//! ```text
//! tensorbridge worker            serve the worker protocol on stdin/stdout
//! tensorbridge check <model_dir> load and close a model with the configured mode
//! tensorbridge metrics           print the metrics registry
//! ```

use tensorbridge_common::{BridgeConfig, BridgeError, METRICS};
use tensorbridge_runner::ExecutionFacade;
use tensorbridge_worker::{init_tracing, serve_stdio};
use tracing::{error, info};

const USAGE: &str = "usage: tensorbridge <worker | check <model_dir> | metrics>";

fn main() -> anyhow::Result<()> {
    let config = BridgeConfig::load()?;
    init_tracing(&config.observability.log_level);

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("worker") => {
            info!(pid = std::process::id(), "Starting TensorBridge worker");
            if let Err(e) = serve_stdio(&config) {
                error!(error = %e, "Worker stopped");
                return Err(e.into());
            }
            Ok(())
        }
        Some("check") => {
            let model_dir = args
                .get(1)
                .ok_or_else(|| BridgeError::config(USAGE))?;
            check(&config, model_dir)?;
            Ok(())
        }
        Some("metrics") => {
            print!("{}", METRICS.gather());
            Ok(())
        }
        _ => Err(BridgeError::config(USAGE).into()),
    }
}

/// Load a model and close it again, reporting what was found
fn check(config: &BridgeConfig, model_dir: &str) -> tensorbridge_common::Result<()> {
    let mut facade = ExecutionFacade::new(config)?;
    info!(
        out_of_process = facade.is_out_of_process(),
        worker_pid = ?facade.worker_pid(),
        "Loading {}",
        model_dir
    );

    facade.load_model(model_dir)?;
    if let Some(signature) = facade.signature() {
        for entry in &signature.inputs {
            info!(name = %entry.name, endpoint = %entry.endpoint, "Input");
        }
        for entry in &signature.outputs {
            info!(name = %entry.name, endpoint = %entry.endpoint, "Output");
        }
    }
    facade.close_model()?;

    println!("{}: ok", model_dir);
    Ok(())
}
