//! Native inference engines
//!
//! An engine is split in two traits so callers can substitute a mock in
//! tests without real model files:
//!
//! - [`ModelLoader`] turns an unpacked model directory into a [`NativeModel`]
//! - [`NativeModel`] runs feeds through the loaded graph
//!
//! Loaders are looked up by name with [`loader_for`].

pub mod reference;

use crate::signature::Signature;
use crate::tensor::Tensor;
use std::path::Path;
use std::sync::Arc;
use tensorbridge_common::{BridgeError, Result};

pub use reference::ReferenceLoader;

/// One input handed to the engine, keyed by resolved endpoint
#[derive(Debug, Clone, Copy)]
pub struct Feed<'a> {
    pub endpoint: &'a str,
    pub tensor: &'a Tensor,
}

/// A loaded model
pub trait NativeModel: Send {
    /// Declared inputs and outputs
    fn signature(&self) -> &Signature;

    /// Run the model. Returns one tensor per fetch, in fetch order.
    fn run(&mut self, feeds: &[Feed<'_>], fetches: &[String]) -> Result<Vec<Tensor>>;

    /// Release native resources
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Loads models for one engine
pub trait ModelLoader: Send + Sync {
    /// Engine name
    fn name(&self) -> &str;

    /// Entries an unpacked model directory must contain
    fn required_entries(&self) -> &[&'static str];

    /// Load the model in `model_dir`
    fn load(&self, model_dir: &Path) -> Result<Box<dyn NativeModel>>;
}

/// Look up a loader by engine name
pub fn loader_for(name: &str) -> Result<Arc<dyn ModelLoader>> {
    match name {
        reference::ENGINE_NAME => Ok(Arc::new(ReferenceLoader)),
        other => Err(BridgeError::config(format!("Unknown engine: {}", other))),
    }
}
