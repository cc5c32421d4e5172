//! Reference engine
//!
//! Runs models described by a `model.yaml` manifest. Every output is wired to
//! one input endpoint and returns a copy of it, which is enough to exercise
//! the full load/run/close path without a native runtime:
//!
//! ```yaml
//! inputs:
//!   - name: image
//!     endpoint: "serving_default_image:0"
//! outputs:
//!   - name: mask
//!     endpoint: "StatefulPartitionedCall:0"
//!     source: "serving_default_image:0"
//! ```

use super::{Feed, ModelLoader, NativeModel};
use crate::signature::{strip_endpoint_suffix, Signature, SignatureEntry};
use crate::tensor::Tensor;
use serde::Deserialize;
use std::path::Path;
use tensorbridge_common::{BridgeError, Result};
use tracing::info;

pub const ENGINE_NAME: &str = "reference";

/// Manifest file every reference model directory contains
pub const MANIFEST_FILE: &str = "model.yaml";

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    inputs: Vec<SignatureEntry>,
    #[serde(default)]
    outputs: Vec<OutputSpec>,
}

#[derive(Debug, Deserialize)]
struct OutputSpec {
    name: String,
    endpoint: String,
    /// Input endpoint this output copies
    source: String,
}

/// Loader for the reference engine
#[derive(Debug, Default, Clone, Copy)]
pub struct ReferenceLoader;

impl ModelLoader for ReferenceLoader {
    fn name(&self) -> &str {
        ENGINE_NAME
    }

    fn required_entries(&self) -> &[&'static str] {
        &[MANIFEST_FILE]
    }

    fn load(&self, model_dir: &Path) -> Result<Box<dyn NativeModel>> {
        let path = model_dir.join(MANIFEST_FILE);
        let content = std::fs::read_to_string(&path)
            .map_err(|e| BridgeError::load_model(format!("Failed to read {}: {}", path.display(), e)))?;
        let manifest: Manifest = serde_yaml::from_str(&content)
            .map_err(|e| BridgeError::load_model(format!("Failed to parse {}: {}", path.display(), e)))?;

        let input_endpoints: Vec<&str> = manifest
            .inputs
            .iter()
            .map(|entry| strip_endpoint_suffix(&entry.endpoint))
            .collect();

        let mut routes = Vec::with_capacity(manifest.outputs.len());
        for output in &manifest.outputs {
            let source = strip_endpoint_suffix(&output.source);
            if !input_endpoints.contains(&source) {
                return Err(BridgeError::load_model(format!(
                    "output '{}' reads from unknown input endpoint '{}'",
                    output.name, output.source
                )));
            }
            routes.push(Route {
                endpoint: strip_endpoint_suffix(&output.endpoint).to_string(),
                source: source.to_string(),
            });
        }

        let signature = Signature {
            inputs: manifest.inputs,
            outputs: manifest
                .outputs
                .into_iter()
                .map(|output| SignatureEntry::new(output.name, output.endpoint))
                .collect(),
        };

        info!(
            model = %model_dir.display(),
            inputs = signature.inputs.len(),
            outputs = signature.outputs.len(),
            "Loaded reference model"
        );
        Ok(Box::new(ReferenceModel { signature, routes }))
    }
}

#[derive(Debug)]
struct Route {
    endpoint: String,
    source: String,
}

/// A loaded reference model
#[derive(Debug)]
pub struct ReferenceModel {
    signature: Signature,
    routes: Vec<Route>,
}

impl NativeModel for ReferenceModel {
    fn signature(&self) -> &Signature {
        &self.signature
    }

    fn run(&mut self, feeds: &[Feed<'_>], fetches: &[String]) -> Result<Vec<Tensor>> {
        fetches
            .iter()
            .map(|fetch| {
                let route = self
                    .routes
                    .iter()
                    .find(|route| &route.endpoint == fetch)
                    .ok_or_else(|| BridgeError::engine(format!("no output endpoint '{}'", fetch)))?;
                let feed = feeds
                    .iter()
                    .find(|feed| feed.endpoint == route.source)
                    .ok_or_else(|| {
                        BridgeError::engine(format!(
                            "output '{}' needs input '{}', which was not fed",
                            fetch, route.source
                        ))
                    })?;
                Ok(feed.tensor.clone().renamed(fetch.clone()))
            })
            .collect()
    }
}
