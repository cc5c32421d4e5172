//! A loaded model plus name resolution
//!
//! Shared by the in-process path and the worker service so both resolve
//! names and check output counts the same way.

use crate::engine::{Feed, ModelLoader, NativeModel};
use crate::package;
use crate::signature::Signature;
use crate::tensor::Tensor;
use std::path::{Path, PathBuf};
use tensorbridge_common::{BridgeError, Result};
use tracing::{debug, info};

pub struct ModelSession {
    model: Box<dyn NativeModel>,
    model_dir: PathBuf,
}

impl std::fmt::Debug for ModelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSession")
            .field("model_dir", &self.model_dir)
            .field("signature", self.model.signature())
            .finish()
    }
}

impl ModelSession {
    /// Unpack if needed, then load `model_dir` with `loader`.
    ///
    /// Every failure is reported as [`BridgeError::LoadModel`].
    pub fn load(loader: &dyn ModelLoader, model_dir: &Path, archive_names: &[String]) -> Result<Self> {
        let result = package::ensure_unpacked(model_dir, loader.required_entries(), archive_names)
            .and_then(|()| loader.load(model_dir));

        let model = result.map_err(BridgeError::load_model_from)?;

        info!(model = %model_dir.display(), engine = loader.name(), "Model loaded");
        Ok(Self {
            model,
            model_dir: model_dir.to_path_buf(),
        })
    }

    pub fn signature(&self) -> &Signature {
        self.model.signature()
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    /// Run the model on `inputs` and return one tensor per name in
    /// `output_names`, named accordingly
    pub fn run(&mut self, inputs: &[Tensor], output_names: &[String]) -> Result<Vec<Tensor>> {
        let signature = self.model.signature();

        let endpoints = inputs
            .iter()
            .enumerate()
            .map(|(i, tensor)| signature.resolve_input(tensor.name(), i))
            .collect::<Result<Vec<_>>>()?;
        let fetches = output_names
            .iter()
            .enumerate()
            .map(|(i, name)| signature.resolve_output(name, i))
            .collect::<Result<Vec<_>>>()?;

        let feeds: Vec<Feed<'_>> = endpoints
            .iter()
            .zip(inputs)
            .map(|(endpoint, tensor)| Feed { endpoint, tensor })
            .collect();

        debug!(inputs = feeds.len(), fetches = ?fetches, "Running model");
        let results = self.model.run(&feeds, &fetches)?;

        if results.len() != output_names.len() {
            return Err(BridgeError::OutputCountMismatch {
                expected: output_names.len(),
                actual: results.len(),
            });
        }

        Ok(results
            .into_iter()
            .zip(output_names)
            .map(|(tensor, name)| tensor.renamed(name.clone()))
            .collect())
    }

    /// Release the model
    pub fn close(mut self) -> Result<()> {
        self.model.close()
    }
}
