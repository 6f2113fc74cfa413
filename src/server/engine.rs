//! Model plus compression adapter, the backend every session runs against.

use bytes::Bytes;

use crate::codec::Compressor;
use crate::config::Config;
use crate::error::{OffloadError, Result};
use crate::inference::{ExperimentType, Model, Tensor};
use crate::protocol::{InferenceBackend, InferenceOutput};

/// Read-only after startup; shared by every stream through `Arc`.
#[derive(Debug, Clone)]
pub struct Engine {
    model: Model,
    compressor: Compressor,
}

impl Engine {
    /// Create from parts
    pub fn new(model: Model, compressor: Compressor) -> Self {
        Self { model, compressor }
    }

    /// Load the configured model and compression settings.
    pub fn from_config(config: &Config) -> Result<Self> {
        let model = Model::from_config(&config.model)?;
        let compressor = Compressor::from_config(&config.compression);
        Ok(Self::new(model, compressor))
    }

    /// Loaded model
    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Experiment being served
    pub fn experiment(&self) -> ExperimentType {
        self.model.experiment()
    }
}

impl InferenceBackend for Engine {
    fn decompress(&self, payload: &[u8]) -> Result<Bytes> {
        self.compressor.unpack(payload).map(Bytes::from)
    }

    fn infer(&self, payload: &[u8], layer: i32) -> Result<InferenceOutput> {
        let start = usize::try_from(layer)
            .map_err(|_| OffloadError::ModelExecution(format!("Negative start layer {layer}")))?;
        let tensor = Tensor::from_bytes(payload).map_err(|e| {
            OffloadError::ModelExecution(format!("Payload is not a tensor: {e}"))
        })?;

        let prediction = self.model.predict(tensor, start)?;
        let results = serde_json::to_vec(&prediction).map_err(|e| {
            OffloadError::ModelExecution(format!("Failed to encode prediction: {e}"))
        })?;

        Ok(InferenceOutput {
            results: Bytes::from(results),
            keypairs: prediction.keypairs(layer),
        })
    }
}
