//! Classification head: softmax + top-k.

use serde::{Deserialize, Serialize};

use super::layers::{rows, softmax, LayerStack};
use super::tensor::Tensor;
use crate::error::{OffloadError, Result};

/// One ranked class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassScore {
    /// Class index
    pub class_id: usize,
    /// Class name, when labels are loaded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Softmax probability
    pub probability: f32,
}

/// Image classifier resuming from a split layer.
#[derive(Debug, Clone)]
pub struct ClassificationModel {
    layers: LayerStack,
    labels: Vec<String>,
    top_k: usize,
}

impl ClassificationModel {
    /// Create a classifier returning the `top_k` best classes.
    pub fn new(layers: LayerStack, labels: Vec<String>, top_k: usize) -> Self {
        Self {
            layers,
            labels,
            top_k: top_k.max(1),
        }
    }

    /// Layer stack
    pub fn layers(&self) -> &LayerStack {
        &self.layers
    }

    /// Forward from `start_layer`, rank the first sample's classes.
    pub fn predict(&self, input: Tensor, start_layer: usize) -> Result<Vec<ClassScore>> {
        let output = self.layers.forward_from(input, start_layer)?;
        let logits = rows(&output)
            .next()
            .ok_or_else(|| OffloadError::ModelExecution("Model produced no output rows".into()))?;
        let probs = softmax(&logits);

        let mut ranked: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        ranked.truncate(self.top_k);

        Ok(ranked
            .into_iter()
            .map(|(class_id, probability)| ClassScore {
                class_id,
                label: self.labels.get(class_id).cloned(),
                probability,
            })
            .collect())
    }
}
