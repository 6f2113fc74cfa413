//! Partial-inference model backend.
//!
//! The edge device runs the first layers of a network and ships the
//! intermediate activation. This module resumes the forward pass from that
//! layer boundary and turns the output into a prediction.
//!
//! # Experiments
//!
//! | Experiment       | Head                        | Keypairs                     |
//! |------------------|-----------------------------|------------------------------|
//! | `classification` | softmax, top-k classes      | `start_layer`, `top_class`   |
//! | `detection`      | box filter + NMS            | `start_layer`, `detections`  |
//!
//! The experiment is chosen once at startup by [`Model::from_config`]; weights
//! are read-only afterwards and shared by every stream.
//!
//! # Example
//!
//! ```rust,ignore
//! use offload::inference::{Model, Tensor};
//!
//! let model = Model::from_config(&config.model)?;
//! let input = Tensor::from_bytes(&payload)?;
//! let prediction = model.predict(input, 3)?;
//! ```

mod classify;
mod detect;
mod labels;
mod layers;
mod tensor;

pub use classify::{ClassScore, ClassificationModel};
pub use detect::{iou, non_max_suppression, Detection, DetectionModel};
pub use labels::{load_labels, parse_labels};
pub use layers::{LayerStack, Linear};
pub use tensor::{Precision, Tensor, MAX_RANK, TENSOR_MAGIC};

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::ModelConfig;
use crate::error::{OffloadError, Result};

/// Which prediction head the server runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExperimentType {
    /// Top-k image classification
    #[default]
    #[serde(alias = "classify", alias = "imagenet", alias = "alexnet")]
    Classification,
    /// Object detection
    #[serde(alias = "detect", alias = "yolo")]
    Detection,
}

impl ExperimentType {
    /// Config name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Classification => "classification",
            Self::Detection => "detection",
        }
    }
}

impl fmt::Display for ExperimentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for ExperimentType {
    type Err = OffloadError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "classification" | "classify" | "imagenet" | "alexnet" => Ok(Self::Classification),
            "detection" | "detect" | "yolo" => Ok(Self::Detection),
            _ => Err(OffloadError::Config(format!("Unknown experiment type: {s}"))),
        }
    }
}

/// Model output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "items", rename_all = "lowercase")]
pub enum Prediction {
    /// Ranked classes, best first
    Classification(Vec<ClassScore>),
    /// Kept boxes, best first
    Detection(Vec<Detection>),
}

impl Prediction {
    /// Auxiliary integers returned next to the encoded prediction.
    pub fn keypairs(&self, start_layer: i32) -> BTreeMap<String, i32> {
        let mut keypairs = BTreeMap::new();
        keypairs.insert("start_layer".to_string(), start_layer);
        match self {
            Self::Classification(scores) => {
                if let Some(best) = scores.first() {
                    keypairs.insert("top_class".to_string(), best.class_id as i32);
                }
            },
            Self::Detection(boxes) => {
                keypairs.insert("detections".to_string(), boxes.len() as i32);
            },
        }
        keypairs
    }
}

/// The process-wide model, one variant per experiment.
#[derive(Debug, Clone)]
pub enum Model {
    /// Classification head
    Classification(ClassificationModel),
    /// Detection head
    Detection(DetectionModel),
}

impl Model {
    /// Build the model named by `config.experiment`.
    ///
    /// Without weights the stack is empty, so payloads must already be the
    /// network's final output.
    pub fn from_config(config: &ModelConfig) -> Result<Self> {
        let layers = match &config.weights {
            Some(path) => {
                let layers = LayerStack::load(path)?;
                tracing::info!("Loaded {} layers from {}", layers.len(), path.display());
                layers
            },
            None => {
                tracing::warn!("No model weights configured, using identity layer stack");
                LayerStack::identity()
            },
        };
        let labels = match &config.labels {
            Some(path) => load_labels(path)?,
            None => Vec::new(),
        };

        let model = match config.experiment {
            ExperimentType::Classification => {
                Self::Classification(ClassificationModel::new(layers, labels, config.top_k))
            },
            ExperimentType::Detection => Self::Detection(DetectionModel::new(
                layers,
                labels,
                config.conf_threshold,
                config.iou_threshold,
            )),
        };
        tracing::info!("Model ready: {}", model.experiment());
        Ok(model)
    }

    /// Experiment this model serves
    pub fn experiment(&self) -> ExperimentType {
        match self {
            Self::Classification(_) => ExperimentType::Classification,
            Self::Detection(_) => ExperimentType::Detection,
        }
    }

    /// Number of dense layers
    pub fn num_layers(&self) -> usize {
        match self {
            Self::Classification(m) => m.layers().len(),
            Self::Detection(m) => m.layers().len(),
        }
    }

    /// Resume the forward pass at `start_layer`; `0` runs the whole stack.
    pub fn predict(&self, input: Tensor, start_layer: usize) -> Result<Prediction> {
        match self {
            Self::Classification(m) => m.predict(input, start_layer).map(Prediction::Classification),
            Self::Detection(m) => m.predict(input, start_layer).map(Prediction::Detection),
        }
    }
}
