//! Dense layer stack that can resume a forward pass at any layer boundary.
//!
//! Weights are read from safetensors:
//!
//! ```text
//! layers.0.weight  [out, in]   layers.0.bias  [out]
//! layers.1.weight  [out, in]   layers.1.bias  [out]
//! ...
//! ```
//!
//! ReLU is applied between layers, never after the last one.

use std::collections::HashMap;
use std::path::Path;

use ndarray::{Array1, Array2, Axis};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};

use super::tensor::Tensor;
use crate::error::{OffloadError, Result};

/// Linear layer (dense)
#[derive(Debug, Clone)]
pub struct Linear {
    weight: Array2<f32>, // [out_features, in_features]
    bias: Array1<f32>,
}

impl Linear {
    /// Create a layer; `bias` must match the weight's output width.
    pub fn new(weight: Array2<f32>, bias: Array1<f32>) -> Result<Self> {
        if weight.nrows() != bias.len() {
            return Err(OffloadError::ModelLoad(format!(
                "Bias length {} does not match {} output features",
                bias.len(),
                weight.nrows()
            )));
        }
        Ok(Self { weight, bias })
    }

    /// Input width
    pub fn in_features(&self) -> usize {
        self.weight.ncols()
    }

    /// Output width
    pub fn out_features(&self) -> usize {
        self.weight.nrows()
    }

    fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        // y = xWᵀ + b, one row per sample
        x.dot(&self.weight.t()) + &self.bias
    }
}

/// Ordered dense layers. Shared read-only between sessions.
#[derive(Debug, Clone, Default)]
pub struct LayerStack {
    layers: Vec<Linear>,
}

impl LayerStack {
    /// Stack from already-built layers; adjacent widths must agree.
    pub fn new(layers: Vec<Linear>) -> Result<Self> {
        for (i, pair) in layers.windows(2).enumerate() {
            if pair[0].out_features() != pair[1].in_features() {
                return Err(OffloadError::ModelLoad(format!(
                    "Layer {i} outputs {} features but layer {} expects {}",
                    pair[0].out_features(),
                    i + 1,
                    pair[1].in_features()
                )));
            }
        }
        Ok(Self { layers })
    }

    /// Stack with no layers: payloads are already final outputs.
    pub fn identity() -> Self {
        Self::default()
    }

    /// Load from a safetensors file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|e| {
            OffloadError::ModelLoad(format!("Failed to read weights {}: {e}", path.display()))
        })?;
        Self::from_safetensors(&data)
    }

    /// Load from in-memory safetensors bytes
    pub fn from_safetensors(data: &[u8]) -> Result<Self> {
        let tensors = SafeTensors::deserialize(data)?;

        let mut layers = Vec::new();
        loop {
            let idx = layers.len();
            let weight_name = format!("layers.{idx}.weight");
            if tensors.tensor(&weight_name).is_err() {
                break;
            }
            let weight = load_tensor_2d(&tensors, &weight_name)?;
            let bias = load_tensor_1d(&tensors, &format!("layers.{idx}.bias"))?;
            layers.push(Linear::new(weight, bias)?);
        }

        if layers.is_empty() {
            return Err(OffloadError::ModelLoad(
                "No 'layers.0.weight' tensor found".to_string(),
            ));
        }
        Self::new(layers)
    }

    /// Serialize to safetensors bytes
    pub fn to_safetensors(&self) -> Result<Vec<u8>> {
        let mut raw: Vec<(String, Vec<usize>, Vec<u8>)> = Vec::new();
        for (i, layer) in self.layers.iter().enumerate() {
            raw.push((
                format!("layers.{i}.weight"),
                layer.weight.shape().to_vec(),
                le_bytes(layer.weight.iter()),
            ));
            raw.push((
                format!("layers.{i}.bias"),
                vec![layer.bias.len()],
                le_bytes(layer.bias.iter()),
            ));
        }

        let views = raw
            .iter()
            .map(|(name, shape, bytes)| {
                TensorView::new(Dtype::F32, shape.clone(), bytes)
                    .map(|view| (name.clone(), view))
                    .map_err(OffloadError::from)
            })
            .collect::<Result<HashMap<String, TensorView<'_>>>>()?;

        Ok(safetensors::serialize(views, &None)?)
    }

    /// Number of layers
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// No layers
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Run layers `start_layer..` on `input`, returning `[rows, features]`.
    ///
    /// The input is read as `[rows, in_features]`: either its last dimension
    /// matches the first remaining layer, or everything after the batch
    /// dimension is flattened into it.
    pub fn forward_from(&self, input: Tensor, start_layer: usize) -> Result<Array2<f32>> {
        if start_layer > self.layers.len() {
            return Err(OffloadError::ModelExecution(format!(
                "Start layer {start_layer} is beyond the model's {} layers",
                self.layers.len()
            )));
        }

        let remaining = &self.layers[start_layer..];
        let in_features = remaining.first().map(Linear::in_features);
        let mut h = as_rows(input, in_features)?;

        for (offset, layer) in remaining.iter().enumerate() {
            h = layer.forward(&h);
            if start_layer + offset + 1 < self.layers.len() {
                h.mapv_inplace(relu);
            }
        }
        Ok(h)
    }
}

fn relu(x: f32) -> f32 {
    x.max(0.0)
}

/// Softmax over a single row
pub(crate) fn softmax(x: &Array1<f32>) -> Array1<f32> {
    let max = x.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let exp = x.mapv(|v| (v - max).exp());
    let sum = exp.sum();
    exp / sum
}

/// Reshape a tensor to `[rows, features]`.
fn as_rows(input: Tensor, in_features: Option<usize>) -> Result<Array2<f32>> {
    let shape = input.shape().to_vec();
    let len = input.len();
    if shape.is_empty() || len == 0 {
        return Err(OffloadError::ModelExecution(format!(
            "Cannot run an empty tensor (shape {shape:?})"
        )));
    }

    let last = shape[shape.len() - 1];
    let flattened = len / shape[0];
    let features = match in_features {
        None => last,
        Some(width) if width == last => last,
        Some(width) if width == flattened => flattened,
        Some(width) => {
            return Err(OffloadError::ModelExecution(format!(
                "Tensor {shape:?} does not fit a layer expecting {width} input features"
            )))
        },
    };

    let array = input
        .into_array()
        .map_err(|e| OffloadError::ModelExecution(e.to_string()))?;
    let rows = len / features;
    array
        .into_shape_with_order((rows, features))
        .map_err(|e| OffloadError::ModelExecution(format!("Reshape failed: {e}")))
}

/// Rows of `output` as owned vectors.
pub(crate) fn rows(output: &Array2<f32>) -> impl Iterator<Item = Array1<f32>> + '_ {
    output.axis_iter(Axis(0)).map(|row| row.to_owned())
}

fn le_bytes<'a>(values: impl Iterator<Item = &'a f32>) -> Vec<u8> {
    values.flat_map(|v| v.to_le_bytes()).collect()
}

fn load_tensor_view<'a>(tensors: &'a SafeTensors<'a>, name: &str) -> Result<TensorView<'a>> {
    let view = tensors
        .tensor(name)
        .map_err(|e| OffloadError::ModelLoad(format!("Tensor '{name}' not found: {e}")))?;
    if view.dtype() != Dtype::F32 {
        return Err(OffloadError::ModelLoad(format!(
            "Tensor '{name}' is {:?}, expected F32",
            view.dtype()
        )));
    }
    Ok(view)
}

fn view_f32(view: &TensorView<'_>) -> Vec<f32> {
    view.data()
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

fn load_tensor_1d(tensors: &SafeTensors, name: &str) -> Result<Array1<f32>> {
    let view = load_tensor_view(tensors, name)?;
    if view.shape().len() != 1 {
        return Err(OffloadError::ModelLoad(format!(
            "Expected 1D tensor for '{name}', got {:?}",
            view.shape()
        )));
    }
    Ok(Array1::from_vec(view_f32(&view)))
}

fn load_tensor_2d(tensors: &SafeTensors, name: &str) -> Result<Array2<f32>> {
    let view = load_tensor_view(tensors, name)?;

    let shape = view.shape();
    if shape.len() != 2 {
        return Err(OffloadError::ModelLoad(format!(
            "Expected 2D tensor for '{name}', got {shape:?}"
        )));
    }

    Array2::from_shape_vec((shape[0], shape[1]), view_f32(&view))
        .map_err(|e| OffloadError::ModelLoad(format!("Shape mismatch for '{name}': {e}")))
}
