//! Detection head: confidence filtering and non-max suppression.
//!
//! Each output row is one candidate box:
//!
//! ```text
//! [cx, cy, w, h, score_class0, score_class1, ...]
//! ```

use serde::{Deserialize, Serialize};

use super::layers::{rows, LayerStack};
use super::tensor::Tensor;
use crate::error::{OffloadError, Result};

/// A kept detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// `[left, top, width, height]` in model input pixels
    pub bbox: [i32; 4],
    /// Best class score
    pub confidence: f32,
    /// Best class index
    pub class_id: usize,
    /// Class name, when labels are loaded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Object detector resuming from a split layer.
#[derive(Debug, Clone)]
pub struct DetectionModel {
    layers: LayerStack,
    labels: Vec<String>,
    conf_threshold: f32,
    iou_threshold: f32,
}

impl DetectionModel {
    /// Create a detector.
    pub fn new(layers: LayerStack, labels: Vec<String>, conf_threshold: f32, iou_threshold: f32) -> Self {
        Self {
            layers,
            labels,
            conf_threshold,
            iou_threshold,
        }
    }

    /// Layer stack
    pub fn layers(&self) -> &LayerStack {
        &self.layers
    }

    /// Forward from `start_layer`, then filter and suppress candidates.
    pub fn predict(&self, input: Tensor, start_layer: usize) -> Result<Vec<Detection>> {
        let output = self.layers.forward_from(input, start_layer)?;
        if output.ncols() < 5 {
            return Err(OffloadError::ModelExecution(format!(
                "Detection rows need at least 5 columns, got {}",
                output.ncols()
            )));
        }

        let mut candidates = Vec::new();
        for row in rows(&output) {
            let (class_id, score) = row
                .iter()
                .skip(4)
                .copied()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(&b.1))
                .unwrap_or((0, f32::NEG_INFINITY));
            if score < self.conf_threshold {
                continue;
            }
            let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
            candidates.push(Detection {
                bbox: [
                    (cx - w / 2.0) as i32,
                    (cy - h / 2.0) as i32,
                    w.max(0.0) as i32,
                    h.max(0.0) as i32,
                ],
                confidence: score,
                class_id,
                label: self.labels.get(class_id).cloned(),
            });
        }

        let kept = non_max_suppression(candidates, self.iou_threshold);
        tracing::debug!(kept = kept.len(), "detection postprocess complete");
        Ok(kept)
    }
}

/// Greedy NMS: highest confidence first, drop anything overlapping a kept
/// box by more than `iou_threshold`.
pub fn non_max_suppression(mut candidates: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Detection> = Vec::new();
    for candidate in candidates {
        if kept
            .iter()
            .all(|k| iou(&k.bbox, &candidate.bbox) <= iou_threshold)
        {
            kept.push(candidate);
        }
    }
    kept
}

/// Intersection over union of two `[left, top, width, height]` boxes.
///
/// Computed in `f64` since box extents come straight from the wire.
pub fn iou(a: &[i32; 4], b: &[i32; 4]) -> f32 {
    let [ax, ay, aw, ah] = a.map(f64::from);
    let [bx, by, bw, bh] = b.map(f64::from);
    let iw = ((ax + aw).min(bx + bw) - ax.max(bx)).max(0.0);
    let ih = ((ay + ah).min(by + bh) - ay.max(by)).max(0.0);
    let inter = iw * ih;
    let union = aw.max(0.0) * ah.max(0.0) + bw.max(0.0) * bh.max(0.0) - inter;
    if union <= 0.0 {
        0.0
    } else {
        (inter / union) as f32
    }
}
