//! Face detection: the [`Detector`] seam and an SCRFD implementation on
//! ONNX Runtime.
//!
//! The session only needs boxes and scores, so the SCRFD keypoint heads are
//! ignored.

use crate::source::Frame;
use crate::types::{DetectedFace, FaceBox};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const INPUT_SIZE: usize = 640;
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_STD: f32 = 128.0;
const NMS_IOU: f32 = 0.4;
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;

/// Default confidence floor applied inside the SCRFD decoder.
pub const DEFAULT_MIN_CONFIDENCE: f32 = 0.5;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("unexpected model layout: {0}")]
    ModelLayout(String),
    #[error("frame is {got} bytes, expected {expected} for {width}x{height}")]
    FrameSize {
        width: u32,
        height: u32,
        expected: usize,
        got: usize,
    },
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Finds faces in a frame.
pub trait Detector: Send {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<DetectedFace>, DetectorError>;
}

/// Output tensor positions for one stride: (scores, boxes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HeadIndices {
    scores: usize,
    boxes: usize,
}

/// Scale and padding applied when fitting a frame into the model input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: usize, height: usize) -> Self {
        let scale = (INPUT_SIZE as f32 / width as f32).min(INPUT_SIZE as f32 / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            pad_x: (INPUT_SIZE as f32 - new_w) / 2.0,
            pad_y: (INPUT_SIZE as f32 - new_h) / 2.0,
        }
    }

    fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// SCRFD face detector.
pub struct ScrfdDetector {
    session: Session,
    heads: [HeadIndices; 3],
    min_confidence: f32,
}

impl ScrfdDetector {
    /// Load an SCRFD ONNX model (e.g. `det_10g.onnx`).
    pub fn load(model_path: &str, min_confidence: f32) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 6 {
            return Err(DetectorError::ModelLayout(format!(
                "expected score and bbox heads for 3 strides, got {} outputs",
                names.len()
            )));
        }
        let heads = map_heads(&names);

        tracing::info!(
            path = model_path,
            outputs = ?names,
            min_confidence,
            "loaded SCRFD model"
        );

        Ok(Self {
            session,
            heads,
            min_confidence,
        })
    }

    fn input_tensor(frame: &Frame, lb: &Letterbox) -> Array4<f32> {
        let (w, h) = (frame.width as usize, frame.height as usize);
        let mut tensor = Array4::<f32>::zeros((1, 3, INPUT_SIZE, INPUT_SIZE));

        for y in 0..INPUT_SIZE {
            for x in 0..INPUT_SIZE {
                let (fx, fy) = lb.to_frame(x as f32 + 0.5, y as f32 + 0.5);
                let pixel = if fx >= 0.0 && fy >= 0.0 && (fx as usize) < w && (fy as usize) < h {
                    frame.data[fy as usize * w + fx as usize] as f32
                } else {
                    PIXEL_MEAN
                };
                let v = (pixel - PIXEL_MEAN) / PIXEL_STD;
                for c in 0..3 {
                    tensor[[0, c, y, x]] = v;
                }
            }
        }
        tensor
    }
}

impl Detector for ScrfdDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<DetectedFace>, DetectorError> {
        let expected = frame.width as usize * frame.height as usize;
        if frame.width == 0 || frame.height == 0 || frame.data.len() < expected {
            return Err(DetectorError::FrameSize {
                width: frame.width,
                height: frame.height,
                expected,
                got: frame.data.len(),
            });
        }

        let lb = Letterbox::fit(frame.width as usize, frame.height as usize);
        let input = Self::input_tensor(frame, &lb);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut faces = Vec::new();
        for (head, &stride) in self.heads.iter().zip(STRIDES.iter()) {
            let (_, scores) = outputs[head.scores]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores/{stride}: {e}")))?;
            let (_, boxes) = outputs[head.boxes]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("boxes/{stride}: {e}")))?;
            faces.extend(decode(scores, boxes, stride, &lb, self.min_confidence));
        }

        Ok(suppress(faces, NMS_IOU))
    }
}

/// Map output names like `score_8`/`bbox_8` onto stride slots, falling back
/// to the common export order (scores 0-2, boxes 3-5).
fn map_heads(names: &[String]) -> [HeadIndices; 3] {
    let find = |prefix: &str, stride: usize| {
        let wanted = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == wanted)
    };

    let mut named = [HeadIndices { scores: 0, boxes: 0 }; 3];
    for (slot, &stride) in named.iter_mut().zip(STRIDES.iter()) {
        match (find("score", stride), find("bbox", stride)) {
            (Some(scores), Some(boxes)) => *slot = HeadIndices { scores, boxes },
            _ => {
                tracing::debug!(?names, "SCRFD outputs unnamed; using positional heads");
                return std::array::from_fn(|i| HeadIndices { scores: i, boxes: i + 3 });
            }
        }
    }
    named
}

/// Decode one stride's anchor grid into frame-space faces.
fn decode(
    scores: &[f32],
    boxes: &[f32],
    stride: usize,
    lb: &Letterbox,
    min_confidence: f32,
) -> Vec<DetectedFace> {
    let cols = INPUT_SIZE / stride;
    let cells = cols * (INPUT_SIZE / stride);
    let step = stride as f32;

    (0..cells * ANCHORS_PER_CELL)
        .filter_map(|i| {
            let score = *scores.get(i)?;
            if score <= min_confidence {
                return None;
            }
            let offsets = boxes.get(i * 4..i * 4 + 4)?;
            let cell = i / ANCHORS_PER_CELL;
            let cx = (cell % cols) as f32 * step;
            let cy = (cell / cols) as f32 * step;

            let (x1, y1) = lb.to_frame(cx - offsets[0] * step, cy - offsets[1] * step);
            let (x2, y2) = lb.to_frame(cx + offsets[2] * step, cy + offsets[3] * step);
            Some(DetectedFace {
                bbox: FaceBox {
                    x_min: x1,
                    y_min: y1,
                    width: x2 - x1,
                    height: y2 - y1,
                },
                score: score.min(1.0),
            })
        })
        .collect()
}

/// Greedy non-maximum suppression; returns faces by descending score.
fn suppress(mut faces: Vec<DetectedFace>, iou_limit: f32) -> Vec<DetectedFace> {
    faces.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut kept: Vec<DetectedFace> = Vec::with_capacity(faces.len());
    for face in faces {
        if kept.iter().all(|k| iou(&k.bbox, &face.bbox) <= iou_limit) {
            kept.push(face);
        }
    }
    kept
}

fn iou(a: &FaceBox, b: &FaceBox) -> f32 {
    let w = ((a.x_min + a.width).min(b.x_min + b.width) - a.x_min.max(b.x_min)).max(0.0);
    let h = ((a.y_min + a.height).min(b.y_min + b.height) - a.y_min.max(b.y_min)).max(0.0);
    let inter = w * h;
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
