use crate::config::{check_input_size, Config, DEFAULT_CONF_THRESHOLD, DEFAULT_IOU_THRESHOLD};
use crate::error::{Error, Result};
use candle_core::{DType, Device, Tensor};
use candle_onnx::{onnx, read_file, simple_eval};
use hf_hub::api::sync::Api;
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, info, trace};

pub const COCO_CLASSES: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat",
    "dog", "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack",
    "umbrella", "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball",
    "kite", "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket",
    "bottle", "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple",
    "sandwich", "orange", "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair",
    "couch", "potted plant", "bed", "dining table", "toilet", "tv", "laptop", "mouse",
    "remote", "keyboard", "cell phone", "microwave", "oven", "toaster", "sink", "refrigerator",
    "book", "clock", "vase", "scissors", "teddy bear", "hair drier", "toothbrush",
];

const LETTERBOX_FILL: Rgb<u8> = Rgb([114, 114, 114]);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
    pub confidence: f32,
    #[serde(rename = "class")]
    pub class_id: usize,
    pub name: String,
}

impl Detection {
    fn area(&self) -> f32 {
        (self.xmax - self.xmin).max(0.0) * (self.ymax - self.ymin).max(0.0)
    }

    pub fn iou(&self, other: &Detection) -> f32 {
        let w = (self.xmax.min(other.xmax) - self.xmin.max(other.xmin)).max(0.0);
        let h = (self.ymax.min(other.ymax) - self.ymin.max(other.ymin)).max(0.0);
        let inter = w * h;
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// Shared by every caller of the model instance; the last write wins.
#[derive(Debug)]
pub struct Thresholds {
    confidence: AtomicU32,
    iou: AtomicU32,
}

impl Thresholds {
    pub fn new(confidence: f32, iou: f32) -> Self {
        Self {
            confidence: AtomicU32::new(confidence.clamp(0.0, 1.0).to_bits()),
            iou: AtomicU32::new(iou.clamp(0.0, 1.0).to_bits()),
        }
    }

    pub fn set(&self, confidence: f32, iou: f32) {
        self.confidence
            .store(confidence.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
        self.iou.store(iou.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    pub fn confidence(&self) -> f32 {
        f32::from_bits(self.confidence.load(Ordering::Relaxed))
    }

    pub fn iou(&self) -> f32 {
        f32::from_bits(self.iou.load(Ordering::Relaxed))
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self::new(DEFAULT_CONF_THRESHOLD, DEFAULT_IOU_THRESHOLD)
    }
}

pub trait Detector: Send + Sync {
    fn detect(&self, image: &RgbImage, size: u32) -> Result<Vec<Detection>>;

    fn thresholds(&self) -> &Thresholds;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub gain: f32,
    pub pad_x: f32,
    pub pad_y: f32,
    pub width: u32,
    pub height: u32,
}

impl Letterbox {
    pub fn apply(image: &RgbImage, size: u32) -> (RgbImage, Self) {
        let (width, height) = image.dimensions();
        let gain = (size as f32 / width as f32).min(size as f32 / height as f32);
        let new_w = ((width as f32 * gain).round() as u32).clamp(1, size);
        let new_h = ((height as f32 * gain).round() as u32).clamp(1, size);
        let pad_x = (size - new_w) / 2;
        let pad_y = (size - new_h) / 2;

        let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);
        let mut canvas = RgbImage::from_pixel(size, size, LETTERBOX_FILL);
        imageops::replace(&mut canvas, &resized, pad_x as i64, pad_y as i64);

        let letterbox = Self {
            gain,
            pad_x: pad_x as f32,
            pad_y: pad_y as f32,
            width,
            height,
        };
        (canvas, letterbox)
    }

    pub fn restore(&self, det: &mut Detection) {
        let (w, h) = (self.width as f32, self.height as f32);
        det.xmin = ((det.xmin - self.pad_x) / self.gain).clamp(0.0, w);
        det.xmax = ((det.xmax - self.pad_x) / self.gain).clamp(0.0, w);
        det.ymin = ((det.ymin - self.pad_y) / self.gain).clamp(0.0, h);
        det.ymax = ((det.ymax - self.pad_y) / self.gain).clamp(0.0, h);
    }
}

/// Rows are `[cx, cy, w, h, (obj,) class scores...]`.
pub fn decode_predictions(
    rows: &[Vec<f32>],
    objectness: bool,
    conf_threshold: f32,
    names: &[String],
) -> Vec<Detection> {
    let first_class = if objectness { 5 } else { 4 };
    let mut out = Vec::new();
    for row in rows {
        if row.len() <= first_class {
            continue;
        }
        let obj = if objectness { row[4] } else { 1.0 };
        if obj <= conf_threshold {
            continue;
        }
        let Some((class_id, score)) = row[first_class..]
            .iter()
            .copied()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(&b.1))
        else {
            continue;
        };
        let confidence = obj * score;
        if confidence <= conf_threshold {
            continue;
        }
        let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
        out.push(Detection {
            xmin: cx - w / 2.0,
            ymin: cy - h / 2.0,
            xmax: cx + w / 2.0,
            ymax: cy + h / 2.0,
            confidence,
            class_id,
            name: names
                .get(class_id)
                .cloned()
                .unwrap_or_else(|| class_id.to_string()),
        });
    }
    out
}

// greedy and per class, sorted by descending confidence
pub fn non_max_suppression(
    mut candidates: Vec<Detection>,
    iou_threshold: f32,
    max_det: usize,
) -> Vec<Detection> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Detection> = Vec::new();
    for det in candidates {
        if kept.len() >= max_det {
            break;
        }
        let suppressed = kept
            .iter()
            .any(|k| k.class_id == det.class_id && k.iou(&det) > iou_threshold);
        if !suppressed {
            kept.push(det);
        }
    }
    kept
}

/// `[anchors, 5 + classes]` carries objectness, `[4 + classes, anchors]` is
/// transposed. Falls back to the longer axis when the class count matches neither.
pub fn prediction_rows(output: &Tensor, classes: usize) -> Result<(Vec<Vec<f32>>, bool)> {
    let (_, a, b) = output.dims3()?;
    let output = output.squeeze(0)?.to_dtype(DType::F32)?;
    let objectness = if b == classes + 5 {
        true
    } else if a == classes + 4 {
        false
    } else {
        a > b
    };
    let rows = if objectness {
        output.to_vec2::<f32>()?
    } else {
        output.t()?.contiguous()?.to_vec2::<f32>()?
    };
    Ok((rows, objectness))
}

// `{0: 'person', 1: 'bicycle'}`
pub fn parse_class_names(raw: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c == '\'' || c == '"' {
            let name: String = chars.by_ref().take_while(|&n| n != c).collect();
            names.push(name);
        }
    }
    names
}

fn class_names(model: &onnx::ModelProto) -> Vec<String> {
    model
        .metadata_props
        .iter()
        .find(|p| p.key == "names")
        .map(|p| parse_class_names(&p.value))
        .filter(|names| !names.is_empty())
        .unwrap_or_else(|| COCO_CLASSES.iter().map(|s| s.to_string()).collect())
}

// candle-onnx ignores MaxPool `pads`; move them into an explicit Pad node
fn patch_maxpool_padding(model: &mut onnx::ModelProto) {
    let Some(graph) = model.graph.as_mut() else {
        return;
    };
    let mut nodes = Vec::with_capacity(graph.node.len());
    for mut node in std::mem::take(&mut graph.node) {
        if node.op_type != "MaxPool" {
            nodes.push(node);
            continue;
        }
        let pads = node
            .attribute
            .iter_mut()
            .find(|a| a.name == "pads" && a.ints.iter().any(|&v| v != 0))
            .map(|a| std::mem::replace(&mut a.ints, vec![0; 4]));
        if let Some(pads) = pads.filter(|p| p.len() == 4) {
            let pads_name = format!("{}_pads", node.name);
            graph.initializer.push(onnx::TensorProto {
                name: pads_name.clone(),
                dims: vec![8],
                data_type: onnx::tensor_proto::DataType::Int64 as i32,
                int64_data: vec![0, 0, pads[0], pads[1], 0, 0, pads[2], pads[3]],
                ..Default::default()
            });
            let padded = format!("{}_padded", node.name);
            let mut pad = onnx::NodeProto {
                input: vec![node.input[0].clone(), pads_name],
                output: vec![padded.clone()],
                name: format!("{}_pad", node.name),
                op_type: "Pad".to_string(),
                ..Default::default()
            };
            pad.attribute.push(onnx::AttributeProto {
                name: "mode".to_string(),
                r#type: onnx::attribute_proto::AttributeType::String as i32,
                s: b"reflect".to_vec(),
                ..Default::default()
            });
            nodes.push(pad);
            node.input[0] = padded;
        }
        nodes.push(node);
    }
    graph.node = nodes;
}

pub fn resolve_weights(name: &str, cfg: &Config) -> Result<PathBuf> {
    let local = cfg.model_path(name);
    if local.exists() {
        return Ok(local);
    }
    match &cfg.hf_repo {
        Some(repo) => {
            info!(model = name, repo = %repo, "fetching weights from the hub");
            let file = format!("{name}.onnx");
            Ok(Api::new()?.model(repo.clone()).get(&file)?)
        }
        None => Err(Error::ModelNotFound(local)),
    }
}

pub struct YoloModel {
    name: String,
    proto: onnx::ModelProto,
    input_name: String,
    output_name: String,
    class_names: Vec<String>,
    thresholds: Thresholds,
    max_det: usize,
    device: Device,
}

impl YoloModel {
    pub fn load(path: &Path, cfg: &Config) -> Result<Self> {
        cfg.validate()?;
        let mut proto = read_file(path)?;
        patch_maxpool_padding(&mut proto);
        let graph = proto
            .graph
            .as_ref()
            .ok_or_else(|| Error::Model(format!("{} has no graph", path.display())))?;
        let input_name = graph
            .input
            .first()
            .map(|i| i.name.clone())
            .ok_or_else(|| Error::Model("graph has no inputs".to_string()))?;
        let output_name = graph
            .output
            .first()
            .map(|o| o.name.clone())
            .ok_or_else(|| Error::Model("graph has no outputs".to_string()))?;
        let class_names = class_names(&proto);
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        info!(
            model = %name,
            path = %path.display(),
            classes = class_names.len(),
            "model loaded"
        );
        Ok(Self {
            name,
            proto,
            input_name,
            output_name,
            class_names,
            thresholds: Thresholds::new(cfg.conf_threshold, cfg.iou_threshold),
            max_det: cfg.max_det,
            device: Device::Cpu,
        })
    }

    pub fn load_named(name: &str, cfg: &Config) -> Result<Self> {
        let path = resolve_weights(name, cfg)?;
        let mut model = Self::load(&path, cfg)?;
        model.name = name.to_string();
        Ok(model)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    fn input_tensor(&self, canvas: RgbImage, size: u32) -> Result<Tensor> {
        let side = size as usize;
        let tensor = Tensor::from_vec(canvas.into_raw(), (side, side, 3), &self.device)?
            .permute((2, 0, 1))?
            .to_dtype(DType::F32)?
            .affine(1.0 / 255.0, 0.0)?
            .unsqueeze(0)?
            .contiguous()?;
        Ok(tensor)
    }
}

impl Detector for YoloModel {
    fn detect(&self, image: &RgbImage, size: u32) -> Result<Vec<Detection>> {
        check_input_size(size)?;
        let (canvas, letterbox) = Letterbox::apply(image, size);
        let mut inputs = HashMap::new();
        inputs.insert(self.input_name.clone(), self.input_tensor(canvas, size)?);

        let mut outputs = simple_eval(&self.proto, inputs)?;
        let output = outputs
            .remove(&self.output_name)
            .ok_or_else(|| Error::Model(format!("output {} missing", self.output_name)))?;
        let (rows, objectness) = prediction_rows(&output, self.class_names.len())?;
        trace!(rows = rows.len(), objectness, "decoding predictions");

        let thresholds = self.thresholds();
        let (conf, iou) = (thresholds.confidence(), thresholds.iou());
        let candidates = decode_predictions(&rows, objectness, conf, &self.class_names);
        let mut detections = non_max_suppression(candidates, iou, self.max_det);
        for det in detections.iter_mut() {
            letterbox.restore(det);
        }
        debug!(
            model = %self.name,
            count = detections.len(),
            conf,
            iou,
            "inference finished"
        );
        Ok(detections)
    }

    fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }
}
