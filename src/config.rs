use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{env, fs, path::PathBuf};
use tracing::{debug, error};

pub const DEFAULT_CONF_THRESHOLD: f32 = 0.25;
pub const DEFAULT_IOU_THRESHOLD: f32 = 0.45;
pub const DEFAULT_INPUT_SIZE: u32 = 640;
/// Largest downsampling factor of the YOLO backbones.
pub const MODEL_STRIDE: u32 = 32;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Directory holding `<model>.onnx` weights for the dispatch server.
    pub model_dir: PathBuf,
    /// Hugging Face repository used when a weight file is missing locally.
    pub hf_repo: Option<String>,
    /// TrueType font for box labels. Boxes are drawn unlabelled without it.
    pub font: Option<PathBuf>,
    pub conf_threshold: f32,
    pub iou_threshold: f32,
    pub input_size: u32,
    pub max_det: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("."),
            hf_repo: None,
            font: None,
            conf_threshold: DEFAULT_CONF_THRESHOLD,
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            input_size: DEFAULT_INPUT_SIZE,
            max_det: 1000,
        }
    }
}

impl Config {
    pub fn model_path(&self, name: &str) -> PathBuf {
        self.model_dir.join(format!("{name}.onnx"))
    }

    pub fn validate(&self) -> Result<()> {
        check_input_size(self.input_size)
    }
}

pub fn check_input_size(size: u32) -> Result<()> {
    if size == 0 || size % MODEL_STRIDE != 0 {
        return Err(Error::Model(format!(
            "input_size {size} is not a positive multiple of {MODEL_STRIDE}"
        )));
    }
    Ok(())
}

pub fn config_path() -> PathBuf {
    env::var_os("YOLO_SERVE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("yolo-serve.json"))
}

pub fn load_config() -> Config {
    let path = config_path();
    let mut cfg = match fs::read(&path) {
        Ok(data) => match serde_json::from_slice(&data) {
            Ok(cfg) => cfg,
            Err(e) => {
                error!(path = %path.display(), "ignoring malformed config: {e}");
                Config::default()
            }
        },
        Err(_) => Config::default(),
    };
    if let Some(dir) = env::var_os("YOLO_SERVE_MODEL_DIR") {
        cfg.model_dir = PathBuf::from(dir);
    }
    if let Ok(repo) = env::var("YOLO_SERVE_HF_REPO") {
        cfg.hf_repo = Some(repo);
    }
    if let Some(font) = env::var_os("YOLO_SERVE_FONT") {
        cfg.font = Some(PathBuf::from(font));
    }
    debug!(?cfg, "loaded configuration");
    cfg
}

pub fn save_config(cfg: &Config) {
    let path = config_path();
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    match serde_json::to_vec_pretty(cfg) {
        Ok(data) => {
            if let Err(e) = fs::write(&path, data) {
                error!("failed to write config: {e}");
            }
        }
        Err(e) => error!("failed to encode config: {e}"),
    }
}
