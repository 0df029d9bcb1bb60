use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot open video {}: {reason}", path.display())]
    VideoOpen { path: PathBuf, reason: String },

    #[error("frame decode error: {0}")]
    FrameDecode(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("inference error: {0}")]
    Inference(#[from] candle_core::Error),

    #[error("model error: {0}")]
    Model(String),

    #[error("model weights not found: {}", .0.display())]
    ModelNotFound(PathBuf),

    #[error("model download failed: {0}")]
    Download(#[from] hf_hub::api::sync::ApiError),

    #[error("font error: {0}")]
    Font(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server responded with {status}: {body}")]
    Status { status: u16, body: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[cfg(feature = "opencv")]
    #[error("OpenCV error: {0}")]
    OpenCv(#[from] opencv::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
