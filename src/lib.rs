pub mod cli;
pub mod client;
pub mod codec;
pub mod config;
pub mod demo;
pub mod error;
pub mod frame;
pub mod model;
pub mod registry;
pub mod render;
pub mod server;

pub use cli::{execute, run_cli, Cli, Commands};
pub use error::{Error, Result};
pub use frame::{extract_frames, open_video, ExtractReport, FrameSource};
pub use model::{Detection, Detector, Thresholds, YoloModel};
pub use registry::ModelRegistry;
