use crate::client::{post_image, Reply, Transport, DEFAULT_URL};
use crate::config::{config_path, load_config, save_config};
use crate::demo::{self, DemoState, Example};
use crate::error::Result;
use crate::frame::{extract_frames, open_video};
use crate::model::YoloModel;
use crate::registry::ModelRegistry;
use crate::render::Annotator;
use crate::server::{self, AppState};
use clap::{Parser, Subcommand};
use std::net::{Ipv4Addr, SocketAddr};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser)]
#[command(
    name = "yolo-serve",
    version,
    about = "Frame sampling, demo and REST serving around a YOLO model"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Save every Nth frame of a video as JPEG
    Extract {
        /// Video to sample
        #[arg(short, long, default_value = "./BVN.mp4")]
        video: PathBuf,
        /// Directory receiving frame_NNNN.jpg files
        #[arg(short, long, default_value = "./output_frames")]
        output: PathBuf,
        /// Keep frames whose index is a multiple of this
        #[arg(short, long, default_value = "30")]
        interval: NonZeroUsize,
    },
    /// Post one image to a detection endpoint
    Request {
        #[arg(long, default_value = DEFAULT_URL)]
        url: String,
        #[arg(short, long, default_value = "data/images/zidane.jpg")]
        image: PathBuf,
        /// Where the annotated reply is written
        #[arg(short, long, default_value = "response.jpg")]
        output: PathBuf,
        /// Upload as multipart field `image` and print the detections
        #[arg(long)]
        multipart: bool,
        /// Seconds to wait for the server; waits forever when omitted
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Serve the interactive browser demo for one model
    Demo {
        #[arg(short, long, default_value = "runs/train/exp/weights/best.onnx")]
        weights: PathBuf,
        #[arg(short, long, default_value_t = 7860)]
        port: u16,
        /// Preset input as `path[,conf[,iou]]`; repeatable
        #[arg(long = "example")]
        examples: Vec<Example>,
    },
    /// Run the REST dispatch server
    Serve {
        #[arg(short, long, default_value_t = 5000)]
        port: u16,
        /// Model(s) to load, e.g. --model yolov5n yolov5s
        #[arg(long = "model", num_args = 1.., default_values = ["yolov5s"])]
        models: Vec<String>,
    },
    /// Write the effective configuration to the config file
    InitConfig,
}

pub fn run_cli() {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    if let Err(e) = execute(cli) {
        error!("{e}");
        std::process::exit(1);
    }
}

pub fn execute(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Extract {
            video,
            output,
            interval,
        } => {
            let mut source = open_video(&video)?;
            let report = extract_frames(&mut *source, &output, interval)?;
            println!(
                "saved {} of {} frames to {}",
                report.saved_frames,
                report.total_frames,
                report.output_dir.display()
            );
            Ok(())
        }
        Commands::Request {
            url,
            image,
            output,
            multipart,
            timeout,
        } => {
            let transport = if multipart {
                Transport::Multipart
            } else {
                Transport::Raw
            };
            match post_image(&url, &image, transport, timeout.map(Duration::from_secs))? {
                Reply::Image(img) => {
                    img.save(&output)?;
                    info!(
                        path = %output.display(),
                        width = img.width(),
                        height = img.height(),
                        "annotated image saved"
                    );
                }
                Reply::Records(records) => {
                    for record in &records {
                        println!("{}", serde_json::to_string(record)?);
                    }
                    info!(count = records.len(), "detections received");
                }
            }
            Ok(())
        }
        Commands::Demo {
            weights,
            port,
            examples,
        } => {
            let cfg = load_config();
            let model = YoloModel::load(&weights, &cfg)?;
            let state = DemoState::new(
                Arc::new(model),
                Annotator::from_config(&cfg)?,
                cfg.input_size,
                examples,
            );
            let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
            tokio::runtime::Runtime::new()?.block_on(demo::serve(addr, state))
        }
        Commands::Serve { port, models } => {
            let cfg = load_config();
            let registry = ModelRegistry::load(&models, &cfg)?;
            let state = AppState::new(registry, Annotator::from_config(&cfg)?, cfg.input_size);
            let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
            tokio::runtime::Runtime::new()?.block_on(server::serve(addr, state))
        }
        Commands::InitConfig => {
            save_config(&load_config());
            info!(path = %config_path().display(), "configuration written");
            Ok(())
        }
    }
}
