//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use image::codecs::gif::GifEncoder;
use image::{Delay, Frame, Rgb, RgbImage, Rgba, RgbaImage};
use std::fs::File;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use yolo_serve::render::Annotator;
use yolo_serve::server::{router, AppState};
use yolo_serve::{Detection, Detector, ModelRegistry, Result, Thresholds};

/// Detector returning the same boxes for any input.
pub struct FixedDetector {
    pub thresholds: Thresholds,
    pub detections: Vec<Detection>,
}

impl FixedDetector {
    pub fn new() -> Self {
        Self {
            thresholds: Thresholds::default(),
            detections: vec![
                Detection {
                    xmin: 2.0,
                    ymin: 3.0,
                    xmax: 30.0,
                    ymax: 20.0,
                    confidence: 0.875,
                    class_id: 0,
                    name: "person".to_string(),
                },
                Detection {
                    xmin: 10.0,
                    ymin: 10.0,
                    xmax: 40.0,
                    ymax: 44.0,
                    confidence: 0.5,
                    class_id: 16,
                    name: "dog".to_string(),
                },
            ],
        }
    }
}

impl Detector for FixedDetector {
    fn detect(&self, _image: &RgbImage, _size: u32) -> Result<Vec<Detection>> {
        Ok(self.detections.clone())
    }

    fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }
}

pub fn registry_with(name: &str) -> ModelRegistry {
    [(
        name.to_string(),
        Arc::new(FixedDetector::new()) as Arc<dyn Detector>,
    )]
    .into_iter()
    .collect()
}

pub fn app_state(name: &str) -> AppState {
    AppState::new(registry_with(name), Annotator::new(None), 640)
}

pub fn sample_image(width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| Rgb([(x * 3) as u8, (y * 5) as u8, 90]))
}

pub fn sample_jpeg(width: u32, height: u32) -> Vec<u8> {
    yolo_serve::codec::encode_jpeg(&sample_image(width, height)).unwrap()
}

/// Animated GIF with `count` distinguishable frames.
pub fn write_gif(path: &Path, count: usize) {
    let file = File::create(path).unwrap();
    let mut encoder = GifEncoder::new(file);
    let frames = (0..count).map(|i| {
        let buf = RgbaImage::from_pixel(8, 6, Rgba([(i * 20) as u8, 40, 200, 255]));
        Frame::from_parts(buf, 0, 0, Delay::from_numer_denom_ms(40, 1))
    });
    encoder.encode_frames(frames).unwrap();
}

/// Multipart body with the given `(name, filename, bytes)` parts.
pub fn multipart_body(boundary: &str, parts: &[(&str, Option<&str>, &[u8])]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, filename, bytes) in parts {
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        match filename {
            Some(f) => body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{name}\"; filename=\"{f}\"\r\nContent-Type: image/jpeg\r\n\r\n"
                )
                .as_bytes(),
            ),
            None => body.extend_from_slice(
                format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
            ),
        }
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    body
}

/// Serves the dispatch router on an ephemeral port in a background thread.
pub fn spawn_server(state: AppState) -> SocketAddr {
    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async move {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            tx.send(listener.local_addr().unwrap()).unwrap();
            axum::serve(listener, router(state)).await.unwrap();
        });
    });
    rx.recv().unwrap()
}
