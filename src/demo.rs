use crate::codec::encode_jpeg;
use crate::config::{DEFAULT_CONF_THRESHOLD, DEFAULT_IOU_THRESHOLD};
use crate::model::Detector;
use crate::render::Annotator;
use crate::server::{decode_upload, run_blocking, ServeError};
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info};

pub const TITLE: &str = "YOLO detection demo";
pub const DESCRIPTION: &str =
    "Upload an image and tune the confidence and IoU thresholds; the result updates live.";

const PAGE: &str = include_str!("demo.html");

/// `path[,conf[,iou]]` on the command line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Example {
    pub path: PathBuf,
    pub conf: f32,
    pub iou: f32,
}

impl FromStr for Example {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(',');
        let path = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| "example path is empty".to_string())?;
        let mut threshold = |default: f32| -> Result<f32, String> {
            match parts.next() {
                Some(v) => {
                    let v: f32 = v.trim().parse().map_err(|e| format!("{v:?}: {e}"))?;
                    if (0.0..=1.0).contains(&v) {
                        Ok(v)
                    } else {
                        Err(format!("threshold {v} outside [0, 1]"))
                    }
                }
                None => Ok(default),
            }
        };
        let conf = threshold(DEFAULT_CONF_THRESHOLD)?;
        let iou = threshold(DEFAULT_IOU_THRESHOLD)?;
        Ok(Self {
            path: PathBuf::from(path),
            conf,
            iou,
        })
    }
}

#[derive(Clone)]
pub struct DemoState {
    model: Arc<dyn Detector>,
    annotator: Arc<Annotator>,
    input_size: u32,
    examples: Arc<Vec<Example>>,
}

impl DemoState {
    pub fn new(
        model: Arc<dyn Detector>,
        annotator: Annotator,
        input_size: u32,
        examples: Vec<Example>,
    ) -> Self {
        Self {
            model,
            annotator: Arc::new(annotator),
            input_size,
            examples: Arc::new(examples),
        }
    }
}

pub fn router(state: DemoState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/predict", post(predict))
        .route("/api/examples/:index", get(example))
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
}

#[derive(Serialize)]
struct ExampleEntry {
    index: usize,
    name: String,
    conf: f32,
    iou: f32,
}

fn render_page(state: &DemoState) -> String {
    let entries: Vec<ExampleEntry> = state
        .examples
        .iter()
        .enumerate()
        .map(|(index, e)| ExampleEntry {
            index,
            name: e
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| e.path.display().to_string()),
            conf: e.conf,
            iou: e.iou,
        })
        .collect();
    let examples = serde_json::to_string(&entries)
        .unwrap_or_else(|_| "[]".to_string())
        .replace('<', "\\u003c");
    let thresholds = state.model.thresholds();
    PAGE.replace("{{TITLE}}", TITLE)
        .replace("{{DESCRIPTION}}", DESCRIPTION)
        .replace("{{CONF}}", &format!("{:.2}", thresholds.confidence()))
        .replace("{{IOU}}", &format!("{:.2}", thresholds.iou()))
        .replace("{{EXAMPLES}}", &examples)
}

async fn index(State(state): State<DemoState>) -> Html<String> {
    Html(render_page(&state))
}

fn parse_threshold(name: &str, text: &str) -> Result<f32, ServeError> {
    let value: f32 = text
        .trim()
        .parse()
        .map_err(|_| ServeError::InvalidField(format!("{name}={text:?}")))?;
    if value.is_nan() {
        return Err(ServeError::InvalidField(format!("{name}={text:?}")));
    }
    Ok(value.clamp(0.0, 1.0))
}

async fn predict(
    State(state): State<DemoState>,
    mut multipart: Multipart,
) -> Result<Response, ServeError> {
    let thresholds = state.model.thresholds();
    let mut image = None;
    let mut conf = thresholds.confidence();
    let mut iou = thresholds.iou();
    while let Some(field) = multipart.next_field().await? {
        match field.name() {
            Some("image") => image = Some(field.bytes().await?),
            Some("conf") => conf = parse_threshold("conf", &field.text().await?)?,
            Some("iou") => iou = parse_threshold("iou", &field.text().await?)?,
            _ => {}
        }
    }
    let bytes = image.filter(|b| !b.is_empty()).ok_or(ServeError::NoImage)?;

    let model = state.model.clone();
    let annotator = state.annotator.clone();
    let size = state.input_size;
    let jpeg = run_blocking(move || {
        let image = decode_upload(&bytes)?;
        // one model instance serves every session; the last writer wins
        model.thresholds().set(conf, iou);
        let detections = model.detect(&image, size)?;
        Ok(encode_jpeg(&annotator.render(&image, &detections))?)
    })
    .await?;
    debug!(conf, iou, bytes = jpeg.len(), "demo prediction");
    Ok(([(header::CONTENT_TYPE, "image/jpeg")], jpeg).into_response())
}

fn content_type(path: &std::path::Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("bmp") => "image/bmp",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}

async fn example(State(state): State<DemoState>, Path(index): Path<usize>) -> Response {
    let Some(example) = state.examples.get(index) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match tokio::fs::read(&example.path).await {
        Ok(bytes) => ([(header::CONTENT_TYPE, content_type(&example.path))], bytes).into_response(),
        Err(e) => {
            debug!(path = %example.path.display(), "example unreadable: {e}");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

pub async fn serve(addr: SocketAddr, state: DemoState) -> crate::error::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, examples = state.examples.len(), "demo listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn example_with_defaults() {
        let e: Example = "frames/frame_0000.jpg".parse().unwrap();
        assert_eq!(e.path, PathBuf::from("frames/frame_0000.jpg"));
        assert_eq!((e.conf, e.iou), (0.25, 0.45));
    }

    #[test]
    fn example_with_thresholds() {
        let e: Example = "a.jpg,0.3".parse().unwrap();
        assert_eq!((e.conf, e.iou), (0.3, 0.45));
        let e: Example = "a.jpg, 0.1, 0.6".parse().unwrap();
        assert_eq!((e.conf, e.iou), (0.1, 0.6));
        assert!("a.jpg,1.5".parse::<Example>().is_err());
        assert!(",0.3".parse::<Example>().is_err());
    }

    #[test]
    fn thresholds_clamp() {
        assert_eq!(parse_threshold("conf", "1.7").unwrap(), 1.0);
        assert_eq!(parse_threshold("conf", " -3 ").unwrap(), 0.0);
        assert!(parse_threshold("conf", "abc").is_err());
        assert!(parse_threshold("conf", "NaN").is_err());
    }
}
