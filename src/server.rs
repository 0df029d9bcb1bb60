use crate::codec::{decode_rgb, encode_jpeg};
use crate::error::Error;
use crate::model::Detector;
use crate::registry::ModelRegistry;
use crate::render::Annotator;
use axum::{
    extract::{
        multipart::{MultipartError, MultipartRejection},
        DefaultBodyLimit, FromRequest, Multipart, Path, Request, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::post,
    Router,
};
use image::RgbImage;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

pub const DETECTION_ROUTE: &str = "/v1/object-detection/:model";

#[derive(Error, Debug)]
pub enum ServeError {
    #[error("model '{0}' is not loaded")]
    UnknownModel(String),

    #[error("request carries no image")]
    NoImage,

    #[error("cannot decode image: {0}")]
    BadImage(image::ImageError),

    #[error("invalid form field: {0}")]
    InvalidField(String),

    #[error("invalid multipart body: {0}")]
    Multipart(#[from] MultipartError),

    #[error("invalid multipart request: {0}")]
    MultipartRejection(#[from] MultipartRejection),

    #[error("failed to read request body: {0}")]
    Body(axum::Error),

    #[error("{0}")]
    Inference(#[from] Error),

    #[error("inference task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ServeError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServeError::UnknownModel(_) => StatusCode::NOT_FOUND,
            ServeError::NoImage
            | ServeError::BadImage(_)
            | ServeError::InvalidField(_)
            | ServeError::Multipart(_)
            | ServeError::MultipartRejection(_)
            | ServeError::Body(_) => StatusCode::BAD_REQUEST,
            ServeError::Inference(_) | ServeError::Join(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("request failed: {self}");
        } else {
            warn!(status = status.as_u16(), "rejected request: {self}");
        }
        let body = Json(ErrorBody {
            error: self.to_string(),
        });
        (status, body).into_response()
    }
}

/// Runs CPU-bound work off the async reactor.
pub(crate) async fn run_blocking<T, F>(work: F) -> Result<T, ServeError>
where
    F: FnOnce() -> Result<T, ServeError> + Send + 'static,
    T: Send + 'static,
{
    Ok(tokio::task::spawn_blocking(work).await??)
}

/// Only a failure to decode the upload is the client's fault.
pub(crate) fn decode_upload(bytes: &[u8]) -> Result<RgbImage, ServeError> {
    decode_rgb(bytes).map_err(|err| match err {
        Error::Image(e) => ServeError::BadImage(e),
        other => ServeError::Inference(other),
    })
}

pub(crate) fn is_multipart(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().starts_with("multipart/form-data"))
}

#[derive(Clone)]
pub struct AppState {
    registry: Arc<ModelRegistry>,
    annotator: Arc<Annotator>,
    input_size: u32,
}

impl AppState {
    pub fn new(registry: ModelRegistry, annotator: Annotator, input_size: u32) -> Self {
        Self {
            registry: Arc::new(registry),
            annotator: Arc::new(annotator),
            input_size,
        }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    fn lookup(&self, model: &str) -> Result<Arc<dyn Detector>, ServeError> {
        self.registry
            .get(model)
            .ok_or_else(|| ServeError::UnknownModel(model.to_string()))
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(DETECTION_ROUTE, post(predict))
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
}

async fn predict(
    State(state): State<AppState>,
    Path(model): Path<String>,
    request: Request,
) -> Result<Response, ServeError> {
    if is_multipart(request.headers()) {
        let multipart = Multipart::from_request(request, &state).await?;
        let bytes = image_field(multipart).await?;
        let detector = state.lookup(&model)?;
        let size = state.input_size;
        let detections = run_blocking(move || {
            let image = decode_upload(&bytes)?;
            Ok(detector.detect(&image, size)?)
        })
        .await?;
        debug!(model = %model, count = detections.len(), "answered with records");
        return Ok(Json(detections).into_response());
    }

    let bytes = axum::body::to_bytes(request.into_body(), usize::MAX)
        .await
        .map_err(ServeError::Body)?;
    if bytes.is_empty() {
        return Err(ServeError::NoImage);
    }
    let detector = state.lookup(&model)?;
    let annotator = state.annotator.clone();
    let size = state.input_size;
    let jpeg = run_blocking(move || {
        let image = decode_upload(&bytes)?;
        let detections = detector.detect(&image, size)?;
        Ok(encode_jpeg(&annotator.render(&image, &detections))?)
    })
    .await?;
    debug!(model = %model, bytes = jpeg.len(), "answered with annotated image");
    Ok(([(header::CONTENT_TYPE, "image/jpeg")], jpeg).into_response())
}

async fn image_field(mut multipart: Multipart) -> Result<axum::body::Bytes, ServeError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some("image") {
            let bytes = field.bytes().await?;
            if !bytes.is_empty() {
                return Ok(bytes);
            }
        }
    }
    Err(ServeError::NoImage)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> crate::error::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, models = ?state.registry().names(), "dispatch server listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
