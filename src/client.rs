use crate::codec::{decode_rgb, encode_jpeg, to_rgb};
use crate::error::{Error, Result};
use crate::model::Detection;
use image::RgbImage;
use reqwest::blocking::{multipart, Client, Response};
use reqwest::header::CONTENT_TYPE;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_URL: &str = "http://localhost:5000/v1/object-detection/yolov5s";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// JPEG bytes as the request body; the server answers with an image.
    Raw,
    /// JPEG in multipart field `image`; the server answers with records.
    Multipart,
}

#[derive(Debug)]
pub enum Reply {
    Image(RgbImage),
    Records(Vec<Detection>),
}

fn check_status(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        Ok(resp)
    } else {
        Err(Error::Status {
            status: status.as_u16(),
            body: resp.text().unwrap_or_default(),
        })
    }
}

/// `timeout: None` waits forever. Nothing is retried.
pub fn post_image(
    url: &str,
    image_path: &Path,
    transport: Transport,
    timeout: Option<Duration>,
) -> Result<Reply> {
    let jpeg = encode_jpeg(&to_rgb(image::open(image_path)?))?;
    debug!(url, path = %image_path.display(), bytes = jpeg.len(), ?transport, "posting image");
    let client = Client::builder().timeout(timeout).build()?;

    match transport {
        Transport::Raw => {
            let resp = client
                .post(url)
                .header(CONTENT_TYPE, "application/octet-stream")
                .body(jpeg)
                .send()?;
            let bytes = check_status(resp)?.bytes()?;
            Ok(Reply::Image(decode_rgb(&bytes)?))
        }
        Transport::Multipart => {
            let file_name = image_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "image.jpg".to_string());
            let part = multipart::Part::bytes(jpeg)
                .file_name(file_name)
                .mime_str("image/jpeg")?;
            let form = multipart::Form::new().part("image", part);
            let resp = client.post(url).multipart(form).send()?;
            Ok(Reply::Records(check_status(resp)?.json()?))
        }
    }
}
