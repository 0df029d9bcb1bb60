use crate::error::Result;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, RgbImage};

pub const JPEG_QUALITY: u8 = 95;

pub fn encode_jpeg(image: &RgbImage) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY).encode_image(image)?;
    Ok(buf)
}

pub fn decode_rgb(bytes: &[u8]) -> Result<RgbImage> {
    Ok(image::load_from_memory(bytes)?.into_rgb8())
}

/// Flattens alpha and expands grayscale so the image can be JPEG encoded.
pub fn to_rgb(image: DynamicImage) -> RgbImage {
    image.into_rgb8()
}
