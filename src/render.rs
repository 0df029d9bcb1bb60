use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::Detection;
use ab_glyph::{FontVec, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use std::path::Path;
use tracing::debug;

const PALETTE: [[u8; 3]; 20] = [
    [0xFF, 0x38, 0x38],
    [0xFF, 0x9D, 0x97],
    [0xFF, 0x70, 0x1F],
    [0xFF, 0xB2, 0x1D],
    [0xCF, 0xD2, 0x31],
    [0x48, 0xF9, 0x0A],
    [0x92, 0xCC, 0x17],
    [0x3D, 0xDB, 0x86],
    [0x1A, 0x93, 0x34],
    [0x00, 0xD4, 0xBB],
    [0x2C, 0x99, 0xA8],
    [0x00, 0xC2, 0xFF],
    [0x34, 0x45, 0x93],
    [0x64, 0x73, 0xFF],
    [0x00, 0x18, 0xEC],
    [0x84, 0x38, 0xFF],
    [0x52, 0x00, 0x85],
    [0xCB, 0x38, 0xFF],
    [0xFF, 0x95, 0xC8],
    [0xFF, 0x37, 0xC7],
];

const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);

pub fn class_color(class_id: usize) -> Rgb<u8> {
    Rgb(PALETTE[class_id % PALETTE.len()])
}

pub fn line_width(image: &RgbImage) -> u32 {
    let (w, h) = image.dimensions();
    (((w + h) as f32 / 2.0 * 0.003).round() as u32).max(2)
}

fn font_size(image: &RgbImage) -> f32 {
    let (w, h) = image.dimensions();
    ((w + h) as f32 / 2.0 * 0.035).round().max(12.0)
}

/// Draws detection boxes, and labels when a font is available.
pub struct Annotator {
    font: Option<FontVec>,
}

impl Annotator {
    pub fn new(font: Option<FontVec>) -> Self {
        Self { font }
    }

    pub fn from_font_file(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        let font = FontVec::try_from_vec(data)
            .map_err(|e| Error::Font(format!("{}: {e}", path.display())))?;
        debug!(path = %path.display(), "label font loaded");
        Ok(Self::new(Some(font)))
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        match &cfg.font {
            Some(path) => Self::from_font_file(path),
            None => Ok(Self::new(None)),
        }
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    pub fn draw(&self, image: &mut RgbImage, detections: &[Detection]) {
        if image.width() == 0 || image.height() == 0 {
            return;
        }
        let lw = line_width(image);
        let scale = PxScale::from(font_size(image));
        for det in detections {
            let color = class_color(det.class_id);
            let x0 = det.xmin.floor().max(0.0) as i32;
            let y0 = det.ymin.floor().max(0.0) as i32;
            let x1 = (det.xmax.ceil() as i32).min(image.width() as i32 - 1);
            let y1 = (det.ymax.ceil() as i32).min(image.height() as i32 - 1);
            if x1 <= x0 || y1 <= y0 {
                continue;
            }

            for t in 0..lw as i32 {
                let (w, h) = (x1 - x0 - 2 * t, y1 - y0 - 2 * t);
                if w <= 0 || h <= 0 {
                    break;
                }
                let rect = Rect::at(x0 + t, y0 + t).of_size(w as u32, h as u32);
                draw_hollow_rect_mut(image, rect, color);
            }

            if let Some(font) = &self.font {
                let label = format!("{} {:.2}", det.name, det.confidence);
                let (tw, th) = text_size(scale, font, &label);
                if tw == 0 || th == 0 {
                    continue;
                }
                // above the box, or inside it when there is no room
                let ly = if y0 >= th as i32 { y0 - th as i32 } else { y0 };
                let rect = Rect::at(x0, ly).of_size(tw + 2, th);
                draw_filled_rect_mut(image, rect, color);
                draw_text_mut(image, TEXT_COLOR, x0 + 1, ly, scale, font, &label);
            }
        }
    }

    pub fn render(&self, image: &RgbImage, detections: &[Detection]) -> RgbImage {
        let mut out = image.clone();
        self.draw(&mut out, detections);
        out
    }
}
