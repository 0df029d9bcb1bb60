use crate::codec::encode_jpeg;
use crate::error::{Error, Result};
use image::codecs::gif::GifDecoder;
use image::{AnimationDecoder, DynamicImage, Frames, RgbImage};
use std::fs::{self, File};
use std::io::BufReader;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub trait FrameSource {
    fn next_frame(&mut self) -> Result<Option<RgbImage>>;
}

pub struct GifFrames {
    frames: Frames<'static>,
}

impl GifFrames {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::VideoOpen {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let decoder = GifDecoder::new(BufReader::new(file)).map_err(|e| Error::VideoOpen {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            frames: decoder.into_frames(),
        })
    }
}

impl FrameSource for GifFrames {
    fn next_frame(&mut self) -> Result<Option<RgbImage>> {
        match self.frames.next() {
            Some(frame) => {
                let rgba = frame?.into_buffer();
                Ok(Some(DynamicImage::ImageRgba8(rgba).into_rgb8()))
            }
            None => Ok(None),
        }
    }
}

#[cfg(feature = "opencv")]
mod capture {
    use super::FrameSource;
    use crate::error::{Error, Result};
    use image::RgbImage;
    use opencv::{core::Mat, imgproc, prelude::*, videoio};
    use std::path::Path;

    pub struct VideoCaptureFrames {
        cap: videoio::VideoCapture,
    }

    impl VideoCaptureFrames {
        pub fn open(path: &Path) -> Result<Self> {
            let cap = videoio::VideoCapture::from_file(&path.to_string_lossy(), videoio::CAP_ANY)?;
            if !cap.is_opened()? {
                return Err(Error::VideoOpen {
                    path: path.to_path_buf(),
                    reason: "VideoCapture could not open the file".to_string(),
                });
            }
            Ok(Self { cap })
        }
    }

    impl FrameSource for VideoCaptureFrames {
        fn next_frame(&mut self) -> Result<Option<RgbImage>> {
            let mut bgr = Mat::default();
            if !self.cap.read(&mut bgr)? {
                return Ok(None);
            }
            let mut rgb = Mat::default();
            imgproc::cvt_color(&bgr, &mut rgb, imgproc::COLOR_BGR2RGB, 0)?;
            let (width, height) = (rgb.cols() as u32, rgb.rows() as u32);
            let data = rgb.data_bytes()?.to_vec();
            RgbImage::from_raw(width, height, data)
                .map(Some)
                .ok_or_else(|| Error::FrameDecode(format!("bad frame buffer {width}x{height}")))
        }
    }

    impl Drop for VideoCaptureFrames {
        fn drop(&mut self) {
            let _ = self.cap.release();
        }
    }
}

#[cfg(feature = "opencv")]
pub use capture::VideoCaptureFrames;

pub fn open_video(path: &Path) -> Result<Box<dyn FrameSource>> {
    let is_gif = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("gif"));
    if is_gif {
        return Ok(Box::new(GifFrames::open(path)?));
    }
    #[cfg(feature = "opencv")]
    {
        Ok(Box::new(VideoCaptureFrames::open(path)?))
    }
    #[cfg(not(feature = "opencv"))]
    {
        Err(Error::VideoOpen {
            path: path.to_path_buf(),
            reason: "only GIF input is available without the `opencv` feature".to_string(),
        })
    }
}

pub fn frame_file_name(index: usize) -> String {
    format!("frame_{index:04}.jpg")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractReport {
    pub total_frames: usize,
    pub saved_frames: usize,
    pub output_dir: PathBuf,
}

/// An unreadable frame ends the stream like end of file does.
pub fn extract_frames<S: FrameSource + ?Sized>(
    source: &mut S,
    output_dir: &Path,
    interval: NonZeroUsize,
) -> Result<ExtractReport> {
    fs::create_dir_all(output_dir)?;
    debug!(dir = %output_dir.display(), interval = interval.get(), "extracting frames");

    let mut total_frames = 0usize;
    let mut saved_frames = 0usize;
    loop {
        let frame = match source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                warn!(frame = total_frames, "stopping at unreadable frame: {e}");
                break;
            }
        };
        if total_frames % interval.get() == 0 {
            let path = output_dir.join(frame_file_name(total_frames));
            fs::write(&path, encode_jpeg(&frame)?)?;
            saved_frames += 1;
            info!(path = %path.display(), "saved frame");
        }
        total_frames += 1;
    }

    info!(
        saved = saved_frames,
        total = total_frames,
        dir = %output_dir.display(),
        "frame extraction finished"
    );
    Ok(ExtractReport {
        total_frames,
        saved_frames,
        output_dir: output_dir.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_zero_padded() {
        assert_eq!(frame_file_name(0), "frame_0000.jpg");
        assert_eq!(frame_file_name(30), "frame_0030.jpg");
        assert_eq!(frame_file_name(12345), "frame_12345.jpg");
    }

    #[test]
    fn missing_video_is_reported() {
        let err = open_video(Path::new("does/not/exist.gif")).err().unwrap();
        assert!(matches!(err, Error::VideoOpen { .. }));
    }
}
