mod common;

use image::RgbImage;
use proptest::prelude::*;
use std::num::NonZeroUsize;
use tempfile::tempdir;
use yolo_serve::frame::{frame_file_name, GifFrames};
use yolo_serve::{extract_frames, open_video, Error, FrameSource, Result};

struct Synthetic {
    remaining: usize,
}

impl FrameSource for Synthetic {
    fn next_frame(&mut self) -> Result<Option<RgbImage>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        Ok(Some(common::sample_image(16, 12)))
    }
}

/// Yields `good` frames, then fails to decode.
struct Truncated {
    good: usize,
}

impl FrameSource for Truncated {
    fn next_frame(&mut self) -> Result<Option<RgbImage>> {
        if self.good == 0 {
            return Err(Error::FrameDecode("truncated stream".to_string()));
        }
        self.good -= 1;
        Ok(Some(common::sample_image(16, 12)))
    }
}

fn saved_names(dir: &std::path::Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn saves_every_nth_frame(frames in 0usize..40, interval in 1usize..8) {
        let dir = tempdir().unwrap();
        let out = dir.path().join("frames");
        let mut source = Synthetic { remaining: frames };
        let interval = NonZeroUsize::new(interval).unwrap();

        let report = extract_frames(&mut source, &out, interval).unwrap();

        let expected: Vec<String> = (0..frames)
            .step_by(interval.get())
            .map(frame_file_name)
            .collect();
        prop_assert_eq!(report.total_frames, frames);
        prop_assert_eq!(report.saved_frames, frames.div_ceil(interval.get()));
        prop_assert_eq!(saved_names(&out), expected);
    }
}

#[test]
fn extraction_into_existing_directory_is_idempotent() {
    let dir = tempdir().unwrap();
    let interval = NonZeroUsize::new(2).unwrap();
    for _ in 0..2 {
        let mut source = Synthetic { remaining: 5 };
        let report = extract_frames(&mut source, dir.path(), interval).unwrap();
        assert_eq!(report.saved_frames, 3);
    }
    assert_eq!(
        saved_names(dir.path()),
        vec!["frame_0000.jpg", "frame_0002.jpg", "frame_0004.jpg"]
    );
}

#[test]
fn unreadable_frame_ends_the_stream() {
    let dir = tempdir().unwrap();
    let mut source = Truncated { good: 5 };
    let report = extract_frames(&mut source, dir.path(), NonZeroUsize::new(2).unwrap()).unwrap();
    assert_eq!(report.total_frames, 5);
    assert_eq!(report.saved_frames, 3);
    assert_eq!(
        saved_names(dir.path()),
        vec!["frame_0000.jpg", "frame_0002.jpg", "frame_0004.jpg"]
    );
}

#[test]
fn saved_frames_are_decodable_jpegs() {
    let dir = tempdir().unwrap();
    let mut source = Synthetic { remaining: 1 };
    extract_frames(&mut source, dir.path(), NonZeroUsize::MIN).unwrap();
    let img = image::open(dir.path().join("frame_0000.jpg")).unwrap();
    assert_eq!((img.width(), img.height()), (16, 12));
}

#[test]
fn gif_container_is_sampled() {
    let dir = tempdir().unwrap();
    let video = dir.path().join("clip.gif");
    common::write_gif(&video, 7);

    let mut source = open_video(&video).unwrap();
    let out = dir.path().join("out");
    let report = extract_frames(&mut *source, &out, NonZeroUsize::new(3).unwrap()).unwrap();

    assert_eq!(report.total_frames, 7);
    assert_eq!(report.saved_frames, 3);
    assert_eq!(
        saved_names(&out),
        vec!["frame_0000.jpg", "frame_0003.jpg", "frame_0006.jpg"]
    );
}

#[test]
fn gif_frames_keep_dimensions() {
    let dir = tempdir().unwrap();
    let video = dir.path().join("clip.gif");
    common::write_gif(&video, 2);
    let mut frames = GifFrames::open(&video).unwrap();
    let first = frames.next_frame().unwrap().unwrap();
    assert_eq!(first.dimensions(), (8, 6));
    assert!(frames.next_frame().unwrap().is_some());
    assert!(frames.next_frame().unwrap().is_none());
}

#[test]
fn unreadable_gif_is_a_video_open_error() {
    let dir = tempdir().unwrap();
    let video = dir.path().join("broken.gif");
    std::fs::write(&video, b"not a gif").unwrap();
    let err = open_video(&video).err().unwrap();
    assert!(matches!(err, yolo_serve::Error::VideoOpen { .. }));
}
