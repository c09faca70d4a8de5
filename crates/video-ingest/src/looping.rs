//! Looping prerecorded sources used for demos and deterministic tests.
//!
//! A [`LoopingSource`] plays a [`Reel`] from start to end and then rewinds,
//! so the end of the clip never reaches the caller.

use std::{
    fs,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use image::imageops::FilterType;
use tracing::debug;

use crate::types::{Frame, FrameSource, SourceError};

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

/// Frames a looping source plays back.
#[derive(Clone, Debug)]
pub enum Reel {
    /// Frames held in memory.
    Frames(Vec<Frame>),
    /// Directory of still images played in file-name order.
    ImageDir(PathBuf),
    /// Video file decoded through OpenCV.
    #[cfg(feature = "opencv")]
    VideoFile(PathBuf),
}

impl Reel {
    fn label(&self) -> String {
        match self {
            Reel::Frames(frames) => format!("memory:{}-frames", frames.len()),
            Reel::ImageDir(path) => path.display().to_string(),
            #[cfg(feature = "opencv")]
            Reel::VideoFile(path) => path.display().to_string(),
        }
    }
}

/// Sequential reader over one pass of a clip.
pub(crate) trait ClipReader: Send {
    /// Next frame, or `SourceError::Exhausted` once the clip has been played.
    fn next_frame(&mut self) -> Result<Frame, SourceError>;

    fn rewind(&mut self) -> Result<(), SourceError>;
}

/// Prerecorded source that wraps around to its first frame on exhaustion.
pub struct LoopingSource {
    uri: String,
    reel: Reel,
    target_size: Option<(u32, u32)>,
    frame_interval: Option<Duration>,
    last_read: Option<Instant>,
    clip: Option<Box<dyn ClipReader>>,
}

impl LoopingSource {
    pub fn new(reel: Reel) -> Self {
        Self {
            uri: reel.label(),
            reel,
            target_size: None,
            frame_interval: None,
            last_read: None,
            clip: None,
        }
    }

    /// Resize every decoded frame to `(width, height)`.
    pub fn with_target_size(mut self, width: u32, height: u32) -> Self {
        self.target_size = Some((width, height));
        self
    }

    /// Pace reads so consecutive frames are at least `1 / fps` seconds apart,
    /// the way a real camera would deliver them. Rates whose period does not
    /// fit a `Duration` leave reads unpaced.
    pub fn with_frame_rate(mut self, fps: f32) -> Self {
        self.frame_interval = if fps > 0.0 {
            Duration::try_from_secs_f32(fps.recip()).ok()
        } else {
            None
        };
        self
    }

    fn pace(&mut self) {
        if let (Some(interval), Some(last)) = (self.frame_interval, self.last_read) {
            let elapsed = last.elapsed();
            if elapsed < interval {
                thread::sleep(interval - elapsed);
            }
        }
        self.last_read = Some(Instant::now());
    }
}

impl FrameSource for LoopingSource {
    fn describe(&self) -> &str {
        &self.uri
    }

    fn open(&mut self) -> Result<(), SourceError> {
        if self.clip.is_some() {
            return Ok(());
        }
        let clip: Box<dyn ClipReader> = match &self.reel {
            Reel::Frames(frames) => Box::new(MemoryClip::new(&self.uri, frames.clone())?),
            Reel::ImageDir(dir) => Box::new(ImageDirClip::open(&self.uri, dir, self.target_size)?),
            #[cfg(feature = "opencv")]
            Reel::VideoFile(path) => Box::new(crate::camera::VideoFileClip::open(
                &self.uri,
                path,
                self.target_size,
            )?),
        };
        debug!(source = %self.uri, "opened looping source");
        self.clip = Some(clip);
        self.last_read = None;
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Frame, SourceError> {
        if self.clip.is_none() {
            return Err(SourceError::NotOpen {
                uri: self.uri.clone(),
            });
        }
        self.pace();
        let uri = self.uri.clone();
        let Some(clip) = self.clip.as_mut() else {
            return Err(SourceError::NotOpen { uri });
        };
        match clip.next_frame() {
            Err(err) if err.is_exhausted() => {
                debug!(source = %uri, "clip exhausted; rewinding");
                clip.rewind()?;
                clip.next_frame().map_err(|err| match err {
                    SourceError::Exhausted { uri } => SourceError::Read {
                        uri,
                        reason: "clip yielded no frames after rewind".into(),
                    },
                    other => other,
                })
            }
            other => other,
        }
    }

    fn close(&mut self) {
        if self.clip.take().is_some() {
            debug!(source = %self.uri, "closed looping source");
        }
    }

    fn is_open(&self) -> bool {
        self.clip.is_some()
    }
}

struct MemoryClip {
    uri: String,
    frames: Vec<Frame>,
    position: usize,
}

impl MemoryClip {
    fn new(uri: &str, frames: Vec<Frame>) -> Result<Self, SourceError> {
        let Some(first) = frames.first() else {
            return Err(SourceError::Unavailable {
                uri: uri.to_string(),
                reason: "reel holds no frames".into(),
            });
        };
        let (width, height) = (first.width, first.height);
        if frames
            .iter()
            .any(|frame| frame.width != width || frame.height != height || !frame.is_well_formed())
        {
            return Err(SourceError::Unavailable {
                uri: uri.to_string(),
                reason: "reel frames must share one well-formed resolution".into(),
            });
        }
        Ok(Self {
            uri: uri.to_string(),
            frames,
            position: 0,
        })
    }
}

impl ClipReader for MemoryClip {
    fn next_frame(&mut self) -> Result<Frame, SourceError> {
        let frame = self
            .frames
            .get(self.position)
            .cloned()
            .ok_or_else(|| SourceError::Exhausted {
                uri: self.uri.clone(),
            })?;
        self.position += 1;
        Ok(frame)
    }

    fn rewind(&mut self) -> Result<(), SourceError> {
        self.position = 0;
        Ok(())
    }
}

struct ImageDirClip {
    uri: String,
    paths: Vec<PathBuf>,
    position: usize,
    size: Option<(u32, u32)>,
}

impl ImageDirClip {
    fn open(uri: &str, dir: &Path, target_size: Option<(u32, u32)>) -> Result<Self, SourceError> {
        let unavailable = |reason: String| SourceError::Unavailable {
            uri: uri.to_string(),
            reason,
        };
        let entries = fs::read_dir(dir).map_err(|err| unavailable(err.to_string()))?;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.is_file() && has_image_extension(path))
            .collect();
        if paths.is_empty() {
            return Err(unavailable("directory contains no images".into()));
        }
        paths.sort();
        Ok(Self {
            uri: uri.to_string(),
            paths,
            position: 0,
            size: target_size,
        })
    }

    fn decode(&mut self, path: &Path) -> Result<Frame, SourceError> {
        let image = image::open(path)
            .map_err(|err| SourceError::Read {
                uri: self.uri.clone(),
                reason: format!("{}: {err}", path.display()),
            })?
            .to_rgb8();
        // The first decoded image fixes the resolution when none was requested.
        let (width, height) = *self.size.get_or_insert(image.dimensions());
        let image = if image.dimensions() == (width, height) {
            image
        } else {
            image::imageops::resize(&image, width, height, FilterType::Triangle)
        };
        Frame::rgb8(width, height, image.into_raw()).map_err(|err| SourceError::Read {
            uri: self.uri.clone(),
            reason: err.to_string(),
        })
    }
}

impl ClipReader for ImageDirClip {
    fn next_frame(&mut self) -> Result<Frame, SourceError> {
        let path = self
            .paths
            .get(self.position)
            .cloned()
            .ok_or_else(|| SourceError::Exhausted {
                uri: self.uri.clone(),
            })?;
        self.position += 1;
        self.decode(&path)
    }

    fn rewind(&mut self) -> Result<(), SourceError> {
        self.position = 0;
        Ok(())
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reel(colours: &[[u8; 3]]) -> Reel {
        Reel::Frames(
            colours
                .iter()
                .map(|rgb| Frame::solid(4, 3, *rgb))
                .collect(),
        )
    }

    #[test]
    fn wraps_to_first_frame_after_the_last() {
        let mut source = LoopingSource::new(reel(&[[1, 0, 0], [2, 0, 0], [3, 0, 0]]));
        source.open().unwrap();
        let firsts: Vec<u8> = (0..7)
            .map(|_| source.read_frame().unwrap().data[0])
            .collect();
        assert_eq!(firsts, vec![1, 2, 3, 1, 2, 3, 1]);
    }

    #[test]
    fn read_before_open_and_after_close_reports_not_open() {
        let mut source = LoopingSource::new(reel(&[[1, 1, 1]]));
        assert!(matches!(
            source.read_frame(),
            Err(SourceError::NotOpen { .. })
        ));

        source.open().unwrap();
        assert!(source.is_open());
        source.read_frame().unwrap();
        source.close();
        source.close();
        assert!(!source.is_open());
        assert!(matches!(
            source.read_frame(),
            Err(SourceError::NotOpen { .. })
        ));
    }

    #[test]
    fn close_without_open_is_harmless() {
        let mut source = LoopingSource::new(reel(&[[1, 1, 1]]));
        source.close();
        assert!(!source.is_open());
    }

    #[test]
    fn empty_or_mixed_reels_are_unavailable() {
        let mut empty = LoopingSource::new(Reel::Frames(Vec::new()));
        assert!(matches!(empty.open(), Err(SourceError::Unavailable { .. })));

        let mut mixed = LoopingSource::new(Reel::Frames(vec![
            Frame::solid(4, 3, [0, 0, 0]),
            Frame::solid(2, 2, [0, 0, 0]),
        ]));
        assert!(matches!(mixed.open(), Err(SourceError::Unavailable { .. })));
    }

    #[test]
    fn missing_directory_is_unavailable() {
        let mut source = LoopingSource::new(Reel::ImageDir(PathBuf::from(
            "/definitely/not/a/clip/directory",
        )));
        assert!(matches!(source.open(), Err(SourceError::Unavailable { .. })));
        assert!(!source.is_open());
    }

    #[test]
    fn image_directory_plays_in_name_order_and_loops() {
        let dir = tempfile::tempdir().unwrap();
        for (name, shade) in [("b.png", 20u8), ("a.png", 10u8), ("c.png", 30u8)] {
            image::RgbImage::from_pixel(6, 4, image::Rgb([shade, shade, shade]))
                .save(dir.path().join(name))
                .unwrap();
        }
        fs::write(dir.path().join("notes.txt"), b"not a frame").unwrap();

        let mut source = LoopingSource::new(Reel::ImageDir(dir.path().to_path_buf()));
        source.open().unwrap();
        let shades: Vec<u8> = (0..4)
            .map(|_| {
                let frame = source.read_frame().unwrap();
                assert_eq!((frame.width, frame.height), (6, 4));
                frame.data[0]
            })
            .collect();
        assert_eq!(shades, vec![10, 20, 30, 10]);
    }

    #[test]
    fn image_directory_resizes_to_target() {
        let dir = tempfile::tempdir().unwrap();
        image::RgbImage::from_pixel(8, 8, image::Rgb([5, 6, 7]))
            .save(dir.path().join("only.png"))
            .unwrap();

        let mut source =
            LoopingSource::new(Reel::ImageDir(dir.path().to_path_buf())).with_target_size(4, 2);
        source.open().unwrap();
        let frame = source.read_frame().unwrap();
        assert_eq!((frame.width, frame.height), (4, 2));
        assert_eq!(frame.pixel(0, 0), Some(&[5, 6, 7][..]));
    }

    #[test]
    fn unrepresentable_frame_rate_leaves_reads_unpaced() {
        let mut source = LoopingSource::new(reel(&[[1, 1, 1]])).with_frame_rate(1e-30);
        source.open().unwrap();
        let start = Instant::now();
        source.read_frame().unwrap();
        source.read_frame().unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn frame_rate_paces_reads() {
        let mut source = LoopingSource::new(reel(&[[1, 1, 1]])).with_frame_rate(50.0);
        source.open().unwrap();
        let start = Instant::now();
        for _ in 0..4 {
            source.read_frame().unwrap();
        }
        // Three paced gaps of 20ms each.
        assert!(start.elapsed() >= Duration::from_millis(55));
    }
}
