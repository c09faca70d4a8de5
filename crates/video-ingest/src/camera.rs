//! OpenCV-backed live camera and video-file capture.

use std::path::Path;

use opencv::{
    core::{self, MatTraitConstManual},
    imgproc,
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait},
};
use tracing::{debug, warn};

use crate::{
    looping::ClipReader,
    types::{Frame, FrameSource, SourceError},
};

/// Consecutive empty reads tolerated before the device counts as disconnected.
const EMPTY_READ_LIMIT: u32 = 3;

/// Live camera opened by index (`0`) or device path (`/dev/video0`).
pub struct CameraSource {
    uri: String,
    target_size: (u32, u32),
    fps: f64,
    capture: Option<VideoCapture>,
}

impl CameraSource {
    pub fn new(uri: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            uri: uri.into(),
            target_size: (width, height),
            fps: 30.0,
            capture: None,
        }
    }

    pub fn with_requested_fps(mut self, fps: f64) -> Self {
        self.fps = fps;
        self
    }
}

impl FrameSource for CameraSource {
    fn describe(&self) -> &str {
        &self.uri
    }

    fn open(&mut self) -> Result<(), SourceError> {
        if self.capture.is_some() {
            return Ok(());
        }
        let mut cap = open_video_capture(&self.uri)?;
        configure_camera(&mut cap, self.target_size, self.fps);
        debug!(
            source = %self.uri,
            width = self.target_size.0,
            height = self.target_size.1,
            "camera opened"
        );
        self.capture = Some(cap);
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Frame, SourceError> {
        let uri = self.uri.clone();
        let target_size = self.target_size;
        let Some(cap) = self.capture.as_mut() else {
            return Err(SourceError::NotOpen { uri });
        };
        let mut raw = Mat::default();
        for _ in 0..EMPTY_READ_LIMIT {
            let grabbed = cap.read(&mut raw).map_err(|err| read_error(&uri, err))?;
            let width = raw.size().map_err(|err| read_error(&uri, err))?.width;
            if grabbed && width > 0 {
                return mat_to_frame(&uri, &raw, target_size);
            }
        }
        Err(SourceError::Read {
            uri,
            reason: "device stopped delivering frames".into(),
        })
    }

    fn close(&mut self) {
        if let Some(mut cap) = self.capture.take() {
            if let Err(err) = cap.release() {
                warn!(source = %self.uri, "failed to release camera: {err}");
            }
        }
    }

    fn is_open(&self) -> bool {
        self.capture.is_some()
    }
}

/// One pass over a video file, rewound by seeking to frame zero.
pub(crate) struct VideoFileClip {
    uri: String,
    capture: VideoCapture,
    target_size: Option<(u32, u32)>,
}

impl VideoFileClip {
    pub(crate) fn open(
        uri: &str,
        path: &Path,
        target_size: Option<(u32, u32)>,
    ) -> Result<Self, SourceError> {
        if !path.exists() {
            return Err(SourceError::Unavailable {
                uri: uri.to_string(),
                reason: "file does not exist".into(),
            });
        }
        let capture = open_video_capture(&path.to_string_lossy())?;
        Ok(Self {
            uri: uri.to_string(),
            capture,
            target_size,
        })
    }
}

impl ClipReader for VideoFileClip {
    fn next_frame(&mut self) -> Result<Frame, SourceError> {
        let mut raw = Mat::default();
        let grabbed = self
            .capture
            .read(&mut raw)
            .map_err(|err| read_error(&self.uri, err))?;
        let size = raw.size().map_err(|err| read_error(&self.uri, err))?;
        if !grabbed || size.width <= 0 {
            return Err(SourceError::Exhausted {
                uri: self.uri.clone(),
            });
        }
        let target = self
            .target_size
            .get_or_insert((size.width as u32, size.height as u32));
        mat_to_frame(&self.uri, &raw, *target)
    }

    fn rewind(&mut self) -> Result<(), SourceError> {
        self.capture
            .set(videoio::CAP_PROP_POS_FRAMES, 0.0)
            .map_err(|err| read_error(&self.uri, err))?;
        Ok(())
    }
}

fn read_error(uri: &str, err: opencv::Error) -> SourceError {
    SourceError::Read {
        uri: uri.to_string(),
        reason: err.to_string(),
    }
}

/// Resize to the target resolution and convert OpenCV's BGR layout to RGB.
fn mat_to_frame(uri: &str, raw: &Mat, target_size: (u32, u32)) -> Result<Frame, SourceError> {
    let (target_w, target_h) = target_size;
    let size = raw.size().map_err(|err| read_error(uri, err))?;
    let mut scratch = Mat::default();
    let working = if size.width != target_w as i32 || size.height != target_h as i32 {
        imgproc::resize(
            raw,
            &mut scratch,
            core::Size {
                width: target_w as i32,
                height: target_h as i32,
            },
            0.0,
            0.0,
            imgproc::INTER_LINEAR,
        )
        .map_err(|err| read_error(uri, err))?;
        &scratch
    } else {
        raw
    };

    let mut rgb = Mat::default();
    imgproc::cvt_color(working, &mut rgb, imgproc::COLOR_BGR2RGB, 0)
        .map_err(|err| read_error(uri, err))?;
    let data = rgb
        .data_bytes()
        .map_err(|err| read_error(uri, err))?
        .to_vec();
    Frame::rgb8(target_w, target_h, data).map_err(|err| SourceError::Read {
        uri: uri.to_string(),
        reason: err.to_string(),
    })
}

/// Parse a `/dev/videoX` style URI and return the zero-based index if present.
pub(crate) fn parse_device_index(uri: &str) -> Option<i32> {
    if let Ok(index) = uri.parse::<i32>() {
        return Some(index);
    }
    if let Some(stripped) = uri.strip_prefix("/dev/video") {
        if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
            return stripped.parse::<i32>().ok();
        }
    }
    None
}

/// Attempt to open a camera input either by index or URI.
fn open_video_capture(uri: &str) -> Result<VideoCapture, SourceError> {
    let mut last_error = String::from("no backend could open the source");
    if let Some(index) = parse_device_index(uri) {
        for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
            match VideoCapture::new(index, backend) {
                Ok(cap) if cap.is_opened().unwrap_or(false) => return Ok(cap),
                Ok(_) => {}
                Err(err) => {
                    debug!("failed to open device #{index} with backend {backend}: {err}");
                    last_error = err.to_string();
                }
            }
        }
        return Err(SourceError::Unavailable {
            uri: uri.to_string(),
            reason: last_error,
        });
    }

    match VideoCapture::from_file(uri, videoio::CAP_ANY) {
        Ok(cap) if cap.is_opened().unwrap_or(false) => Ok(cap),
        Ok(_) => Err(SourceError::Unavailable {
            uri: uri.to_string(),
            reason: last_error,
        }),
        Err(err) => Err(SourceError::Unavailable {
            uri: uri.to_string(),
            reason: err.to_string(),
        }),
    }
}

/// Apply common capture settings (resolution, fps, preferred pixel format).
fn configure_camera(cap: &mut VideoCapture, target_size: (u32, u32), fps: f64) {
    if let Ok(mjpg) = videoio::VideoWriter::fourcc('M', 'J', 'P', 'G') {
        let _ = cap.set(videoio::CAP_PROP_FOURCC, mjpg as f64);
    }
    let _ = cap.set(videoio::CAP_PROP_FRAME_WIDTH, target_size.0 as f64);
    let _ = cap.set(videoio::CAP_PROP_FRAME_HEIGHT, target_size.1 as f64);
    let _ = cap.set(videoio::CAP_PROP_BUFFERSIZE, 1.0);
    let _ = cap.set(videoio::CAP_PROP_FPS, fps);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_device_indices() {
        assert_eq!(parse_device_index("0"), Some(0));
        assert_eq!(parse_device_index("/dev/video2"), Some(2));
        assert_eq!(parse_device_index("/dev/video"), None);
        assert_eq!(parse_device_index("clip.mp4"), None);
    }
}
