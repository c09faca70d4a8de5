use tracing::trace;
use video_ingest::Frame;

use crate::detector::{Detection, DetectionError, Detector, DetectorInitError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Horizontal {
    Left,
    Center,
    Right,
}

/// Rough distance from the camera. The camera looks down at the scene, so
/// objects lower in the frame are closer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Depth {
    Far,
    Mid,
    Near,
}

/// Grid cell of a point within a `width x height` frame.
pub fn locate(x: f32, y: f32, width: u32, height: u32) -> (Horizontal, Depth) {
    let (w, h) = (width as f32, height as f32);
    let horizontal = if x < w / 3.0 {
        Horizontal::Left
    } else if x < 2.0 * w / 3.0 {
        Horizontal::Center
    } else {
        Horizontal::Right
    };
    let depth = if y > 2.0 * h / 3.0 {
        Depth::Near
    } else if y > h / 3.0 {
        Depth::Mid
    } else {
        Depth::Far
    };
    (horizontal, depth)
}

pub fn location_label(horizontal: Horizontal, depth: Depth) -> String {
    let h = match horizontal {
        Horizontal::Left => "Left",
        Horizontal::Center => "Center",
        Horizontal::Right => "Right",
    };
    let d = match depth {
        Depth::Far => "Far",
        Depth::Mid => "Mid",
        Depth::Near => "Near",
    };
    format!("{h}-{d}")
}

/// Decorator that tags every detection of the wrapped detector with its
/// coarse location, e.g. `Left-Near`.
pub struct LocationTagger<D> {
    inner: D,
    name: String,
}

impl<D: Detector> LocationTagger<D> {
    pub fn new(inner: D) -> Self {
        let name = format!("{}+location", inner.name());
        Self { inner, name }
    }

    pub fn into_inner(self) -> D {
        self.inner
    }
}

impl<D: Detector> Detector for LocationTagger<D> {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&mut self) -> Result<(), DetectorInitError> {
        self.inner.initialize()?;
        tracing::debug!(detector = %self.name, "location tagging enabled");
        Ok(())
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectionError> {
        let mut detections = self.inner.detect(frame)?;
        for det in &mut detections {
            let (cx, cy) = det.bbox.center();
            let (horizontal, depth) = locate(cx, cy, frame.width, frame.height);
            let label = location_label(horizontal, depth);
            trace!(label = %det.label, cx, cy, location = %label, "tagged detection");
            det.location = Some(label);
        }
        Ok(detections)
    }

    fn annotate(&mut self, frame: Frame, detections: &[Detection]) -> Frame {
        self.inner.annotate(frame, detections)
    }

    fn release(&mut self) {
        self.inner.release()
    }
}
