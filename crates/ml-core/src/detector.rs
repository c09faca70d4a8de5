use serde::Serialize;
use thiserror::Error;
use video_ingest::Frame;

/// Axis-aligned box in frame pixel coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    pub fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let overlap = BoundingBox {
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
            x2: self.x2.min(other.x2),
            y2: self.y2.min(other.y2),
        }
        .area();
        let union = self.area() + other.area() - overlap;
        if union <= 0.0 { 0.0 } else { overlap / union }
    }
}

/// Single detection returned by a detector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
    /// Coarse placement in the frame, filled in by [`crate::LocationTagger`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl Detection {
    pub fn new(label: impl Into<String>, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            label: label.into(),
            confidence: confidence.clamp(0.0, 1.0),
            bbox,
            location: None,
        }
    }
}

#[derive(Debug, Error)]
#[error("detector {detector} failed to initialise: {reason}")]
pub struct DetectorInitError {
    pub detector: String,
    pub reason: String,
}

impl DetectorInitError {
    pub fn new(detector: impl Into<String>, reason: impl ToString) -> Self {
        Self {
            detector: detector.into(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("detector used before initialisation")]
    NotInitialised,
    #[error("inference failed: {0}")]
    Inference(String),
}

/// Capability that turns a frame into detections and an annotated frame.
///
/// The pipeline calls `initialize` once before the first frame and `release`
/// once at teardown; both run on the acquisition thread.
pub trait Detector: Send {
    fn name(&self) -> &str;

    /// One-time expensive setup such as weight loading.
    fn initialize(&mut self) -> Result<(), DetectorInitError>;

    /// Detections above the detector's confidence threshold, in model order.
    /// Must not modify `frame`.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectionError>;

    /// Overlay `detections` on `frame`. Callers use the returned frame.
    fn annotate(&mut self, frame: Frame, detections: &[Detection]) -> Frame;

    /// Idempotent teardown.
    fn release(&mut self);
}

impl<D: Detector + ?Sized> Detector for Box<D> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn initialize(&mut self) -> Result<(), DetectorInitError> {
        (**self).initialize()
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectionError> {
        (**self).detect(frame)
    }

    fn annotate(&mut self, frame: Frame, detections: &[Detection]) -> Frame {
        (**self).annotate(frame, detections)
    }

    fn release(&mut self) {
        (**self).release()
    }
}

/// Pass-through detector used when detection is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDetector;

impl Detector for NullDetector {
    fn name(&self) -> &str {
        "null"
    }

    fn initialize(&mut self) -> Result<(), DetectorInitError> {
        Ok(())
    }

    fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>, DetectionError> {
        Ok(Vec::new())
    }

    fn annotate(&mut self, frame: Frame, _detections: &[Detection]) -> Frame {
        frame
    }

    fn release(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_detector_is_identity() {
        let frame = Frame::solid(4, 4, [7, 8, 9]);
        let mut detector = NullDetector;
        detector.initialize().unwrap();
        let detections = detector.detect(&frame).unwrap();
        assert!(detections.is_empty());
        assert_eq!(detector.annotate(frame.clone(), &detections), frame);
        detector.release();
        detector.release();
    }

    #[test]
    fn iou_of_disjoint_and_identical_boxes() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(20.0, 20.0, 30.0, 30.0);
        assert_eq!(a.iou(&b), 0.0);
        assert!((a.iou(&a) - 1.0).abs() < f32::EPSILON);
        let half = BoundingBox::new(0.0, 0.0, 10.0, 5.0);
        assert!((a.iou(&half) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn detection_serializes_bbox_corners() {
        let detection = Detection::new("person", 0.91, BoundingBox::new(1.0, 2.0, 3.0, 4.0));
        let json = serde_json::to_value(&detection).unwrap();
        assert_eq!(json["label"], "person");
        assert_eq!(json["bbox"]["x2"], 3.0);
        assert!(json.get("location").is_none());
    }
}
