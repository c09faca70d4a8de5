//! TorchScript YOLO person detector.
//!
//! Expects a YOLOv8-style export producing `[1, 4 + classes, predictions]`
//! with rows of `cx, cy, w, h, class scores...` in model input pixels.

use std::{
    convert::TryFrom,
    path::{Path, PathBuf},
    sync::Once,
};

use image::{RgbImage, imageops::FilterType};
use libloading::os::unix::{Library, RTLD_GLOBAL, RTLD_NOW};
use tch::{CModule, Cuda, Device, Kind, Tensor};
use tracing::{debug, info, warn};
use video_ingest::Frame;

use crate::{
    annotation::draw_detections,
    detector::{BoundingBox, Detection, DetectionError, Detector, DetectorInitError},
};

pub use tch;

const PERSON_CLASS: usize = 0;
const PERSON_LABEL: &str = "person";
const NMS_IOU_THRESHOLD: f32 = 0.45;
const MAX_DETECTIONS: usize = 512;

/// Make the CUDA backends of libtorch visible before the first CUDA call.
///
/// Linking alone does not pull in `libtorch_cuda*.so` on every distribution,
/// which leaves `Cuda::is_available()` false on machines that have a GPU.
pub fn load_torch_cuda_runtime(verbose: bool) {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let mut handles = Vec::new();
        for lib in [
            "libtorch_cuda.so",
            "libtorch_cuda_cu.so",
            "libtorch_cuda_cpp.so",
        ] {
            match unsafe { Library::open(Some(lib), RTLD_NOW | RTLD_GLOBAL) } {
                Ok(handle) => {
                    if verbose {
                        info!("loaded {lib}");
                    }
                    handles.push(handle);
                }
                Err(err) => {
                    if verbose {
                        warn!("failed to load {lib}: {err}");
                    }
                }
            }
        }
        Box::leak(Box::new(handles));
    });
}

/// Pick the inference device. `use_cpu` forces the CPU; otherwise CUDA is used
/// when libtorch can see a device.
pub fn select_device(use_cpu: bool, verbose: bool) -> Device {
    if use_cpu {
        return Device::Cpu;
    }
    load_torch_cuda_runtime(verbose);
    debug!(
        "CUDA available: {} (devices: {})",
        Cuda::is_available(),
        Cuda::device_count()
    );
    Device::cuda_if_available()
}

pub struct TorchDetector {
    model_path: PathBuf,
    device: Device,
    input_size: (u32, u32),
    confidence_threshold: f32,
    module: Option<CModule>,
}

impl TorchDetector {
    pub fn new(model_path: impl AsRef<Path>, device: Device, confidence_threshold: f32) -> Self {
        Self {
            model_path: model_path.as_ref().to_path_buf(),
            device,
            input_size: (640, 640),
            confidence_threshold,
            module: None,
        }
    }

    pub fn with_input_size(mut self, width: u32, height: u32) -> Self {
        self.input_size = (width, height);
        self
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Resize to the model input and lay out as a normalised `[1, 3, h, w]`
    /// float tensor.
    fn frame_to_tensor(&self, frame: &Frame) -> Result<Tensor, DetectionError> {
        let (in_w, in_h) = self.input_size;
        let image = RgbImage::from_raw(frame.width, frame.height, frame.data.clone())
            .ok_or_else(|| DetectionError::Inference("frame buffer size mismatch".into()))?;
        let resized = if (frame.width, frame.height) == (in_w, in_h) {
            image
        } else {
            image::imageops::resize(&image, in_w, in_h, FilterType::Triangle)
        };

        let tensor = Tensor::from_slice(resized.as_raw())
            .to_device(self.device)
            .to_kind(Kind::Float)
            .view([1, in_h as i64, in_w as i64, 3])
            .permute([0, 3, 1, 2])
            / 255.0;
        Ok(tensor)
    }

    fn decode(&self, output: &Tensor, frame: &Frame) -> Result<Vec<Detection>, DetectionError> {
        let shape = output.size();
        if shape.len() != 3 || shape[0] != 1 || shape[1] < 5 {
            return Err(DetectionError::Inference(format!(
                "unexpected detector output shape: {shape:?}"
            )));
        }

        let preds = output
            .to_device(Device::Cpu)
            .to_kind(Kind::Float)
            .squeeze_dim(0)
            .permute([1, 0])
            .contiguous();
        let rows = Vec::<Vec<f32>>::try_from(&preds)
            .map_err(|err| DetectionError::Inference(err.to_string()))?;

        let (in_w, in_h) = self.input_size;
        let scale_x = frame.width as f32 / in_w as f32;
        let scale_y = frame.height as f32 / in_h as f32;

        let mut candidates = Vec::new();
        for row in rows {
            let scores = &row[4..];
            let Some((class, score)) = scores
                .iter()
                .copied()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(&b.1))
            else {
                continue;
            };
            if class != PERSON_CLASS || score < self.confidence_threshold {
                continue;
            }
            let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
            let bbox = BoundingBox::new(
                ((cx - w / 2.0) * scale_x).max(0.0),
                ((cy - h / 2.0) * scale_y).max(0.0),
                ((cx + w / 2.0) * scale_x).min(frame.width as f32),
                ((cy + h / 2.0) * scale_y).min(frame.height as f32),
            );
            candidates.push(Detection::new(PERSON_LABEL, score, bbox));
        }

        Ok(non_max_suppression(candidates, NMS_IOU_THRESHOLD))
    }
}

impl Detector for TorchDetector {
    fn name(&self) -> &str {
        "torchscript-yolo"
    }

    fn initialize(&mut self) -> Result<(), DetectorInitError> {
        if self.module.is_some() {
            return Ok(());
        }
        let module = CModule::load_on_device(&self.model_path, self.device).map_err(|err| {
            DetectorInitError::new(
                self.name(),
                format!("{}: {err}", self.model_path.display()),
            )
        })?;
        info!(
            model = %self.model_path.display(),
            device = ?self.device,
            "detector loaded"
        );
        self.module = Some(module);
        Ok(())
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectionError> {
        let Some(module) = self.module.as_ref() else {
            return Err(DetectionError::NotInitialised);
        };
        let input = self.frame_to_tensor(frame)?;
        let output = tch::no_grad(|| module.forward_ts(&[input]))
            .map_err(|err| DetectionError::Inference(err.to_string()))?;
        self.decode(&output, frame)
    }

    fn annotate(&mut self, frame: Frame, detections: &[Detection]) -> Frame {
        draw_detections(frame, detections)
    }

    fn release(&mut self) {
        if self.module.take().is_some() {
            debug!(model = %self.model_path.display(), "detector released");
        }
    }
}

/// Greedy NMS: keep the highest-confidence box and drop any remaining box that
/// overlaps it by more than `iou_threshold`.
pub fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Detection> = Vec::new();
    for det in detections {
        if kept.len() >= MAX_DETECTIONS {
            break;
        }
        if kept.iter().all(|k| k.bbox.iou(&det.bbox) <= iou_threshold) {
            kept.push(det);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nms_drops_overlapping_lower_scores() {
        let boxes = vec![
            Detection::new("person", 0.6, BoundingBox::new(0.0, 0.0, 10.0, 10.0)),
            Detection::new("person", 0.9, BoundingBox::new(1.0, 1.0, 11.0, 11.0)),
            Detection::new("person", 0.7, BoundingBox::new(50.0, 50.0, 60.0, 60.0)),
        ];
        let kept = non_max_suppression(boxes, NMS_IOU_THRESHOLD);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[1].confidence, 0.7);
    }

    #[test]
    fn decode_filters_other_classes_and_rescales() {
        let detector = TorchDetector::new("unused.pt", Device::Cpu, 0.5).with_input_size(100, 100);
        let frame = Frame::solid(200, 100, [0, 0, 0]);
        // Two predictions, two classes: [cx, cy, w, h, person, car].
        let data: Vec<f32> = vec![
            50.0, 20.0, // cx
            50.0, 20.0, // cy
            20.0, 10.0, // w
            20.0, 10.0, // h
            0.9, 0.1, // person
            0.05, 0.95, // car
        ];
        let output = Tensor::from_slice(&data).view([1, 6, 2]);
        let detections = detector.decode(&output, &frame).unwrap();
        assert_eq!(detections.len(), 1);
        let det = &detections[0];
        assert_eq!(det.label, "person");
        assert_eq!(det.bbox, BoundingBox::new(80.0, 40.0, 120.0, 60.0));
    }

    #[test]
    fn detect_before_initialize_fails() {
        let mut detector = TorchDetector::new("missing.pt", Device::Cpu, 0.5);
        let frame = Frame::solid(8, 8, [0, 0, 0]);
        assert!(matches!(
            detector.detect(&frame),
            Err(DetectionError::NotInitialised)
        ));
        assert!(detector.initialize().is_err());
    }
}
