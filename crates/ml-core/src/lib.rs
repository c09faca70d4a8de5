//! Detection contract shared by the streaming pipeline and its detectors.
//!
//! The pipeline only knows [`Detector`]; concrete detectors (the TorchScript
//! model behind `with-tch`, [`NullDetector`]) and decorators such as
//! [`LocationTagger`] plug in behind it.

pub mod annotation;
pub mod detector;
pub mod location;
#[cfg(feature = "with-tch")]
pub mod torch;

pub use detector::{
    BoundingBox, Detection, DetectionError, Detector, DetectorInitError, NullDetector,
};
pub use location::LocationTagger;
#[cfg(feature = "with-tch")]
pub use torch::{TorchDetector, tch};
