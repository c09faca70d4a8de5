//! Frame sources feeding the streaming pipeline.
//!
//! Every source implements [`FrameSource`]: `open`, a blocking `read_frame`,
//! and an idempotent `close`. [`LoopingSource`] replays a prerecorded reel
//! forever; [`CameraSource`] (feature `opencv`) reads a live device.

#[cfg(feature = "opencv")]
mod camera;
mod looping;
mod types;

#[cfg(feature = "opencv")]
pub use camera::CameraSource;
pub use looping::{LoopingSource, Reel};
pub use types::{Frame, FrameError, FrameFormat, FrameSource, SourceError};
