use std::fmt;

use actix_web::web::Bytes;
use ml_core::Detection;
use serde::Serialize;
use video_ingest::Frame;

/// Lifecycle of one pipeline run as seen by consumers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    #[default]
    Created,
    Initialized,
    Running,
    Stopped,
    Errored,
}

impl PipelineStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineStatus::Created => "created",
            PipelineStatus::Initialized => "initialized",
            PipelineStatus::Running => "running",
            PipelineStatus::Stopped => "stopped",
            PipelineStatus::Errored => "errored",
        }
    }

    /// No further publications will happen in this run.
    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineStatus::Stopped | PipelineStatus::Errored)
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One published cycle. Immutable once handed to the feed; consumers share it
/// through an `Arc`.
#[derive(Debug, Clone)]
pub struct PublishedState {
    /// Starts at 1 for every run and grows by exactly one per publication.
    pub sequence: u64,
    /// Run this state belongs to.
    pub epoch: u64,
    pub timestamp_ms: i64,
    /// Rolling frames-per-second, absent until two publications exist.
    pub fps: Option<f32>,
    pub frame: Frame,
    pub detections: Vec<Detection>,
    /// JPEG encoding of `frame`, absent if encoding failed for this cycle.
    pub jpeg: Option<Bytes>,
}
