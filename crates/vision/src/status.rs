//! JSON projections served by the status endpoints. Pure reads of the current
//! feed snapshot.

use ml_core::Detection;
use serde::Serialize;

use crate::{
    data::{PipelineStatus, PublishedState},
    feed::FeedState,
};

#[derive(Debug, Serialize)]
pub struct DetectionsResponse<'a> {
    pub sequence: u64,
    pub timestamp_ms: i64,
    pub fps: Option<f32>,
    pub detections: &'a [Detection],
}

impl<'a> From<&'a PublishedState> for DetectionsResponse<'a> {
    fn from(state: &'a PublishedState) -> Self {
        Self {
            sequence: state.sequence,
            timestamp_ms: state.timestamp_ms,
            fps: state.fps,
            detections: &state.detections,
        }
    }
}

#[derive(Debug, PartialEq, Serialize)]
pub struct FpsResponse {
    pub fps: Option<f32>,
    pub sequence: u64,
}

impl FpsResponse {
    pub fn of(state: Option<&PublishedState>) -> Self {
        match state {
            Some(state) => Self {
                fps: state.fps,
                sequence: state.sequence,
            },
            None => Self {
                fps: None,
                sequence: 0,
            },
        }
    }
}

#[derive(Debug, PartialEq, Serialize)]
pub struct StatusResponse {
    pub status: PipelineStatus,
    pub epoch: u64,
    pub sequence: Option<u64>,
    pub fps: Option<f32>,
    pub detections: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&FeedState> for StatusResponse {
    fn from(state: &FeedState) -> Self {
        let latest = state.latest.as_deref();
        Self {
            status: state.status,
            epoch: state.epoch,
            sequence: latest.map(|s| s.sequence),
            fps: latest.and_then(|s| s.fps),
            detections: latest.map_or(0, |s| s.detections.len()),
            error: state.error.clone(),
        }
    }
}
