//! Frame pipeline and streaming core.
//!
//! A [`Pipeline`] runs on one blocking thread, pulling frames from a
//! [`video_ingest::FrameSource`] through an [`ml_core::Detector`] and
//! publishing each result as an immutable [`PublishedState`]. Any number of
//! async viewers follow the [`FrameFeed`] at their own pace; the [`server`]
//! module exposes it over HTTP.

pub mod config;
pub mod data;
pub mod encoding;
pub mod feed;
pub mod pipeline;
pub mod rate;
pub mod server;
pub mod status;
pub mod telemetry;

pub use config::{Acceleration, SettingsSnapshot, SourceSelection, StreamCliArgs, StreamConfig};
pub use data::{PipelineStatus, PublishedState};
pub use feed::{FeedError, FeedState, FrameFeed, FramePublisher, Subscription};
pub use pipeline::{
    InitError, Pipeline, PipelineError, PipelineExit, PipelineHandle, PipelineOptions, spawn,
};
pub use server::{StreamServer, spawn_stream_server};
