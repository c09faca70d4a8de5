//! Single-producer, many-consumer handoff of published states.
//!
//! The pipeline owns a [`FramePublisher`] and swaps whole [`PublishedState`]
//! snapshots into a `tokio::sync::watch` slot. Each viewer holds its own
//! [`Subscription`] and waits for a sequence newer than the last one it saw.
//! Slow viewers skip intermediate states instead of holding up the producer.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;

use crate::data::{PipelineStatus, PublishedState};

/// Contents of the shared slot.
#[derive(Debug, Clone, Default)]
pub struct FeedState {
    /// Bumped each time a pipeline run initializes. Zero before the first run.
    pub epoch: u64,
    pub status: PipelineStatus,
    /// Reason for the last `Errored` transition.
    pub error: Option<String>,
    pub latest: Option<Arc<PublishedState>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    #[error("pipeline stopped")]
    Stopped,
    #[error("pipeline failed: {reason}")]
    Halted { reason: String },
    #[error("pipeline restarted; sequence numbers were reset")]
    Restarted,
    #[error("publisher dropped")]
    Closed,
}

/// Create a connected publisher/feed pair.
pub fn channel() -> (FramePublisher, FrameFeed) {
    let (tx, rx) = watch::channel(FeedState::default());
    (FramePublisher { tx: Arc::new(tx) }, FrameFeed { rx })
}

/// Write side of the feed. Cloned into each pipeline run.
#[derive(Debug, Clone)]
pub struct FramePublisher {
    tx: Arc<watch::Sender<FeedState>>,
}

impl FramePublisher {
    /// Start a new run: new epoch, no current state.
    pub fn begin_run(&self) -> u64 {
        let mut epoch = 0;
        self.tx.send_modify(|state| {
            state.epoch += 1;
            state.status = PipelineStatus::Initialized;
            state.error = None;
            state.latest = None;
            epoch = state.epoch;
        });
        epoch
    }

    pub fn set_status(&self, status: PipelineStatus) {
        self.tx.send_if_modified(|state| {
            let changed = state.status != status;
            state.status = status;
            changed
        });
    }

    /// Mark the current run as failed.
    pub fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.tx.send_modify(|state| {
            state.status = PipelineStatus::Errored;
            state.error = Some(reason);
        });
    }

    /// Replace the current state and wake every waiting consumer.
    pub fn publish(&self, published: Arc<PublishedState>) {
        self.tx.send_modify(|state| {
            state.latest = Some(published);
        });
    }

    pub fn feed(&self) -> FrameFeed {
        FrameFeed {
            rx: self.tx.subscribe(),
        }
    }
}

/// Read side of the feed. Cheap to clone; each clone reads the same slot.
#[derive(Debug, Clone)]
pub struct FrameFeed {
    rx: watch::Receiver<FeedState>,
}

impl FrameFeed {
    pub fn snapshot(&self) -> FeedState {
        self.rx.borrow().clone()
    }

    pub fn latest(&self) -> Option<Arc<PublishedState>> {
        self.rx.borrow().latest.clone()
    }

    pub fn status(&self) -> PipelineStatus {
        self.rx.borrow().status
    }

    /// New consumer positioned before the first state, so the current state
    /// (if any) is delivered right away.
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.rx.clone(),
            epoch: None,
            cursor: 0,
        }
    }
}

/// One consumer's view of the feed.
#[derive(Debug)]
pub struct Subscription {
    rx: watch::Receiver<FeedState>,
    epoch: Option<u64>,
    cursor: u64,
}

impl Subscription {
    /// Wait for a state with `sequence > after` and return the latest one.
    ///
    /// Suspends only this consumer. A subscription stays bound to the run it
    /// first observed and reports [`FeedError::Restarted`] once a newer run
    /// begins, since sequences restart at 1. Cancel-safe.
    pub async fn next_published_state(
        &mut self,
        after: u64,
    ) -> Result<Arc<PublishedState>, FeedError> {
        loop {
            {
                let state = self.rx.borrow_and_update();
                if state.epoch != 0 {
                    match self.epoch {
                        None => self.epoch = Some(state.epoch),
                        Some(bound) if bound != state.epoch => return Err(FeedError::Restarted),
                        Some(_) => {}
                    }
                }
                if let Some(latest) = state.latest.as_ref() {
                    if latest.sequence > after {
                        self.cursor = latest.sequence;
                        return Ok(Arc::clone(latest));
                    }
                }
                match state.status {
                    PipelineStatus::Stopped => return Err(FeedError::Stopped),
                    PipelineStatus::Errored => {
                        return Err(FeedError::Halted {
                            reason: state.error.clone().unwrap_or_default(),
                        });
                    }
                    _ => {}
                }
            }
            if self.rx.changed().await.is_err() {
                return Err(FeedError::Closed);
            }
        }
    }

    /// Next state after the last one this subscription returned.
    pub async fn next(&mut self) -> Result<Arc<PublishedState>, FeedError> {
        self.next_published_state(self.cursor).await
    }

    /// Last sequence returned, zero before the first.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }
}
