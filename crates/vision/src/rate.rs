use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

/// Number of inter-publication intervals averaged by the estimate.
pub const FPS_WINDOW: usize = 30;

/// Period of a `fps` rate, or `None` when the rate is not positive or the
/// period does not fit a `Duration`.
pub fn frame_interval(fps: f32) -> Option<Duration> {
    if fps.is_nan() || fps <= 0.0 {
        return None;
    }
    Duration::try_from_secs_f32(fps.recip()).ok()
}

/// Sliding-window frame-rate estimate over the last `window` publications.
#[derive(Debug, Clone)]
pub struct FrameRateMeter {
    window: usize,
    stamps: VecDeque<Instant>,
}

impl Default for FrameRateMeter {
    fn default() -> Self {
        Self::new(FPS_WINDOW)
    }
}

impl FrameRateMeter {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            stamps: VecDeque::with_capacity(window + 1),
        }
    }

    /// Record a publication at `at` and return the refreshed estimate.
    pub fn record(&mut self, at: Instant) -> Option<f32> {
        self.stamps.push_back(at);
        while self.stamps.len() > self.window + 1 {
            self.stamps.pop_front();
        }
        self.estimate()
    }

    /// Frames per second, or `None` until two publications exist.
    pub fn estimate(&self) -> Option<f32> {
        let (first, last) = (self.stamps.front()?, self.stamps.back()?);
        let intervals = self.stamps.len().checked_sub(1).filter(|n| *n > 0)?;
        let span = last.duration_since(*first).as_secs_f32();
        if span <= 0.0 {
            return None;
        }
        Some(intervals as f32 / span)
    }

    pub fn reset(&mut self) {
        self.stamps.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_interval_rejects_unrepresentable_rates() {
        assert_eq!(frame_interval(50.0), Some(Duration::from_millis(20)));
        assert_eq!(frame_interval(0.0), None);
        assert_eq!(frame_interval(-5.0), None);
        assert_eq!(frame_interval(f32::NAN), None);
        assert_eq!(frame_interval(1e-30), None);
    }

    #[test]
    fn unknown_until_two_publications() {
        let mut meter = FrameRateMeter::default();
        let start = Instant::now();
        assert_eq!(meter.record(start), None);
        let fps = meter.record(start + Duration::from_millis(100)).unwrap();
        assert!((fps - 10.0).abs() < 0.01);
    }

    #[test]
    fn converges_to_fixed_interval() {
        let mut meter = FrameRateMeter::default();
        let start = Instant::now();
        let mut fps = None;
        for i in 0..(FPS_WINDOW as u64 * 2) {
            fps = meter.record(start + Duration::from_millis(40 * i));
        }
        assert!((fps.unwrap() - 25.0).abs() < 0.05);
    }

    #[test]
    fn window_forgets_old_intervals() {
        let mut meter = FrameRateMeter::new(4);
        let start = Instant::now();
        let mut t = start;
        for _ in 0..5 {
            t += Duration::from_secs(1);
            meter.record(t);
        }
        for _ in 0..4 {
            t += Duration::from_millis(100);
            meter.record(t);
        }
        assert!((meter.estimate().unwrap() - 10.0).abs() < 0.01);
    }

    #[test]
    fn reset_clears_history() {
        let mut meter = FrameRateMeter::default();
        let start = Instant::now();
        meter.record(start);
        meter.record(start + Duration::from_millis(10));
        meter.reset();
        assert_eq!(meter.estimate(), None);
    }
}
