//! Frame timing instrumentation.
//!
//! Each frame is split into three phases: blocked in the frame wait,
//! begin through the last view release, and the end call. Missed frames
//! are counted against the runtime's predicted display period; the wait
//! is pacing, not work, so it never makes a frame late.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

/// Default window: about ten seconds at 90 Hz.
const DEFAULT_WINDOW: usize = 900;
/// 90 Hz until the runtime reports its own period.
const DEFAULT_PERIOD: Duration = Duration::from_nanos(11_111_111);

/// Durations of one frame's phases.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FramePhases {
    pub wait: Duration,
    pub render: Duration,
    pub submit: Duration,
}

impl FramePhases {
    /// Time the application spent working on the frame.
    pub fn work(&self) -> Duration {
        self.render + self.submit
    }
}

/// Bounded FIFO of samples, in milliseconds.
#[derive(Debug, Clone)]
struct SampleWindow {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl SampleWindow {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    fn push(&mut self, sample: Duration) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample.as_secs_f64() * 1000.0);
    }

    fn len(&self) -> usize {
        self.samples.len()
    }

    /// Nearest-rank percentiles, `ranks` in 0..=100.
    fn percentiles<const N: usize>(&self, ranks: [f64; N]) -> [f64; N] {
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        ranks.map(|rank| {
            if sorted.is_empty() {
                return 0.0;
            }
            let last = sorted.len() - 1;
            let at = (rank / 100.0 * last as f64).round() as usize;
            sorted[at.min(last)]
        })
    }
}

#[derive(Debug, Clone)]
pub struct FrameTiming {
    wait: SampleWindow,
    render: SampleWindow,
    submit: SampleWindow,
    frame: SampleWindow,
    display_period: Duration,
    frames: u64,
    late: u64,
}

impl Default for FrameTiming {
    fn default() -> Self {
        Self::with_window(DEFAULT_WINDOW)
    }
}

impl FrameTiming {
    pub fn with_window(window: usize) -> Self {
        Self {
            wait: SampleWindow::new(window),
            render: SampleWindow::new(window),
            submit: SampleWindow::new(window),
            frame: SampleWindow::new(window),
            display_period: DEFAULT_PERIOD,
            frames: 0,
            late: 0,
        }
    }

    /// Follow the runtime's display period. Non-positive periods are ignored.
    pub fn set_display_period_ns(&mut self, period_ns: i64) {
        if let Ok(ns) = u64::try_from(period_ns) {
            if ns > 0 {
                self.display_period = Duration::from_nanos(ns);
            }
        }
    }

    pub fn display_period(&self) -> Duration {
        self.display_period
    }

    pub fn record_frame(&mut self, phases: FramePhases) {
        self.wait.push(phases.wait);
        self.render.push(phases.render);
        self.submit.push(phases.submit);
        self.frame.push(phases.wait + phases.work());
        self.frames += 1;
        if phases.work() > self.display_period {
            self.late += 1;
        }
    }

    /// Samples currently held per phase.
    pub fn window_len(&self) -> usize {
        self.frame.len()
    }

    pub fn stats(&self) -> FrameTimingStats {
        let [wait_p50, wait_p99] = self.wait.percentiles([50.0, 99.0]);
        let [render_p50, render_p99] = self.render.percentiles([50.0, 99.0]);
        let [submit_p50, submit_p99] = self.submit.percentiles([50.0, 99.0]);
        let [frame_p50, frame_p99] = self.frame.percentiles([50.0, 99.0]);

        FrameTimingStats {
            wait_p50,
            wait_p99,
            render_p50,
            render_p99,
            submit_p50,
            submit_p99,
            frame_p50,
            frame_p99,
            fps: if frame_p50 > 0.0 { 1000.0 / frame_p50 } else { 0.0 },
            total_frames: self.frames,
            missed_frames: self.late,
        }
    }
}

/// Snapshot of the window. Durations in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameTimingStats {
    pub wait_p50: f64,
    pub wait_p99: f64,
    pub render_p50: f64,
    pub render_p99: f64,
    pub submit_p50: f64,
    pub submit_p99: f64,
    pub frame_p50: f64,
    pub frame_p99: f64,
    pub fps: f64,
    pub total_frames: u64,
    pub missed_frames: u64,
}

impl FrameTimingStats {
    pub fn missed_pct(&self) -> f64 {
        match self.total_frames {
            0 => 0.0,
            n => self.missed_frames as f64 * 100.0 / n as f64,
        }
    }
}

impl fmt::Display for FrameTimingStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} frames, {:.0} fps, wait p50 {:.1}ms, render p50/p99 {:.1}/{:.1}ms, submit p50 {:.1}ms, missed {} ({:.1}%)",
            self.total_frames,
            self.fps,
            self.wait_p50,
            self.render_p50,
            self.render_p99,
            self.submit_p50,
            self.missed_frames,
            self.missed_pct(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn phases(wait: u64, render: u64, submit: u64) -> FramePhases {
        FramePhases {
            wait: ms(wait),
            render: ms(render),
            submit: ms(submit),
        }
    }

    #[test]
    fn test_no_frames_yet() {
        let stats = FrameTiming::default().stats();
        assert_eq!(stats.total_frames, 0);
        assert_eq!(stats.fps, 0.0);
        assert_eq!(stats.missed_pct(), 0.0);
    }

    #[test]
    fn test_frame_time_sums_phases() {
        let mut timing = FrameTiming::default();
        timing.record_frame(phases(4, 5, 1));
        let stats = timing.stats();
        assert!((stats.frame_p50 - 10.0).abs() < 1e-9);
        assert!((stats.fps - 100.0).abs() < 1e-9);
        assert_eq!(stats.missed_frames, 0);
    }

    #[test]
    fn test_long_wait_is_not_late() {
        let mut timing = FrameTiming::default();
        timing.record_frame(phases(30, 2, 1));
        timing.record_frame(phases(0, 10, 4));
        let stats = timing.stats();
        assert_eq!(stats.total_frames, 2);
        assert_eq!(stats.missed_frames, 1);
        assert!((stats.missed_pct() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_display_period_moves_budget() {
        let mut timing = FrameTiming::default();
        timing.set_display_period_ns(16_666_666);
        timing.record_frame(phases(0, 14, 1));
        assert_eq!(timing.stats().missed_frames, 0);

        timing.set_display_period_ns(-1);
        timing.set_display_period_ns(0);
        assert_eq!(timing.display_period(), Duration::from_nanos(16_666_666));
    }

    #[test]
    fn test_window_keeps_newest_samples() {
        let mut timing = FrameTiming::with_window(4);
        for wait in 1..=8 {
            timing.record_frame(phases(wait, 1, 0));
        }
        assert_eq!(timing.window_len(), 4);
        let stats = timing.stats();
        assert_eq!(stats.total_frames, 8);
        // Window holds waits 5..=8.
        assert!((stats.wait_p99 - 8.0).abs() < 1e-9);
        assert!((stats.wait_p50 - 7.0).abs() < 1e-9);
    }

    #[test]
    fn test_summary_line() {
        let mut timing = FrameTiming::default();
        timing.record_frame(phases(2, 3, 1));
        let line = timing.stats().to_string();
        assert!(line.starts_with("1 frames"));
        assert!(line.contains("missed 0 (0.0%)"));
    }
}
