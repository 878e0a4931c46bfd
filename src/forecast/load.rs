use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::VecDeque;

/// Floor applied to a rolling average; a near-zero average is a metering gap, not a real house.
const MIN_AVERAGE_KW: f64 = 0.3;
/// Without history, scale the instantaneous reading up and never go below this.
const FALLBACK_SCALE: f64 = 1.1;
const MIN_FALLBACK_KW: f64 = 0.5;

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct LoadEstimate {
    pub kw: f64,
    pub samples: usize,
    pub from_history: bool,
}

/// Rolling average of home power draw over a fixed window (about two hours).
#[derive(Debug, Clone)]
pub struct LoadEstimator {
    window: Duration,
    samples: VecDeque<(DateTime<Utc>, f64)>,
}

impl LoadEstimator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    pub fn two_hour() -> Self {
        Self::new(Duration::hours(2))
    }

    /// Record a home power sample in watts. Negative and non-finite readings are dropped.
    pub fn record(&mut self, at: DateTime<Utc>, watts: f64) {
        if !watts.is_finite() || watts < 0.0 {
            return;
        }
        // Samples arrive in tick order; a clock step backwards restarts the window.
        if self.samples.back().map_or(false, |(t, _)| *t > at) {
            self.samples.clear();
        }
        self.samples.push_back((at, watts));
        self.prune(at);
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.window;
        while self.samples.front().map_or(false, |(t, _)| *t < cutoff) {
            self.samples.pop_front();
        }
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Mean of samples inside the window ending at `now`, in kW.
    pub fn rolling_average_kw(&self, now: DateTime<Utc>) -> Option<f64> {
        let cutoff = now - self.window;
        let (sum, n) = self
            .samples
            .iter()
            .filter(|(t, _)| *t >= cutoff && *t <= now)
            .fold((0.0, 0usize), |(sum, n), (_, w)| (sum + w, n + 1));
        (n > 0).then(|| sum / n as f64 / 1000.0)
    }

    /// Best-effort home load. Never fails: with no usable history the current
    /// reading is padded and floored instead.
    pub fn estimate(&self, now: DateTime<Utc>, current_watts: f64) -> LoadEstimate {
        match self.rolling_average_kw(now) {
            Some(avg) if avg > 0.0 => LoadEstimate {
                kw: avg.max(MIN_AVERAGE_KW),
                samples: self.samples.len(),
                from_history: true,
            },
            _ => LoadEstimate {
                kw: (current_watts.max(0.0) / 1000.0 * FALLBACK_SCALE).max(MIN_FALLBACK_KW),
                samples: 0,
                from_history: false,
            },
        }
    }
}

impl Default for LoadEstimator {
    fn default() -> Self {
        Self::two_hour()
    }
}
