use chrono::Utc;
use std::sync::{
    Arc,
    Mutex,
    PoisonError,
};
use tracing::debug;

/// Source of local wall-clock time, in fractional unix seconds.
pub trait TimeSource: Send + Sync {
    fn now(&self) -> f64;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemTime;

impl TimeSource for SystemTime {
    fn now(&self) -> f64 {
        Utc::now().timestamp_micros() as f64 / 1_000_000.0
    }
}

/// Hand-driven clock for replays and tests.
#[derive(Clone, Debug, Default)]
pub struct ManualTime {
    now: Arc<Mutex<f64>>,
}

impl ManualTime {
    pub fn starting_at(t: f64) -> Self {
        Self {
            now: Arc::new(Mutex::new(t)),
        }
    }

    pub fn set(&self, t: f64) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = t;
    }

    pub fn advance(&self, secs: f64) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) += secs;
    }
}

impl TimeSource for ManualTime {
    fn now(&self) -> f64 {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ServerTimeSample {
    pub server_timestamp: f64,
    pub local_timestamp_at_sample: f64,
}

/// Estimate of authoritative time built from the most recent server sample.
#[derive(Clone)]
pub struct ClockSync {
    source: Arc<dyn TimeSource>,
    latest: Option<ServerTimeSample>,
}

impl ClockSync {
    pub fn new(source: Arc<dyn TimeSource>) -> Self {
        Self {
            source,
            latest: None,
        }
    }

    /// Stores `sample` unless it was taken before the one already held.
    /// Returns whether the sample was kept.
    pub fn record(&mut self, sample: ServerTimeSample) -> bool {
        if let Some(current) = self.latest
            && sample.local_timestamp_at_sample < current.local_timestamp_at_sample
        {
            debug!(
                stale = sample.local_timestamp_at_sample,
                held = current.local_timestamp_at_sample,
                "discarding out-of-order server time sample"
            );
            return false;
        }
        self.latest = Some(sample);
        true
    }

    pub fn local_now(&self) -> f64 {
        self.source.now()
    }

    pub fn now(&self) -> f64 {
        self.estimate_at(self.local_now())
    }

    pub fn estimate_at(&self, local_now: f64) -> f64 {
        match self.latest {
            Some(sample) => {
                sample.server_timestamp + (local_now - sample.local_timestamp_at_sample)
            }
            None => local_now,
        }
    }

    /// Server minus local, if any sample has been recorded.
    pub fn offset(&self) -> Option<f64> {
        self.latest
            .map(|s| s.server_timestamp - s.local_timestamp_at_sample)
    }

    pub fn latest(&self) -> Option<ServerTimeSample> {
        self.latest
    }
}

impl std::fmt::Debug for ClockSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClockSync")
            .field("latest", &self.latest)
            .finish_non_exhaustive()
    }
}
