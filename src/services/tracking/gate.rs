//! Per-session delivery gate
//!
//! A location reaches the sink only when it passes both checks:
//! - freshness: it moved more than `epsilon_deg` on some axis since the
//!   last delivered sample
//! - throttle: at least `min_interval` elapsed since the last delivery
//!
//! The first sample of a session always passes. Statuses bypass the
//! throttle and are only deduplicated against the last delivered payload.

use crate::domain::types::LocationSample;
use serde_json::Value;
use tokio::time::{Duration, Instant};

/// Outcome of offering a location to the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Deliver,
    /// Near-duplicate of the last delivered position
    Stale,
    /// Inside the throttle window
    Throttled,
}

#[derive(Debug)]
pub struct DeliveryGate {
    min_interval: Duration,
    epsilon_deg: f64,
    last_sample: Option<LocationSample>,
    last_delivered_at: Option<Instant>,
    last_status: Option<Value>,
}

impl DeliveryGate {
    pub fn new(min_interval: Duration, epsilon_deg: f64) -> Self {
        Self {
            min_interval,
            epsilon_deg,
            last_sample: None,
            last_delivered_at: None,
            last_status: None,
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Decide whether `sample` may be delivered at `now`
    pub fn check_location(&self, sample: &LocationSample, now: Instant) -> GateDecision {
        let (Some(last), Some(at)) = (&self.last_sample, self.last_delivered_at) else {
            return GateDecision::Deliver;
        };
        if !sample.differs_from(last, self.epsilon_deg) {
            return GateDecision::Stale;
        }
        if now.saturating_duration_since(at) < self.min_interval {
            return GateDecision::Throttled;
        }
        GateDecision::Deliver
    }

    /// Record a delivered sample
    pub fn commit_location(&mut self, sample: LocationSample, now: Instant) {
        self.last_sample = Some(sample);
        self.last_delivered_at = Some(now);
    }

    /// True if `raw` differs from the last delivered status payload
    pub fn status_changed(&self, raw: &Value) -> bool {
        self.last_status.as_ref() != Some(raw)
    }

    pub fn commit_status(&mut self, raw: Value) {
        self.last_status = Some(raw);
    }

    pub fn last_sample(&self) -> Option<&LocationSample> {
        self.last_sample.as_ref()
    }
}
