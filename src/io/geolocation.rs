//! Device geolocation contract
//!
//! The geofence monitor consumes the local device's positions through
//! `GeolocationProvider`. `ChannelGeolocation` is an in-process provider
//! fed by a `PositionFeeder` handle (simulator, tests, or an adapter over a
//! platform location service).

use crate::domain::error::GeoError;
use crate::domain::geo;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Buffer for one position watch
const WATCH_BUFFER: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionState {
    Granted,
    Denied,
}

/// Requested fix quality; trades precision for battery on real devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Accuracy {
    #[default]
    High,
    Balanced,
    Low,
}

impl Accuracy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Accuracy::High => "high",
            Accuracy::Balanced => "balanced",
            Accuracy::Low => "low",
        }
    }
}

impl std::str::FromStr for Accuracy {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "balanced" | "medium" => Accuracy::Balanced,
            "low" | "coarse" => Accuracy::Low,
            _ => Accuracy::High,
        })
    }
}

/// Parameters for `watch_position`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WatchOptions {
    pub accuracy: Accuracy,
    pub min_interval_ms: u64,
    pub min_distance_m: f64,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self { accuracy: Accuracy::High, min_interval_ms: 5000, min_distance_m: 10.0 }
    }
}

/// One position reading from the device
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DevicePosition {
    pub lat: f64,
    pub lon: f64,
    pub speed_mps: f64,
    pub heading_deg: f64,
    pub accuracy_m: f64,
    pub timestamp_ms: u64,
}

impl DevicePosition {
    pub fn at(lat: f64, lon: f64, timestamp_ms: u64) -> Self {
        Self { lat, lon, speed_mps: 0.0, heading_deg: 0.0, accuracy_m: 10.0, timestamp_ms }
    }
}

#[async_trait]
pub trait GeolocationProvider: Send + Sync {
    async fn request_permission(&self) -> PermissionState;

    /// Start a position stream. Dropping the receiver ends the watch.
    async fn watch_position(
        &self,
        options: WatchOptions,
    ) -> Result<mpsc::Receiver<DevicePosition>, GeoError>;
}

struct Watcher {
    tx: mpsc::Sender<DevicePosition>,
    options: WatchOptions,
    last: Option<DevicePosition>,
}

impl Watcher {
    /// A position passes once either the interval or the distance filter is met
    fn accepts(&self, pos: &DevicePosition) -> bool {
        let Some(last) = self.last else { return true };
        let elapsed = pos.timestamp_ms.saturating_sub(last.timestamp_ms);
        let moved_m = geo::distance_km(last.lat, last.lon, pos.lat, pos.lon) * 1000.0;
        elapsed >= self.options.min_interval_ms || moved_m >= self.options.min_distance_m
    }
}

#[derive(Default)]
struct Shared {
    watchers: Mutex<Vec<Watcher>>,
    denied: AtomicBool,
}

/// In-process geolocation provider
#[derive(Clone, Default)]
pub struct ChannelGeolocation {
    shared: Arc<Shared>,
}

impl ChannelGeolocation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider whose permission prompt is always refused
    pub fn denied() -> Self {
        let provider = Self::default();
        provider.shared.denied.store(true, Ordering::Relaxed);
        provider
    }

    pub fn set_permission(&self, state: PermissionState) {
        self.shared.denied.store(state == PermissionState::Denied, Ordering::Relaxed);
    }

    /// Handle used to push device positions into all watches
    pub fn feeder(&self) -> PositionFeeder {
        PositionFeeder { shared: self.shared.clone() }
    }

    pub fn watcher_count(&self) -> usize {
        let mut watchers = self.shared.watchers.lock();
        watchers.retain(|w| !w.tx.is_closed());
        watchers.len()
    }
}

#[async_trait]
impl GeolocationProvider for ChannelGeolocation {
    async fn request_permission(&self) -> PermissionState {
        if self.shared.denied.load(Ordering::Relaxed) {
            PermissionState::Denied
        } else {
            PermissionState::Granted
        }
    }

    async fn watch_position(
        &self,
        options: WatchOptions,
    ) -> Result<mpsc::Receiver<DevicePosition>, GeoError> {
        if self.shared.denied.load(Ordering::Relaxed) {
            return Err(GeoError::PermissionDenied);
        }
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        self.shared.watchers.lock().push(Watcher { tx, options, last: None });
        Ok(rx)
    }
}

/// Pushes positions into a `ChannelGeolocation`
#[derive(Clone)]
pub struct PositionFeeder {
    shared: Arc<Shared>,
}

impl PositionFeeder {
    /// Offer a position to every watch; returns how many accepted it
    pub fn push(&self, pos: DevicePosition) -> usize {
        let mut accepted = 0;
        let mut watchers = self.shared.watchers.lock();
        watchers.retain_mut(|w| {
            if w.tx.is_closed() {
                return false;
            }
            if !w.accepts(&pos) {
                return true;
            }
            match w.tx.try_send(pos) {
                Ok(()) => {
                    w.last = Some(pos);
                    accepted += 1;
                }
                Err(e) => debug!(error = %e, "geolocation_position_dropped"),
            }
            true
        });
        accepted
    }
}
