//! Distance and ETA estimation with an adaptive speed model
//!
//! Results are memoised in two process-wide bounded caches. Cache keys are
//! quantized inputs and values are computed from those same quantized
//! inputs, so repeated calls are idempotent.

use crate::domain::geo;
use crate::domain::types::{LocationSample, VehicleClass};
use crate::infra::cache::BoundedCache;
use serde::Serialize;

/// Default distance cache capacity
pub const DISTANCE_CACHE_CAPACITY: usize = 100;
/// Default ETA cache capacity
pub const ETA_CACHE_CAPACITY: usize = 50;

/// Inputs are rounded to 6 decimal places before lookup
const QUANTUM: f64 = 1_000_000.0;

/// Reported speeds below this are treated as "no reading"
const MIN_OBSERVED_SPEED_KMH: f64 = 1.0;
/// Floor applied after adjustment to avoid division blow-up
const MIN_ADJUSTED_SPEED_KMH: f64 = 2.0;

#[inline]
fn quantize(v: f64) -> i64 {
    (v * QUANTUM).round() as i64
}

#[inline]
fn dequantize(q: i64) -> f64 {
    q as f64 / QUANTUM
}

type DistanceKey = [i64; 4];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct EtaKey {
    distance: i64,
    /// `None` when no usable speed was observed
    speed: Option<i64>,
    vehicle: VehicleClass,
}

/// Time estimate for a remaining distance
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EtaEstimate {
    /// Whole minutes, rounded up
    pub minutes: u32,
    pub seconds: u64,
    /// Speed after the adjustment policy, km/h
    pub speed_used_kmh: f64,
}

/// Coarse proximity label derived from distance and speed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProximityStatus {
    Arrived,
    AlmostArrived,
    Nearby,
    InNeighborhood,
    Waiting,
    FastTransit,
    InTransit,
    Moving,
}

impl ProximityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProximityStatus::Arrived => "arrived",
            ProximityStatus::AlmostArrived => "almost_arrived",
            ProximityStatus::Nearby => "nearby",
            ProximityStatus::InNeighborhood => "in_neighborhood",
            ProximityStatus::Waiting => "waiting",
            ProximityStatus::FastTransit => "fast_transit",
            ProximityStatus::InTransit => "in_transit",
            ProximityStatus::Moving => "moving",
        }
    }
}

impl std::fmt::Display for ProximityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Apply the distance-dependent speed correction.
///
/// Short remaining legs are slowed for parking and building access, long
/// legs for fatigue and traffic variance.
pub fn adjust_speed(distance_km: f64, speed_kmh: f64) -> f64 {
    let factor = if distance_km < 0.5 {
        0.6
    } else if distance_km < 1.0 {
        0.8
    } else if distance_km > 10.0 {
        0.9
    } else {
        1.0
    };
    (speed_kmh * factor).max(MIN_ADJUSTED_SPEED_KMH)
}

/// Derive a proximity label. Distance rules take precedence over speed rules.
pub fn derive_status(distance_m: f64, speed_kmh: f64) -> ProximityStatus {
    if distance_m < 10.0 {
        ProximityStatus::Arrived
    } else if distance_m < 50.0 {
        ProximityStatus::AlmostArrived
    } else if distance_m < 200.0 {
        ProximityStatus::Nearby
    } else if distance_m < 500.0 {
        ProximityStatus::InNeighborhood
    } else if speed_kmh < 2.0 && distance_m > 100.0 {
        ProximityStatus::Waiting
    } else if speed_kmh > 30.0 {
        ProximityStatus::FastTransit
    } else if speed_kmh > 15.0 {
        ProximityStatus::InTransit
    } else {
        ProximityStatus::Moving
    }
}

/// Shared distance/ETA calculator
pub struct EtaEstimator {
    distance_cache: BoundedCache<DistanceKey, f64>,
    eta_cache: BoundedCache<EtaKey, EtaEstimate>,
}

impl Default for EtaEstimator {
    fn default() -> Self {
        Self::new(DISTANCE_CACHE_CAPACITY, ETA_CACHE_CAPACITY)
    }
}

impl EtaEstimator {
    pub fn new(distance_capacity: usize, eta_capacity: usize) -> Self {
        Self {
            distance_cache: BoundedCache::new(distance_capacity),
            eta_cache: BoundedCache::new(eta_capacity),
        }
    }

    /// Cached Haversine distance in kilometers.
    ///
    /// Non-finite inputs bypass the cache and yield NaN.
    pub fn distance_km(&self, lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
        if ![lat1, lon1, lat2, lon2].iter().all(|v| v.is_finite()) {
            return f64::NAN;
        }
        let key = [quantize(lat1), quantize(lon1), quantize(lat2), quantize(lon2)];
        self.distance_cache.get_or_insert_with(key, || {
            geo::distance_km(
                dequantize(key[0]),
                dequantize(key[1]),
                dequantize(key[2]),
                dequantize(key[3]),
            )
        })
    }

    /// Estimate travel time for `distance_km`.
    ///
    /// A missing or sub-1 km/h observed speed falls back to the vehicle
    /// class average before the adjustment policy is applied.
    pub fn estimate_time(
        &self,
        distance_km: f64,
        current_speed_kmh: Option<f64>,
        vehicle: VehicleClass,
    ) -> EtaEstimate {
        let distance = if distance_km.is_finite() { distance_km.max(0.0) } else { 0.0 };
        let observed =
            current_speed_kmh.filter(|s| s.is_finite() && *s >= MIN_OBSERVED_SPEED_KMH);
        let key = EtaKey {
            distance: quantize(distance),
            speed: observed.map(quantize),
            vehicle,
        };

        self.eta_cache.get_or_insert_with(key, || {
            let distance = dequantize(key.distance);
            let base = key.speed.map(dequantize).unwrap_or_else(|| vehicle.average_speed_kmh());
            let speed_used_kmh = adjust_speed(distance, base);
            let hours = distance / speed_used_kmh;
            EtaEstimate {
                minutes: (hours * 60.0).ceil() as u32,
                seconds: (hours * 3600.0).round() as u64,
                speed_used_kmh,
            }
        })
    }

    /// Average ground speed in km/h over a position history.
    ///
    /// Sums pairwise distances and divides by the wall-clock span between
    /// the first and last sample. Returns 0 for fewer than two samples or a
    /// zero span.
    pub fn average_speed(&self, history: &[LocationSample]) -> f64 {
        let (Some(first), Some(last)) = (history.first(), history.last()) else {
            return 0.0;
        };
        if history.len() < 2 {
            return 0.0;
        }
        let elapsed_ms = last.timestamp_ms.saturating_sub(first.timestamp_ms);
        if elapsed_ms == 0 {
            return 0.0;
        }

        let total_km: f64 = history
            .windows(2)
            .map(|w| self.distance_km(w[0].latitude, w[0].longitude, w[1].latitude, w[1].longitude))
            .sum();

        total_km / (elapsed_ms as f64 / 3_600_000.0)
    }

    /// Proximity label for a distance in meters and a speed in km/h
    #[inline]
    pub fn derive_status(&self, distance_m: f64, speed_kmh: f64) -> ProximityStatus {
        derive_status(distance_m, speed_kmh)
    }

    pub fn distance_cache_len(&self) -> usize {
        self.distance_cache.len()
    }

    pub fn eta_cache_len(&self) -> usize {
        self.eta_cache.len()
    }
}
