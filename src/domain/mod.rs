//! Domain models - core tracking types and pure geometry
//!
//! - `geo` - Haversine distance, bearing, dead-reckoning projection
//! - `types` - Order/channel ids, location samples, delivery status
//! - `sample` - Validation and coercion of raw store payloads
//! - `error` - Error taxonomy shared by all services

pub mod error;
pub mod geo;
pub mod sample;
pub mod types;

pub use error::{DispatchError, GeoError, StoreError, TrackingError, TrackingResult};
pub use geo::Coordinate;
pub use types::{ChannelId, DeliveryStatus, LocationSample, OrderId, StatusEvent, VehicleClass};

use std::time::{SystemTime, UNIX_EPOCH};

/// Get current epoch milliseconds
#[inline]
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}
