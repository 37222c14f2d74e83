//! Services - business logic and state management
//!
//! This module contains the core services:
//! - `eta` - Distance/ETA estimation with bounded caches
//! - `channel_mapper` - Order id <-> store channel id correlation
//! - `tracking` - Per-order tracking sessions with throttled delivery
//! - `geofence` - Staged proximity notifications for the local device

pub mod channel_mapper;
pub mod eta;
pub mod geofence;
pub mod tracking;

// Re-export commonly used types
pub use channel_mapper::OrderChannelMapper;
pub use eta::{EtaEstimate, EtaEstimator, ProximityStatus};
pub use geofence::{GeofenceMonitor, GeofenceSettings};
pub use tracking::{SessionHandle, SessionOptions, SessionState, TrackingService};
