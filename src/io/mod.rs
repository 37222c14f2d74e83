//! IO modules - external system interfaces
//!
//! This module contains all external IO contracts and their adapters:
//! - `store` - Real-time store contract and connectivity probe
//! - `memory_store` - In-process store (simulator, tests)
//! - `mqtt_store` - Store client over an MQTT broker
//! - `geolocation` - Device position provider contract
//! - `dispatcher` - Notification dispatcher contract
//! - `sink` - Tracking events delivered to the application
//! - `mapping_storage` - Durable order -> channel table

pub mod dispatcher;
pub mod geolocation;
pub mod mapping_storage;
pub mod memory_store;
pub mod mqtt_store;
pub mod sink;
pub mod store;

// Re-export commonly used types
pub use dispatcher::{LogDispatcher, NotificationDispatcher, StoreDispatcher};
pub use geolocation::{ChannelGeolocation, DevicePosition, GeolocationProvider, PositionFeeder};
pub use memory_store::MemoryStore;
pub use mqtt_store::MqttStore;
pub use sink::{create_tracking_channel, ChannelSink, LocationUpdate, TrackingEvent, TrackingSink};
pub use store::{probe_link, LinkState, RealtimeStore};
