//! Shared types for order tracking

use crate::domain::geo::Coordinate;
use serde::{Deserialize, Serialize};

/// Client-issued order identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(pub String);

impl OrderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OrderId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier the real-time store uses to address an order's data paths
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub String);

impl ChannelId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalized courier position reading
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationSample {
    pub latitude: f64,
    pub longitude: f64,
    /// Reported accuracy, clamped to [1, 50] meters
    pub accuracy_m: f64,
    /// Ground speed, never negative
    pub speed_mps: f64,
    /// Heading in [0, 360)
    pub heading_deg: f64,
    pub timestamp_ms: u64,
}

impl LocationSample {
    #[inline]
    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.latitude, self.longitude)
    }

    #[inline]
    pub fn speed_kmh(&self) -> f64 {
        self.speed_mps * 3.6
    }

    /// True when either axis moved by more than `epsilon_deg`
    pub fn differs_from(&self, other: &LocationSample, epsilon_deg: f64) -> bool {
        (self.latitude - other.latitude).abs() > epsilon_deg
            || (self.longitude - other.longitude).abs() > epsilon_deg
    }
}

/// Coarse delivery lifecycle label as written by the courier side
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(into = "String")]
pub enum DeliveryStatus {
    Pending,
    Assigned,
    PickedUp,
    InTransit,
    Arrived,
    Delivered,
    /// Unrecognised label, passed through untouched
    Other(String),
}

impl std::str::FromStr for DeliveryStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim() {
            "pending" => DeliveryStatus::Pending,
            "assigned" => DeliveryStatus::Assigned,
            "picked_up" | "pickedUp" | "picked-up" => DeliveryStatus::PickedUp,
            "in_transit" | "inTransit" | "in-transit" => DeliveryStatus::InTransit,
            "arrived" => DeliveryStatus::Arrived,
            "delivered" => DeliveryStatus::Delivered,
            other => DeliveryStatus::Other(other.to_string()),
        })
    }
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Assigned => "assigned",
            DeliveryStatus::PickedUp => "picked_up",
            DeliveryStatus::InTransit => "in_transit",
            DeliveryStatus::Arrived => "arrived",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Other(s) => s,
        }
    }

    /// Terminal states after which no further movement is expected
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryStatus::Delivered)
    }
}

impl From<DeliveryStatus> for String {
    fn from(status: DeliveryStatus) -> Self {
        status.as_str().to_string()
    }
}

/// Status change delivered to sinks
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusEvent {
    pub status: DeliveryStatus,
    pub timestamp_ms: u64,
}

/// Vehicle class used to pick a fallback average speed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum VehicleClass {
    Walking,
    Cycling,
    Motorbike,
    Car,
    #[default]
    Default,
}

impl VehicleClass {
    /// Typical urban average speed for the class in km/h
    pub fn average_speed_kmh(&self) -> f64 {
        match self {
            VehicleClass::Walking => 5.0,
            VehicleClass::Cycling => 15.0,
            VehicleClass::Motorbike => 25.0,
            VehicleClass::Car => 30.0,
            VehicleClass::Default => 20.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VehicleClass::Walking => "walking",
            VehicleClass::Cycling => "cycling",
            VehicleClass::Motorbike => "motorbike",
            VehicleClass::Car => "car",
            VehicleClass::Default => "default",
        }
    }
}

impl std::str::FromStr for VehicleClass {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "walking" | "walk" | "foot" => VehicleClass::Walking,
            "cycling" | "bicycle" | "bike" => VehicleClass::Cycling,
            "motorbike" | "motorcycle" | "scooter" => VehicleClass::Motorbike,
            "car" => VehicleClass::Car,
            _ => VehicleClass::Default,
        })
    }
}
