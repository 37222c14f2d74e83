//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml
//!
//! Every section and key is optional; missing values take the defaults
//! below.

use crate::domain::types::VehicleClass;
use crate::io::geolocation::Accuracy;
use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use tracing::warn;

/// Allowed range for the per-session throttle window
pub const MIN_DELIVERY_INTERVAL_MS: u64 = 2000;
pub const MAX_DELIVERY_INTERVAL_MS: u64 = 10000;
pub const DEFAULT_DELIVERY_INTERVAL_MS: u64 = 5000;

/// Clamp a requested throttle window into the allowed range
pub fn clamp_delivery_interval_ms(ms: u64) -> u64 {
    ms.clamp(MIN_DELIVERY_INTERVAL_MS, MAX_DELIVERY_INTERVAL_MS)
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_host")]
    pub host: String,
    #[serde(default = "default_store_port")]
    pub port: u16,
    #[serde(default = "default_store_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Path template for courier positions; `{channel}` is substituted
    #[serde(default = "default_location_path")]
    pub location_path: String,
    /// Path template for delivery status
    #[serde(default = "default_status_path")]
    pub status_path: String,
    /// Path template for proximity notifications
    #[serde(default = "default_notification_path")]
    pub notification_path: String,
    #[serde(default = "default_snapshot_timeout_ms")]
    pub snapshot_timeout_ms: u64,
    /// Seconds before an unresolved connectivity probe reports "degraded"
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: default_store_host(),
            port: default_store_port(),
            client_id: default_store_client_id(),
            username: None,
            password: None,
            location_path: default_location_path(),
            status_path: default_status_path(),
            notification_path: default_notification_path(),
            snapshot_timeout_ms: default_snapshot_timeout_ms(),
            probe_timeout_secs: default_probe_timeout_secs(),
        }
    }
}

fn default_store_host() -> String {
    "localhost".to_string()
}

fn default_store_port() -> u16 {
    1883
}

fn default_store_client_id() -> String {
    format!("courier-track-{}", std::process::id())
}

fn default_location_path() -> String {
    "orders/{channel}/location".to_string()
}

fn default_status_path() -> String {
    "orders/{channel}/status".to_string()
}

fn default_notification_path() -> String {
    "notifications/{order}".to_string()
}

fn default_snapshot_timeout_ms() -> u64 {
    2000
}

fn default_probe_timeout_secs() -> u64 {
    15
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackingConfig {
    #[serde(default = "default_delivery_interval_ms")]
    pub min_delivery_interval_ms: u64,
    /// Coordinate delta below which a sample counts as a near-duplicate
    #[serde(default = "default_coordinate_epsilon")]
    pub coordinate_epsilon_deg: f64,
    #[serde(default = "default_vehicle_class")]
    pub vehicle_class: String,
    /// Delivered samples kept for the average-speed fallback
    #[serde(default = "default_speed_history_len")]
    pub speed_history_len: usize,
    #[serde(default = "default_sink_buffer")]
    pub sink_buffer: usize,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            min_delivery_interval_ms: default_delivery_interval_ms(),
            coordinate_epsilon_deg: default_coordinate_epsilon(),
            vehicle_class: default_vehicle_class(),
            speed_history_len: default_speed_history_len(),
            sink_buffer: default_sink_buffer(),
        }
    }
}

fn default_delivery_interval_ms() -> u64 {
    DEFAULT_DELIVERY_INTERVAL_MS
}

fn default_coordinate_epsilon() -> f64 {
    0.0001
}

fn default_vehicle_class() -> String {
    "default".to_string()
}

fn default_speed_history_len() -> usize {
    10
}

fn default_sink_buffer() -> usize {
    256
}

#[derive(Debug, Clone, Deserialize)]
pub struct EtaConfig {
    #[serde(default = "default_distance_cache_capacity")]
    pub distance_cache_capacity: usize,
    #[serde(default = "default_eta_cache_capacity")]
    pub eta_cache_capacity: usize,
}

impl Default for EtaConfig {
    fn default() -> Self {
        Self {
            distance_cache_capacity: default_distance_cache_capacity(),
            eta_cache_capacity: default_eta_cache_capacity(),
        }
    }
}

fn default_distance_cache_capacity() -> usize {
    100
}

fn default_eta_cache_capacity() -> usize {
    50
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeofenceConfig {
    #[serde(default = "default_thresholds_m")]
    pub thresholds_m: Vec<u32>,
    #[serde(default = "default_watch_interval_ms")]
    pub watch_interval_ms: u64,
    #[serde(default = "default_watch_distance_m")]
    pub watch_distance_m: f64,
    /// Constant speed for the simple geofence ETA
    #[serde(default = "default_eta_speed_kmh")]
    pub eta_speed_kmh: f64,
    #[serde(default = "default_dispatch_timeout_ms")]
    pub dispatch_timeout_ms: u64,
    /// Device fix quality: "high", "balanced" or "low"
    #[serde(default = "default_watch_accuracy")]
    pub accuracy: String,
}

impl Default for GeofenceConfig {
    fn default() -> Self {
        Self {
            thresholds_m: default_thresholds_m(),
            watch_interval_ms: default_watch_interval_ms(),
            watch_distance_m: default_watch_distance_m(),
            eta_speed_kmh: default_eta_speed_kmh(),
            dispatch_timeout_ms: default_dispatch_timeout_ms(),
            accuracy: default_watch_accuracy(),
        }
    }
}

fn default_thresholds_m() -> Vec<u32> {
    vec![1000, 500, 200, 100]
}

fn default_watch_interval_ms() -> u64 {
    5000
}

fn default_watch_distance_m() -> f64 {
    10.0
}

fn default_eta_speed_kmh() -> f64 {
    20.0
}

fn default_dispatch_timeout_ms() -> u64 {
    3000
}

fn default_watch_accuracy() -> String {
    "high".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MapperConfig {
    /// JSON snapshot of the order -> channel table; empty disables persistence
    #[serde(default = "default_mapper_file")]
    pub file: String,
    /// Pre-provisioned channel ids; empty means generate UUIDv7 ids
    #[serde(default)]
    pub channel_pool: Vec<String>,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self { file: default_mapper_file(), channel_pool: Vec::new() }
    }
}

fn default_mapper_file() -> String {
    "channels.json".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval() }
    }
}

fn default_metrics_interval() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub tracking: TrackingConfig,
    #[serde(default)]
    pub eta: EtaConfig,
    #[serde(default)]
    pub geofence: GeofenceConfig,
    #[serde(default)]
    pub mapper: MapperConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    store_host: String,
    store_port: u16,
    store_client_id: String,
    store_username: Option<String>,
    store_password: Option<String>,
    location_path: String,
    status_path: String,
    notification_path: String,
    store_snapshot_timeout_ms: u64,
    store_probe_timeout_secs: u64,
    min_delivery_interval_ms: u64,
    coordinate_epsilon_deg: f64,
    vehicle_class: VehicleClass,
    speed_history_len: usize,
    sink_buffer: usize,
    distance_cache_capacity: usize,
    eta_cache_capacity: usize,
    geofence_thresholds_m: Vec<u32>,
    geofence_watch_interval_ms: u64,
    geofence_watch_distance_m: f64,
    geofence_eta_speed_kmh: f64,
    geofence_dispatch_timeout_ms: u64,
    geofence_accuracy: Accuracy,
    mapper_file: String,
    mapper_channel_pool: Vec<String>,
    metrics_interval_secs: u64,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default")
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: &str) -> Self {
        let store = toml_config.store;
        let tracking = toml_config.tracking;
        let geofence = toml_config.geofence;

        Self {
            store_host: store.host,
            store_port: store.port,
            store_client_id: store.client_id,
            store_username: store.username,
            store_password: store.password,
            location_path: store.location_path,
            status_path: store.status_path,
            notification_path: store.notification_path,
            store_snapshot_timeout_ms: store.snapshot_timeout_ms,
            store_probe_timeout_secs: store.probe_timeout_secs,
            min_delivery_interval_ms: clamp_delivery_interval_ms(tracking.min_delivery_interval_ms),
            coordinate_epsilon_deg: tracking.coordinate_epsilon_deg.abs(),
            vehicle_class: tracking.vehicle_class.parse().unwrap_or_default(),
            speed_history_len: tracking.speed_history_len.max(2),
            sink_buffer: tracking.sink_buffer.max(1),
            distance_cache_capacity: toml_config.eta.distance_cache_capacity,
            eta_cache_capacity: toml_config.eta.eta_cache_capacity,
            geofence_thresholds_m: normalize_thresholds(geofence.thresholds_m),
            geofence_watch_interval_ms: geofence.watch_interval_ms,
            geofence_watch_distance_m: geofence.watch_distance_m.max(0.0),
            geofence_eta_speed_kmh: if geofence.eta_speed_kmh > 0.0 {
                geofence.eta_speed_kmh
            } else {
                default_eta_speed_kmh()
            },
            geofence_dispatch_timeout_ms: geofence.dispatch_timeout_ms,
            geofence_accuracy: geofence.accuracy.parse().unwrap_or_default(),
            mapper_file: toml_config.mapper.file,
            mapper_channel_pool: toml_config.mapper.channel_pool,
            metrics_interval_secs: toml_config.metrics.interval_secs.max(1),
            config_file: config_file.to_string(),
        }
    }

    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
        for (i, arg) in args.iter().enumerate() {
            if arg == "--config" {
                if let Some(path) = args.get(i + 1) {
                    return path.clone();
                }
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                return path.to_string();
            }
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content, &path.display().to_string())
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str, origin: &str) -> anyhow::Result<Self> {
        let toml_config: TomlConfig = toml::from_str(content)?;
        Ok(Self::from_toml(toml_config, origin))
    }

    /// Load configuration from a path, falling back to defaults on error
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    /// Load configuration - resolves the path from args, then environment
    pub fn load(args: &[String]) -> Self {
        Self::load_from_path(&Self::resolve_config_path(args))
    }

    /// Location path for a channel
    pub fn location_path(&self, channel: &str) -> String {
        self.location_path.replace("{channel}", channel)
    }

    /// Status path for a channel
    pub fn status_path(&self, channel: &str) -> String {
        self.status_path.replace("{channel}", channel)
    }

    /// Notification path for an order
    pub fn notification_path(&self, order: &str) -> String {
        self.notification_path.replace("{order}", order)
    }

    pub fn store_host(&self) -> &str {
        &self.store_host
    }

    pub fn store_port(&self) -> u16 {
        self.store_port
    }

    pub fn store_client_id(&self) -> &str {
        &self.store_client_id
    }

    pub fn store_username(&self) -> Option<&str> {
        self.store_username.as_deref()
    }

    pub fn store_password(&self) -> Option<&str> {
        self.store_password.as_deref()
    }

    pub fn store_snapshot_timeout_ms(&self) -> u64 {
        self.store_snapshot_timeout_ms
    }

    pub fn store_probe_timeout_secs(&self) -> u64 {
        self.store_probe_timeout_secs
    }

    pub fn min_delivery_interval_ms(&self) -> u64 {
        self.min_delivery_interval_ms
    }

    pub fn coordinate_epsilon_deg(&self) -> f64 {
        self.coordinate_epsilon_deg
    }

    pub fn vehicle_class(&self) -> VehicleClass {
        self.vehicle_class
    }

    pub fn speed_history_len(&self) -> usize {
        self.speed_history_len
    }

    pub fn sink_buffer(&self) -> usize {
        self.sink_buffer
    }

    pub fn distance_cache_capacity(&self) -> usize {
        self.distance_cache_capacity
    }

    pub fn eta_cache_capacity(&self) -> usize {
        self.eta_cache_capacity
    }

    pub fn geofence_thresholds_m(&self) -> &[u32] {
        &self.geofence_thresholds_m
    }

    pub fn geofence_watch_interval_ms(&self) -> u64 {
        self.geofence_watch_interval_ms
    }

    pub fn geofence_watch_distance_m(&self) -> f64 {
        self.geofence_watch_distance_m
    }

    pub fn geofence_eta_speed_kmh(&self) -> f64 {
        self.geofence_eta_speed_kmh
    }

    pub fn geofence_dispatch_timeout_ms(&self) -> u64 {
        self.geofence_dispatch_timeout_ms
    }

    pub fn geofence_accuracy(&self) -> Accuracy {
        self.geofence_accuracy
    }

    pub fn mapper_file(&self) -> &str {
        &self.mapper_file
    }

    pub fn mapper_channel_pool(&self) -> &[String] {
        &self.mapper_channel_pool
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method to override the throttle window (clamped)
    pub fn with_min_delivery_interval_ms(mut self, ms: u64) -> Self {
        self.min_delivery_interval_ms = clamp_delivery_interval_ms(ms);
        self
    }

    /// Builder method to override the mapper snapshot file
    pub fn with_mapper_file(mut self, file: &str) -> Self {
        self.mapper_file = file.to_string();
        self
    }
}

/// Sort thresholds descending and drop zeros and duplicates
pub fn normalize_thresholds(mut thresholds: Vec<u32>) -> Vec<u32> {
    thresholds.retain(|t| *t > 0);
    thresholds.sort_unstable_by(|a, b| b.cmp(a));
    thresholds.dedup();
    if thresholds.is_empty() {
        default_thresholds_m()
    } else {
        thresholds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.store_host(), "localhost");
        assert_eq!(config.store_port(), 1883);
        assert_eq!(config.min_delivery_interval_ms(), 5000);
        assert_eq!(config.coordinate_epsilon_deg(), 0.0001);
        assert_eq!(config.distance_cache_capacity(), 100);
        assert_eq!(config.eta_cache_capacity(), 50);
        assert_eq!(config.geofence_thresholds_m(), &[1000, 500, 200, 100]);
        assert_eq!(config.store_probe_timeout_secs(), 15);
        assert_eq!(config.vehicle_class(), VehicleClass::Default);
    }

    #[test]
    fn test_path_templates() {
        let config = Config::default();
        assert_eq!(config.location_path("ch-1"), "orders/ch-1/location");
        assert_eq!(config.status_path("ch-1"), "orders/ch-1/status");
        assert_eq!(config.notification_path("o-9"), "notifications/o-9");
    }

    #[test]
    fn test_delivery_interval_is_clamped() {
        let config = Config::from_toml_str("[tracking]\nmin_delivery_interval_ms = 500\n", "t")
            .unwrap();
        assert_eq!(config.min_delivery_interval_ms(), MIN_DELIVERY_INTERVAL_MS);

        let config = Config::default().with_min_delivery_interval_ms(60_000);
        assert_eq!(config.min_delivery_interval_ms(), MAX_DELIVERY_INTERVAL_MS);
    }

    #[test]
    fn test_watch_accuracy_from_toml() {
        assert_eq!(Config::default().geofence_accuracy(), Accuracy::High);
        let config = Config::from_toml_str("[geofence]\naccuracy = \"balanced\"\n", "t").unwrap();
        assert_eq!(config.geofence_accuracy(), Accuracy::Balanced);
    }

    #[test]
    fn test_thresholds_normalized() {
        assert_eq!(normalize_thresholds(vec![100, 1000, 0, 500, 100]), vec![1000, 500, 100]);
        assert_eq!(normalize_thresholds(vec![]), vec![1000, 500, 200, 100]);
    }

    #[test]
    fn test_resolve_config_path_default() {
        let args: Vec<String> = vec!["courier-track".to_string()];
        if env::var("CONFIG_FILE").is_err() {
            assert_eq!(Config::resolve_config_path(&args), "config/dev.toml");
        }
    }

    #[test]
    fn test_resolve_config_path_from_arg() {
        let args: Vec<String> = vec![
            "courier-track".to_string(),
            "--config".to_string(),
            "config/prod.toml".to_string(),
        ];
        assert_eq!(Config::resolve_config_path(&args), "config/prod.toml");

        let args: Vec<String> =
            vec!["courier-track".to_string(), "--config=config/staging.toml".to_string()];
        assert_eq!(Config::resolve_config_path(&args), "config/staging.toml");
    }
}
