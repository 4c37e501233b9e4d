use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

/// Battery value used until the device has reported a level
pub const BATTERY_UNKNOWN: i16 = -1;

/// Maximum number of devices remembered in the pairing history
pub const DEVICE_HISTORY_LIMIT: usize = 10;

fn default_device_type() -> String {
    "watch".to_string()
}

const fn default_battery() -> i16 {
    BATTERY_UNKNOWN
}

/// Identity and last-known status of a paired wearable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WearableDevice {
    /// Platform BLE address or UUID
    pub id: String,
    /// Display name
    pub name: String,
    /// Device category label
    #[serde(rename = "type", default = "default_device_type")]
    pub device_type: String,
    /// Last-known connectivity
    #[serde(default)]
    pub connected: bool,
    /// Last battery reading in percent, [`BATTERY_UNKNOWN`] if never read
    #[serde(default = "default_battery")]
    pub battery: i16,
}

impl WearableDevice {
    /// Create a disconnected device record with unknown battery
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            device_type: default_device_type(),
            connected: false,
            battery: BATTERY_UNKNOWN,
        }
    }

    /// Return a copy with the connectivity flag replaced
    #[must_use]
    pub fn with_connected(mut self, connected: bool) -> Self {
        self.connected = connected;
        self
    }

    /// Whether a battery level has been read
    #[must_use]
    pub const fn battery_known(&self) -> bool {
        self.battery >= 0
    }
}

impl fmt::Display for WearableDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// Connection state of the supervised device slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ConnectionState {
    /// No live link
    #[default]
    Disconnected,
    /// First connection attempt in progress
    Connecting,
    /// Link is up
    Connected,
    /// Link dropped, reconnect attempts are being scheduled
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Reconnecting => write!(f, "Reconnecting"),
        }
    }
}

/// A device reported by a scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    /// Platform BLE address or UUID
    pub id: String,
    /// Advertised name
    pub name: String,
    /// Signal strength (RSSI)
    pub rssi: i16,
}

/// One decoded reading from the wearable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSample {
    /// Heart rate in bpm, 0 if absent
    pub heart_rate: u32,
    /// Blood oxygen saturation in percent, 0 if absent
    pub spo2: u32,
    /// Cumulative step count
    pub steps: u64,
    /// Calories in kcal
    pub calories: f64,
    /// On-device alert score in [0, 1], if computed
    pub alert_score: Option<f64>,
    /// Receive time, stamped by the application at decode time
    pub timestamp: DateTime<Utc>,
}

impl HealthSample {
    /// Convert into the record shape expected by the remote API
    #[must_use]
    pub fn to_wire(&self) -> WireHealthRecord {
        WireHealthRecord::from(self)
    }
}

/// Health record as uploaded to the remote sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireHealthRecord {
    /// ISO-8601 receive time
    pub timestamp: String,
    /// Heart rate in bpm
    pub heart_rate: u32,
    /// Blood oxygen saturation in percent
    pub spo2: u32,
    /// Cumulative step count
    pub step_count: u64,
    /// Calories in kcal
    pub calories_burned: f64,
}

impl From<&HealthSample> for WireHealthRecord {
    fn from(sample: &HealthSample) -> Self {
        Self {
            timestamp: sample
                .timestamp
                .to_rfc3339_opts(SecondsFormat::Millis, true),
            heart_rate: sample.heart_rate,
            spo2: sample.spo2,
            step_count: sample.steps,
            calories_burned: sample.calories,
        }
    }
}

/// Request body for a health data upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthDataBatch {
    /// Identifier of the device the samples came from
    pub device_uuid: String,
    /// Samples in arrival order
    pub data_points: Vec<WireHealthRecord>,
}

/// Biological sex as encoded by the wearable firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Gender {
    /// Encoded as 0
    Male,
    /// Encoded as 1
    Female,
}

impl From<Gender> for u8 {
    fn from(value: Gender) -> Self {
        match value {
            Gender::Male => 0,
            Gender::Female => 1,
        }
    }
}

impl TryFrom<u8> for Gender {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Male),
            1 => Ok(Self::Female),
            other => Err(format!("unknown gender code {other}")),
        }
    }
}

/// Body profile written to the wearable so it can compute calories
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UserConfig {
    /// Height in meters
    pub height: f32,
    /// Weight in kilograms
    pub weight: f32,
    /// Age in years
    pub age: u8,
    /// Biological sex
    pub gender: Gender,
}

/// Notification transfer parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Transfer size requested during negotiation, in bytes
    pub preferred_mtu: usize,
    /// Transfer size assumed when negotiation is unsupported
    pub fallback_mtu: usize,
    /// Upper bound on a reassembled payload before it is discarded
    pub max_payload_bytes: usize,
}

/// Buffering and upload parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Periodic flush interval in milliseconds
    pub sync_interval_ms: u64,
    /// Buffer length that triggers an immediate flush
    pub flush_threshold: usize,
    /// Optional hard cap, oldest samples are dropped beyond it
    pub max_buffered_samples: Option<usize>,
}

/// Reconnect scheduling policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Delay between a detected drop and the reconnect attempt, in milliseconds
    pub delay_ms: u64,
    /// Give up after this many consecutive failed attempts, `None` retries forever
    pub max_attempts: Option<u32>,
}

/// Connection supervision parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Connectivity poll interval in milliseconds
    pub poll_interval_ms: u64,
    /// Reconnect policy
    pub reconnect: ReconnectPolicy,
    /// Notification transfer parameters
    pub transfer: TransferConfig,
    /// Scan window in milliseconds
    pub scan_timeout_ms: u64,
}

/// Remote sink parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// API base URL, without trailing slash
    pub base_url: String,
    /// Path of the health data endpoint
    pub health_data_path: String,
    /// Request timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            preferred_mtu: 512,
            fallback_mtu: 23,
            max_payload_bytes: 4_096,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval_ms: 30 * 60 * 1_000,
            flush_threshold: 100,
            max_buffered_samples: None,
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay_ms: 2_000,
            max_attempts: None,
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            reconnect: ReconnectPolicy::default(),
            transfer: TransferConfig::default(),
            scan_timeout_ms: 10_000,
        }
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api/v1".to_string(),
            health_data_path: "/healthdata".to_string(),
            timeout_ms: 15_000,
        }
    }
}

impl SyncConfig {
    /// Periodic flush interval
    #[must_use]
    pub const fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }
}

impl ReconnectPolicy {
    /// Delay before a scheduled reconnect attempt
    #[must_use]
    pub const fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Whether another attempt is allowed after `failed` consecutive failures
    #[must_use]
    pub const fn allows_attempt(&self, failed: u32) -> bool {
        match self.max_attempts {
            Some(max) => failed < max,
            None => true,
        }
    }
}

impl SupervisorConfig {
    /// Connectivity poll interval
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Scan window
    #[must_use]
    pub const fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }
}
