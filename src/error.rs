use thiserror::Error;

/// Errors that can occur while acquiring and syncing wearable data
#[derive(Error, Debug)]
pub enum WearableError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// Bluetooth permission was denied or the radio is disabled
    #[error("Bluetooth permission denied or radio disabled")]
    PermissionDenied,

    /// Device not found during scanning or lookup
    #[error("Wearable device not found: {0}")]
    DeviceNotFound(String),

    /// Device connection failed
    #[error("Failed to connect to device: {0}")]
    ConnectionFailed(String),

    /// Device disconnected unexpectedly
    #[error("Device disconnected")]
    Disconnected,

    /// No device is currently selected
    #[error("No device selected")]
    NoDevice,

    /// Operation timeout
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// GATT layout or protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Payload parsing failed
    #[error("Failed to parse payload: {0}")]
    ParseError(String),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Key-value store failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// HTTP transport failure while talking to the remote sink
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Remote sink rejected the upload
    #[error("Upload rejected with status {status}: {message}")]
    Upload {
        /// HTTP status code
        status: u16,
        /// Server supplied message
        message: String,
    },

    /// Remote sink rejected the credential (HTTP 401)
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
}

/// Result type for wearlink operations
pub type Result<T> = std::result::Result<T, WearableError>;

impl WearableError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::ConnectionFailed(_)
                | Self::Disconnected
                | Self::DeviceNotFound(_)
        )
    }

    /// Check if this error is recoverable without user action
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::Disconnected
                | Self::ParseError(_)
                | Self::Http(_)
                | Self::Upload { .. }
        )
    }

    /// Check if a failed upload may be attempted again later.
    ///
    /// Every sink failure is retryable: the buffered samples stay queued and
    /// the next timer tick or manual trigger sends them again.
    #[must_use]
    pub const fn is_retryable_upload(&self) -> bool {
        matches!(
            self,
            Self::Http(_) | Self::Upload { .. } | Self::Unauthorized(_)
        )
    }

    /// Check if this error means the stored credential is stale
    #[must_use]
    pub const fn requires_reauth(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }
}
