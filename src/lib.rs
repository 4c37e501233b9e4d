#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Wearlink
//!
//! Acquisition and synchronization pipeline for BLE health wearables.
//!
//! The crate pairs with a wearable over Bluetooth Low Energy, reassembles the
//! JSON health records the firmware streams over a notify characteristic, keeps
//! them in an ordered in-memory buffer and periodically uploads that buffer to a
//! remote HTTP endpoint.
//!
//! ## Pipeline
//!
//! - **Transport** ([`ble::Transport`]): scan, connect, read, write and subscribe.
//!   [`ble::BtleplugTransport`] is the default binding.
//! - **Reassembly** ([`protocol::PayloadReassembler`]): stitches MTU-sized chunks
//!   into [`HealthSample`] values.
//! - **Supervision** ([`ConnectionSupervisor`]): owns the device slot, polls the
//!   link, schedules single-flight reconnects and persists the paired device and
//!   a bounded history.
//! - **Sync** ([`DataSyncService`]): buffers samples and flushes them on a timer,
//!   when the buffer fills up, or on demand. Failed uploads never lose samples.
//! - **Sink** ([`sink::RemoteSink`]): [`sink::HttpSink`] posts batches with a
//!   bearer token.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use wearlink::{
//!     ble::BtleplugTransport,
//!     sink::{HttpSink, KeyValueTokenStore},
//!     storage::MemoryStore,
//!     ConnectionSupervisor, DataSyncService, SinkConfig, SupervisorConfig, SyncConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(MemoryStore::default());
//!     let tokens = Arc::new(KeyValueTokenStore::new(store.clone()));
//!     let sink = Arc::new(HttpSink::new(&SinkConfig::default(), tokens)?);
//!     let sync = DataSyncService::new(sink, SyncConfig::default());
//!
//!     let transport = Arc::new(BtleplugTransport::new().await?);
//!     let supervisor =
//!         ConnectionSupervisor::new(transport, store, sync, SupervisorConfig::default());
//!
//!     supervisor.restore().await?;
//!     supervisor.start_monitoring().await;
//!
//!     // Upload whatever is pending right now
//!     let uploaded = supervisor.force_sync().await?;
//!     println!("uploaded {uploaded} samples");
//!     Ok(())
//! }
//! ```

use uuid::Uuid;

/// Bluetooth Low Energy transport module
pub mod ble;
/// Error types and handling
pub mod error;
/// Rolling heart rate and SpO2 chart history
pub mod history;
/// Health payload reassembly and decoding
pub mod protocol;
/// Remote upload sink
pub mod sink;
/// Key-value persistence of device state
pub mod storage;
/// Connection supervision and reconnect scheduling
pub mod supervisor;
/// Sample buffering and upload scheduling
pub mod sync;
/// Type definitions and data structures
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-export the main types for convenient usage
pub use error::{Result, WearableError};
pub use supervisor::ConnectionSupervisor;
pub use sync::DataSyncService;
pub use types::{
    ConnectionState, DiscoveredDevice, Gender, HealthDataBatch, HealthSample, ReconnectPolicy,
    SinkConfig, SupervisorConfig, SyncConfig, TransferConfig, UserConfig, WearableDevice,
    WireHealthRecord,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Health data service exposed by the wearable firmware
pub const HEALTH_SERVICE_UUID: Uuid = Uuid::from_u128(0x4faf_c201_1fb5_459e_8fcc_c5c9_c331_914b);

/// Notify characteristic carrying chunked JSON health records
pub const HEALTH_DATA_CHAR_UUID: Uuid = Uuid::from_u128(0xbeb5_483e_36e1_4688_b7f5_ea07_361b_26a8);

/// Writable characteristic accepting the JSON user profile
pub const USER_CONFIG_CHAR_UUID: Uuid = Uuid::from_u128(0xe322_3119_9445_4e96_a4a1_8535_8c40_46a2);

/// Standard GATT battery service
pub const BATTERY_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_180f_0000_1000_8000_0080_5f9b_34fb);

/// Standard GATT battery level characteristic
pub const BATTERY_LEVEL_CHAR_UUID: Uuid =
    Uuid::from_u128(0x0000_2a19_0000_1000_8000_0080_5f9b_34fb);
