#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # cgmlink
//!
//! A Rust library for streaming Continuous Glucose Monitor (CGM) readings over
//! Bluetooth Low Energy.
//!
//! The crate is a GATT central client for peripherals exposing the Bluetooth SIG
//! Continuous Glucose Monitoring Service (`0x181F`). It finds a sensor, pairs with
//! it, subscribes to the CGM Measurement characteristic and decodes every record
//! into a [`CgmMeasurement`].
//!
//! ## Architecture
//!
//! - **Connection supervisor**: one explicit state machine driving scanning,
//!   bonding, MTU negotiation, service discovery, subscription and reconnection
//! - **Descriptor write queue**: CCCD writes are serialized, one in flight at a time,
//!   with a timeout that unblocks the queue when the stack drops a write
//! - **Keepalive monitor**: polls the CGM Status characteristic until data flows
//! - **Measurement codec**: pure decoder for the SFLOAT based measurement record
//!
//! Every platform callback and timer expiry is delivered as an [`supervisor::Event`]
//! to a single task, so connection state is never mutated concurrently.
//!
//! ## Quick Start
//!
//! ```no_run
//! use cgmlink::{CgmClient, CgmEvent, SupervisorConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (client, mut events) = CgmClient::with_btleplug(SupervisorConfig::default()).await?;
//!     client.start_scan()?;
//!
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             CgmEvent::DeviceFound(device) => client.connect_to_device(device)?,
//!             CgmEvent::Measurement(reading) => println!("{reading}"),
//!             _ => {}
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```

use uuid::Uuid;

/// btleplug backed implementation of the platform BLE stack
pub mod ble;
/// Serialized CCCD write queue
pub mod cccd;
/// Application-facing client handle and event loop
pub mod device;
/// Error types and handling
pub mod error;
/// Keepalive monitor
pub mod keepalive;
/// Platform BLE stack abstraction
pub mod platform;
/// Measurement codec and protocol constants
pub mod protocol;
/// Scan session bookkeeping
pub mod scanner;
/// Connection supervisor state machine
pub mod supervisor;
/// Cancelable scheduled tasks
pub mod timer;
/// Type definitions and data structures
pub mod types;

// Re-export the main types for convenient usage
pub use ble::BtleplugPlatform;
pub use device::CgmClient;
pub use error::{CgmError, ErrorClass, Result};
pub use platform::{BlePlatform, BondState, PlatformEvent};
pub use protocol::{parse_measurement, CgmMeasurement, SocpOpCode, SocpResponse};
pub use types::{
    CgmCharacteristic, CgmEvent, ConnectionState, DeviceAddress, DiscoveredDevice, LinkStatus,
    NotifyMode, SubscriptionState, SupervisorConfig,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Continuous Glucose Monitoring Service (`0x181F`)
pub const CGMS_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_181F_0000_1000_8000_0080_5F9B_34FB);

/// CGM Measurement characteristic (`0x2AA7`), notified with glucose records
pub const CGM_MEASUREMENT_UUID: Uuid = Uuid::from_u128(0x0000_2AA7_0000_1000_8000_0080_5F9B_34FB);

/// CGM Feature characteristic (`0x2AA8`)
pub const CGM_FEATURE_UUID: Uuid = Uuid::from_u128(0x0000_2AA8_0000_1000_8000_0080_5F9B_34FB);

/// CGM Status characteristic (`0x2AA9`), also the keepalive read target
pub const CGM_STATUS_UUID: Uuid = Uuid::from_u128(0x0000_2AA9_0000_1000_8000_0080_5F9B_34FB);

/// CGM Session Start Time characteristic (`0x2AAA`)
pub const CGM_SESSION_START_TIME_UUID: Uuid =
    Uuid::from_u128(0x0000_2AAA_0000_1000_8000_0080_5F9B_34FB);

/// CGM Session Run Time characteristic (`0x2AAB`)
pub const CGM_SESSION_RUN_TIME_UUID: Uuid =
    Uuid::from_u128(0x0000_2AAB_0000_1000_8000_0080_5F9B_34FB);

/// CGM Specific Ops Control Point characteristic (`0x2AAC`)
///
/// Session control channel. Responses arrive as indications, so the supervisor
/// subscribes to it alongside the measurement characteristic.
pub const CGM_SPECIFIC_OPS_CP_UUID: Uuid =
    Uuid::from_u128(0x0000_2AAC_0000_1000_8000_0080_5F9B_34FB);

/// Client Characteristic Configuration descriptor (`0x2902`)
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x0000_2902_0000_1000_8000_0080_5F9B_34FB);
