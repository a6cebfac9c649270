#![warn(missing_docs)]

//! Gattlink is the transport-agnostic core of a Bluetooth Low Energy (BLE) GATT client.
//!
//! It aggregates advertising packets into per-device scan results, connects to a peripheral and discovers its GATT
//! database, and performs reads, writes, and notification subscriptions on the discovered characteristics. The actual
//! radio commands are issued by a [`Transport`][transport::Transport] supplied by the application, which makes the
//! core usable on any platform stack (and in tests, with [`FakeTransport`][fake::FakeTransport]).
//!
//! # Usage
//!
//! ```rust,no_run
//!# use std::sync::Arc;
//!# use gattlink::fake::{FakeTransport, Peripheral};
//!# use gattlink::{btuuid, Connection, ConnectionOptions, WriteKind};
//!# #[tokio::main]
//!# async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!let transport = Arc::new(FakeTransport::new());
//!let options = ConnectionOptions::from_pairs(&[("mac", "a4:34:f1:00:11:22")])?;
//!
//!let connection = Connection::with_options(transport, &options);
//!connection.on_disconnect(|reason| println!("disconnected: {reason:?}"));
//!connection.connect().await?;
//!
//!let characteristic = connection
//!    .find_characteristic("00002a39-0000-1000-8000-00805f9b34fb")
//!    .ok_or("control point not found")?;
//!characteristic.write(&[0x01], WriteKind::WithResponse).await?;
//!characteristic.on_notification(|value| println!("{value:?}"))?;
//!characteristic.enable_notifications().await?;
//!#
//!#    Ok(())
//!# }
//! ```
//!
//! # Overview
//!
//! - [`Scanner`] merges the service UUIDs advertised by each device over a scan session and reports a
//!   [`ScanResult`] for every scan response.
//! - [`Connection`] drives the device → services → characteristics discovery sequence and owns the discovered
//!   GATT database. Characteristics are looked up by UUID once connected.
//! - [`Characteristic`] is a non-owning handle used for reads, writes, and notifications. It stops working as soon
//!   as its connection disconnects.
//!
//! Every observer (scan results, disconnects, notifications) holds a single handler. Registering a new handler
//! replaces the old one. Handlers are invoked on whichever thread the transport delivers its events on and never while
//! an internal lock is held, so they may call back into the crate.
//!
//! # Feature flags
//!
//! The `serde` feature is available to enable serializing/deserializing device addresses and the option types.

pub mod btuuid;
pub mod error;
pub mod fake;
pub mod transport;

mod address;
mod characteristic;
mod connection;
mod dispatch;
mod options;
mod scanner;
mod util;

pub use address::{AddressType, DeviceAddress};
pub use btuuid::BluetoothUuidExt;
pub use characteristic::Characteristic;
pub use connection::{Connection, ConnectionState, DisconnectReason, DiscoveryStep};
pub use error::Error;
pub use options::ConnectionOptions;
pub use scanner::{AdvertisementFrame, FrameKind, ScanConfig, ScanMode, ScanRecord, ScanResult, Scanner};
pub use transport::WriteKind;
pub use uuid::Uuid;

/// Convenience alias for a result with [`Error`]
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Manufacturer specific data included in Bluetooth advertisements. See the Bluetooth Core Specification Supplement
/// §A.1.4 for details.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ManufacturerData {
    /// Company identifier (defined [here](https://www.bluetooth.com/specifications/assigned-numbers/company-identifiers/))
    pub company_id: u16,
    /// Manufacturer specific data
    pub data: Vec<u8>,
}
