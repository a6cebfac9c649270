//! The BLE transport capability driven by [`Scanner`][crate::Scanner] and [`Connection`][crate::Connection].
//!
//! A transport issues the actual radio commands. Implementations wrap a platform Bluetooth stack (or, for tests,
//! [`FakeTransport`][crate::fake::FakeTransport]). Handles returned by the transport are opaque to this crate and are
//! only ever passed back to the same transport.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::AttError;
use crate::scanner::{AdvertisementFrame, ScanConfig};
use crate::{AddressType, DeviceAddress, Uuid};

/// Receives raw advertisement frames while a scan is running
pub type FrameSink = Arc<dyn Fn(AdvertisementFrame) + Send + Sync>;

/// Receives connection status changes for a resolved device
pub type StatusHandler = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;

/// Receives value-changed events (notifications and indications) for a characteristic
pub type ValueHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// The link state reported by a transport's connection-status subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    /// The link to the device is up
    Connected,
    /// The link to the device was lost
    Disconnected,
}

/// Selects acknowledged or unacknowledged writes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum WriteKind {
    /// Write request; the device acknowledges the write
    #[default]
    WithResponse,
    /// Write command; no acknowledgement is requested
    WithoutResponse,
}

/// Value written to a characteristic's client characteristic configuration descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CccdValue {
    /// Value-changed events are off
    None,
    /// The device sends notifications
    Notify,
    /// The device sends indications
    Indicate,
}

/// A failure status reported by the transport
#[derive(Debug, displaydoc::Display, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// the device is unreachable
    Unreachable,
    /// access denied
    AccessDenied,
    /// protocol error: {0}
    Protocol(AttError),
    /// {0}
    Other(String),
}

impl std::error::Error for TransportError {}

/// The BLE transport that this crate drives.
///
/// Asynchronous methods complete when the transport signals completion of the underlying radio operation. Methods
/// that register callbacks must not invoke the callback synchronously from within the registering call.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// An opaque handle to a resolved device
    type Device: Clone + Send + Sync + 'static;
    /// An opaque handle to a discovered GATT service
    type Service: Clone + Send + Sync + 'static;
    /// An opaque handle to a discovered GATT characteristic
    type Characteristic: Clone + Send + Sync + 'static;
    /// A token identifying an event subscription
    type Subscription: Send + Sync + 'static;

    /// Starts delivering advertisement frames to `sink`.
    fn start_scan(&self, config: &ScanConfig, sink: FrameSink) -> Result<(), TransportError>;

    /// Stops delivering advertisement frames.
    fn stop_scan(&self) -> Result<(), TransportError>;

    /// Looks up the device with `address`. Returns `Ok(None)` if no such device is known.
    async fn resolve_device(
        &self,
        address: DeviceAddress,
        address_type: AddressType,
    ) -> Result<Option<Self::Device>, TransportError>;

    /// Subscribes to connection status changes for `device`.
    fn subscribe_connection_status(
        &self,
        device: &Self::Device,
        handler: StatusHandler,
    ) -> Result<Self::Subscription, TransportError>;

    /// Revokes a subscription made with [`subscribe_connection_status`][Self::subscribe_connection_status].
    fn unsubscribe_connection_status(
        &self,
        device: &Self::Device,
        subscription: Self::Subscription,
    ) -> Result<(), TransportError>;

    /// Releases a device handle obtained from [`resolve_device`][Self::resolve_device].
    fn release_device(&self, device: Self::Device) -> Result<(), TransportError>;

    /// Enumerates the primary GATT services of `device`.
    async fn discover_services(&self, device: &Self::Device) -> Result<Vec<(Uuid, Self::Service)>, TransportError>;

    /// Enumerates the characteristics of `service`.
    async fn discover_characteristics(
        &self,
        service: &Self::Service,
    ) -> Result<Vec<(Uuid, Self::Characteristic)>, TransportError>;

    /// Reads the current value of `characteristic` from the device.
    async fn read(&self, characteristic: &Self::Characteristic) -> Result<Vec<u8>, TransportError>;

    /// Writes `value` to `characteristic`.
    async fn write(
        &self,
        characteristic: &Self::Characteristic,
        value: &[u8],
        kind: WriteKind,
    ) -> Result<(), TransportError>;

    /// Writes the client characteristic configuration descriptor of `characteristic`.
    async fn write_cccd(&self, characteristic: &Self::Characteristic, value: CccdValue) -> Result<(), TransportError>;

    /// Subscribes to value-changed events for `characteristic`.
    fn subscribe_value_changed(
        &self,
        characteristic: &Self::Characteristic,
        handler: ValueHandler,
    ) -> Result<Self::Subscription, TransportError>;

    /// Revokes a subscription made with [`subscribe_value_changed`][Self::subscribe_value_changed].
    fn unsubscribe_value_changed(
        &self,
        characteristic: &Self::Characteristic,
        subscription: Self::Subscription,
    ) -> Result<(), TransportError>;
}
