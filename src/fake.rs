//! An in-memory [`Transport`] for tests and demos.
//!
//! [`FakeTransport`] hosts scripted peripherals. Tests inject advertisement frames, remote disconnects, and
//! notifications, make individual operations fail or never complete, and inspect what the core wrote.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::trace;

use crate::scanner::{AdvertisementFrame, ScanConfig};
use crate::transport::{
    CccdValue, ConnectionStatus, FrameSink, StatusHandler, Transport, TransportError, ValueHandler, WriteKind,
};
use crate::util::lock;
use crate::{AddressType, DeviceAddress, Uuid};

/// A transport operation that can be scripted with [`FakeTransport::fail`], [`FakeTransport::stall`], or
/// [`FakeTransport::on_call`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// [`Transport::start_scan`]
    StartScan,
    /// [`Transport::resolve_device`]
    ResolveDevice,
    /// [`Transport::subscribe_connection_status`]
    SubscribeConnectionStatus,
    /// [`Transport::discover_services`]
    DiscoverServices,
    /// [`Transport::discover_characteristics`]
    DiscoverCharacteristics,
    /// [`Transport::read`]
    Read,
    /// [`Transport::write`]
    Write,
    /// [`Transport::write_cccd`]
    WriteCccd,
    /// [`Transport::subscribe_value_changed`]
    SubscribeValueChanged,
}

/// The GATT database of a scripted peripheral
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Peripheral {
    services: Vec<FakeGattService>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FakeGattService {
    uuid: Uuid,
    characteristics: Vec<(Uuid, Vec<u8>)>,
}

impl Peripheral {
    /// A peripheral without services
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a primary service exposing `characteristics`, each with an empty value
    pub fn with_service(mut self, uuid: Uuid, characteristics: &[Uuid]) -> Self {
        self.services.push(FakeGattService {
            uuid,
            characteristics: characteristics.iter().map(|x| (*x, Vec::new())).collect(),
        });
        self
    }
}

/// A device handle issued by [`FakeTransport`]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FakeDevice {
    address: DeviceAddress,
}

/// A service handle issued by [`FakeTransport`]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FakeService {
    address: DeviceAddress,
    index: usize,
}

/// A characteristic handle issued by [`FakeTransport`]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FakeCharacteristic {
    address: DeviceAddress,
    service: usize,
    index: usize,
    uuid: Uuid,
}

/// A subscription token issued by [`FakeTransport`]
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct FakeSubscription(u64);

/// A characteristic write observed by [`FakeTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedWrite {
    /// The peripheral written to
    pub address: DeviceAddress,
    /// The characteristic written to
    pub characteristic: Uuid,
    /// The bytes written
    pub value: Vec<u8>,
    /// Whether a response was requested
    pub kind: WriteKind,
}

type Hook = Arc<dyn Fn() + Send + Sync>;

/// A scriptable in-memory [`Transport`]
#[derive(Default)]
pub struct FakeTransport {
    state: Mutex<FakeState>,
}

#[derive(Default)]
struct FakeState {
    peripherals: HashMap<DeviceAddress, Peripheral>,
    scan: Option<(ScanConfig, FrameSink)>,
    next_token: u64,
    status_handlers: HashMap<u64, (DeviceAddress, StatusHandler)>,
    value_handlers: HashMap<u64, (FakeCharacteristic, ValueHandler)>,
    failures: HashMap<Operation, TransportError>,
    service_failures: HashMap<Uuid, TransportError>,
    stalled: Vec<Operation>,
    hooks: HashMap<Operation, Hook>,
    open_devices: usize,
    writes: Vec<RecordedWrite>,
    cccd_writes: Vec<(Uuid, CccdValue)>,
}

impl FakeState {
    fn token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }

    fn characteristic_value(&mut self, characteristic: &FakeCharacteristic) -> Option<&mut Vec<u8>> {
        self.peripherals
            .get_mut(&characteristic.address)?
            .services
            .get_mut(characteristic.service)?
            .characteristics
            .get_mut(characteristic.index)
            .map(|(_, value)| value)
    }
}

impl FakeTransport {
    /// Creates a transport without peripherals
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `peripheral` resolvable at `address`, replacing any peripheral already there
    pub fn add_peripheral(&self, address: DeviceAddress, peripheral: Peripheral) {
        lock(&self.state).peripherals.insert(address, peripheral);
    }

    /// Makes every later call of `operation` fail with `error`
    pub fn fail(&self, operation: Operation, error: TransportError) {
        lock(&self.state).failures.insert(operation, error);
    }

    /// Undoes [`fail`][Self::fail]
    pub fn clear_failure(&self, operation: Operation) {
        lock(&self.state).failures.remove(&operation);
    }

    /// Makes every later characteristic discovery on services of type `service` fail with `error`
    pub fn fail_service(&self, service: Uuid, error: TransportError) {
        lock(&self.state).service_failures.insert(service, error);
    }

    /// Makes every later call of an asynchronous `operation` never complete
    pub fn stall(&self, operation: Operation) {
        lock(&self.state).stalled.push(operation);
    }

    /// Runs `hook` at the start of every later call of `operation`
    pub fn on_call<F>(&self, operation: Operation, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        lock(&self.state).hooks.insert(operation, Arc::new(hook));
    }

    /// Whether a scan is running
    pub fn is_scanning(&self) -> bool {
        lock(&self.state).scan.is_some()
    }

    /// The configuration of the running scan
    pub fn scan_config(&self) -> Option<ScanConfig> {
        lock(&self.state).scan.as_ref().map(|(config, _)| config.clone())
    }

    /// Delivers `frame` to the running scan. Returns `false` if no scan is running.
    pub fn emit_frame(&self, frame: AdvertisementFrame) -> bool {
        let sink = lock(&self.state).scan.as_ref().map(|(_, sink)| sink.clone());
        match sink {
            Some(sink) => {
                sink(frame);
                true
            }
            None => false,
        }
    }

    /// Reports a lost link to every connection status subscriber of `address`
    pub fn drop_connection(&self, address: DeviceAddress) {
        let handlers: Vec<StatusHandler> = lock(&self.state)
            .status_handlers
            .values()
            .filter(|(x, _)| *x == address)
            .map(|(_, handler)| handler.clone())
            .collect();

        for handler in handlers {
            handler(ConnectionStatus::Disconnected);
        }
    }

    /// Delivers a value-changed event for `characteristic` of `address`. Returns the number of subscribers reached.
    pub fn notify(&self, address: DeviceAddress, characteristic: Uuid, value: &[u8]) -> usize {
        let handlers: Vec<ValueHandler> = lock(&self.state)
            .value_handlers
            .values()
            .filter(|(x, _)| x.address == address && x.uuid == characteristic)
            .map(|(_, handler)| handler.clone())
            .collect();

        for handler in &handlers {
            handler(value);
        }
        handlers.len()
    }

    /// Sets the value of the first characteristic `characteristic` of `address`
    pub fn set_value(&self, address: DeviceAddress, characteristic: Uuid, value: &[u8]) {
        let mut state = lock(&self.state);
        let slot = state
            .peripherals
            .get_mut(&address)
            .into_iter()
            .flat_map(|x| x.services.iter_mut())
            .flat_map(|x| x.characteristics.iter_mut())
            .find(|(uuid, _)| *uuid == characteristic);
        if let Some((_, slot)) = slot {
            *slot = value.to_vec();
        }
    }

    /// Every characteristic write so far
    pub fn writes(&self) -> Vec<RecordedWrite> {
        lock(&self.state).writes.clone()
    }

    /// Every client characteristic configuration descriptor write so far
    pub fn cccd_writes(&self) -> Vec<(Uuid, CccdValue)> {
        lock(&self.state).cccd_writes.clone()
    }

    /// The number of live connection status subscriptions
    pub fn status_subscriptions(&self) -> usize {
        lock(&self.state).status_handlers.len()
    }

    /// The number of live value-changed subscriptions
    pub fn value_subscriptions(&self) -> usize {
        lock(&self.state).value_handlers.len()
    }

    /// The number of resolved devices not yet released
    pub fn open_devices(&self) -> usize {
        lock(&self.state).open_devices
    }

    /// Runs the hook for `operation` and returns its scripted failure, if any
    fn enter(&self, operation: Operation) -> Result<(), TransportError> {
        let hook = lock(&self.state).hooks.get(&operation).cloned();
        if let Some(hook) = hook {
            hook();
        }

        trace!("fake transport: {:?}", operation);
        match lock(&self.state).failures.get(&operation) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    async fn enter_async(&self, operation: Operation) -> Result<(), TransportError> {
        self.enter(operation)?;
        let stalled = lock(&self.state).stalled.contains(&operation);
        if stalled {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

impl std::fmt::Debug for FakeTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("FakeTransport")
            .field("peripherals", &state.peripherals.len())
            .field("scanning", &state.scan.is_some())
            .field("open_devices", &state.open_devices)
            .finish()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    type Device = FakeDevice;
    type Service = FakeService;
    type Characteristic = FakeCharacteristic;
    type Subscription = FakeSubscription;

    fn start_scan(&self, config: &ScanConfig, sink: FrameSink) -> Result<(), TransportError> {
        self.enter(Operation::StartScan)?;
        lock(&self.state).scan = Some((config.clone(), sink));
        Ok(())
    }

    fn stop_scan(&self) -> Result<(), TransportError> {
        lock(&self.state).scan = None;
        Ok(())
    }

    async fn resolve_device(
        &self,
        address: DeviceAddress,
        _address_type: AddressType,
    ) -> Result<Option<FakeDevice>, TransportError> {
        self.enter_async(Operation::ResolveDevice).await?;
        let mut state = lock(&self.state);
        if !state.peripherals.contains_key(&address) {
            return Ok(None);
        }
        state.open_devices += 1;
        Ok(Some(FakeDevice { address }))
    }

    fn subscribe_connection_status(
        &self,
        device: &FakeDevice,
        handler: StatusHandler,
    ) -> Result<FakeSubscription, TransportError> {
        self.enter(Operation::SubscribeConnectionStatus)?;
        let mut state = lock(&self.state);
        let token = state.token();
        state.status_handlers.insert(token, (device.address, handler));
        Ok(FakeSubscription(token))
    }

    fn unsubscribe_connection_status(
        &self,
        _device: &FakeDevice,
        subscription: FakeSubscription,
    ) -> Result<(), TransportError> {
        match lock(&self.state).status_handlers.remove(&subscription.0) {
            Some(_) => Ok(()),
            None => Err(TransportError::Other(format!("unknown subscription {}", subscription.0))),
        }
    }

    fn release_device(&self, _device: FakeDevice) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        state.open_devices = state.open_devices.saturating_sub(1);
        Ok(())
    }

    async fn discover_services(&self, device: &FakeDevice) -> Result<Vec<(Uuid, FakeService)>, TransportError> {
        self.enter_async(Operation::DiscoverServices).await?;
        let state = lock(&self.state);
        let peripheral = state.peripherals.get(&device.address).ok_or(TransportError::Unreachable)?;
        Ok(peripheral
            .services
            .iter()
            .enumerate()
            .map(|(index, service)| {
                (
                    service.uuid,
                    FakeService {
                        address: device.address,
                        index,
                    },
                )
            })
            .collect())
    }

    async fn discover_characteristics(
        &self,
        service: &FakeService,
    ) -> Result<Vec<(Uuid, FakeCharacteristic)>, TransportError> {
        self.enter_async(Operation::DiscoverCharacteristics).await?;
        let state = lock(&self.state);
        let gatt_service = state
            .peripherals
            .get(&service.address)
            .and_then(|x| x.services.get(service.index))
            .ok_or(TransportError::Unreachable)?;
        if let Some(err) = state.service_failures.get(&gatt_service.uuid) {
            return Err(err.clone());
        }
        Ok(gatt_service
            .characteristics
            .iter()
            .enumerate()
            .map(|(index, (uuid, _))| {
                (
                    *uuid,
                    FakeCharacteristic {
                        address: service.address,
                        service: service.index,
                        index,
                        uuid: *uuid,
                    },
                )
            })
            .collect())
    }

    async fn read(&self, characteristic: &FakeCharacteristic) -> Result<Vec<u8>, TransportError> {
        self.enter_async(Operation::Read).await?;
        lock(&self.state)
            .characteristic_value(characteristic)
            .map(|x| x.clone())
            .ok_or(TransportError::Unreachable)
    }

    async fn write(
        &self,
        characteristic: &FakeCharacteristic,
        value: &[u8],
        kind: WriteKind,
    ) -> Result<(), TransportError> {
        self.enter_async(Operation::Write).await?;
        let mut state = lock(&self.state);
        let slot = state
            .characteristic_value(characteristic)
            .ok_or(TransportError::Unreachable)?;
        *slot = value.to_vec();
        state.writes.push(RecordedWrite {
            address: characteristic.address,
            characteristic: characteristic.uuid,
            value: value.to_vec(),
            kind,
        });
        Ok(())
    }

    async fn write_cccd(&self, characteristic: &FakeCharacteristic, value: CccdValue) -> Result<(), TransportError> {
        self.enter_async(Operation::WriteCccd).await?;
        lock(&self.state).cccd_writes.push((characteristic.uuid, value));
        Ok(())
    }

    fn subscribe_value_changed(
        &self,
        characteristic: &FakeCharacteristic,
        handler: ValueHandler,
    ) -> Result<FakeSubscription, TransportError> {
        self.enter(Operation::SubscribeValueChanged)?;
        let mut state = lock(&self.state);
        let token = state.token();
        state.value_handlers.insert(token, (characteristic.clone(), handler));
        Ok(FakeSubscription(token))
    }

    fn unsubscribe_value_changed(
        &self,
        _characteristic: &FakeCharacteristic,
        subscription: FakeSubscription,
    ) -> Result<(), TransportError> {
        match lock(&self.state).value_handlers.remove(&subscription.0) {
            Some(_) => Ok(()),
            None => Err(TransportError::Other(format!("unknown subscription {}", subscription.0))),
        }
    }
}
