//! GATT connections and the discovery state machine.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::join_all;
use tracing::{debug, info, warn};

use crate::characteristic::CharacteristicInner;
use crate::dispatch::Slot;
use crate::error::ErrorKind;
use crate::options::ConnectionOptions;
use crate::transport::{ConnectionStatus, StatusHandler, Transport};
use crate::util::{defer, lock};
use crate::{btuuid, AddressType, Characteristic, DeviceAddress, Error, Result, Uuid};

/// A step of GATT discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscoveryStep {
    /// Resolving the device by address
    Device,
    /// Enumerating primary services
    Services,
    /// Enumerating the characteristics of every service
    Characteristics,
}

/// The lifecycle state of a [`Connection`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Not yet connected
    Idle,
    /// A connection attempt is in progress
    Discovering(DiscoveryStep),
    /// Discovery completed; characteristics are usable
    Connected,
    /// The connection was closed or the attempt failed. Call [`Connection::reset`] before connecting again.
    Disconnected,
}

/// Why a connection was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// [`Connection::disconnect`] or [`Connection::reset`] was called, or [`Connection::connect`] failed on a
    /// connected link
    Requested,
    /// The transport reported that the link was lost
    Remote,
}

type DisconnectHandler = dyn Fn(DisconnectReason) + Send + Sync;

/// A GATT client connection to one peripheral.
///
/// [`connect`][Connection::connect] resolves the device, enumerates its services, and then enumerates the
/// characteristics of every service. Once connected, characteristics are looked up by UUID. Every
/// [`Characteristic`] handed out becomes unusable as soon as the connection leaves the
/// [`Connected`][ConnectionState::Connected] state.
///
/// Dropping a `Connection` releases every transport resource it holds without notifying the disconnect handler.
pub struct Connection<T: Transport> {
    inner: Arc<ConnectionInner<T>>,
}

pub(crate) struct ConnectionInner<T: Transport> {
    pub(crate) transport: Arc<T>,
    address: DeviceAddress,
    address_type: AddressType,
    gatt: Mutex<Gatt<T>>,
    on_disconnect: Slot<DisconnectHandler>,
}

struct Gatt<T: Transport> {
    state: ConnectionState,
    // Bumped whenever the connection leaves a state; handles and in-flight attempts from an older epoch are stale.
    epoch: u64,
    device: Option<T::Device>,
    status_subscription: Option<T::Subscription>,
    services: HashSet<Uuid>,
    characteristics: HashMap<Uuid, Arc<CharacteristicInner<T>>>,
}

/// Transport resources taken out of a connection, released once the connection lock is dropped.
struct Released<T: Transport> {
    device: Option<T::Device>,
    status_subscription: Option<T::Subscription>,
    characteristics: Vec<Arc<CharacteristicInner<T>>>,
}

impl<T: Transport> Gatt<T> {
    fn take(&mut self) -> Released<T> {
        self.services.clear();
        Released {
            device: self.device.take(),
            status_subscription: self.status_subscription.take(),
            characteristics: self.characteristics.drain().map(|(_, x)| x).collect(),
        }
    }
}

impl<T: Transport> Released<T> {
    fn release(self, transport: &T) {
        // Revoke the status subscription first so a queued disconnect event can't reach freed state.
        if let (Some(device), Some(subscription)) = (&self.device, self.status_subscription) {
            if let Err(err) = transport.unsubscribe_connection_status(device, subscription) {
                warn!("Error removing connection status handler: {:?}", err);
            }
        }

        for characteristic in &self.characteristics {
            characteristic.retire(transport);
        }
        drop(self.characteristics);

        if let Some(device) = self.device {
            if let Err(err) = transport.release_device(device) {
                warn!("Error releasing device: {:?}", err);
            }
        }
    }
}

fn aborted() -> Error {
    Error::new(ErrorKind::NotConnected, None, "disconnected during discovery")
}

impl<T: Transport> Connection<T> {
    /// Creates an idle connection to the device at `address`
    pub fn new(transport: Arc<T>, address: DeviceAddress, address_type: AddressType) -> Self {
        Connection {
            inner: Arc::new(ConnectionInner {
                transport,
                address,
                address_type,
                gatt: Mutex::new(Gatt {
                    state: ConnectionState::Idle,
                    epoch: 0,
                    device: None,
                    status_subscription: None,
                    services: HashSet::new(),
                    characteristics: HashMap::new(),
                }),
                on_disconnect: Slot::new(),
            }),
        }
    }

    /// Creates an idle connection from parsed [`ConnectionOptions`]
    pub fn with_options(transport: Arc<T>, options: &ConnectionOptions) -> Self {
        Connection::new(transport, options.address, options.address_type)
    }

    /// The address of the peripheral
    pub fn address(&self) -> DeviceAddress {
        self.inner.address
    }

    /// The address type hint passed to the transport
    pub fn address_type(&self) -> AddressType {
        self.inner.address_type
    }

    /// The current lifecycle state
    pub fn state(&self) -> ConnectionState {
        lock(&self.inner.gatt).state
    }

    /// Whether discovery has completed and the connection has not been closed since
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Installs the handler invoked when the connection is closed, replacing any previous handler.
    ///
    /// The handler runs once per transition into [`Disconnected`][ConnectionState::Disconnected] caused by
    /// [`disconnect`][Self::disconnect], [`reset`][Self::reset], or the transport reporting a lost link. It also runs
    /// with [`DisconnectReason::Requested`] when a [`connect`][Self::connect] started on a connected link fails. A
    /// failed first attempt reports through its own result only.
    pub fn on_disconnect<F>(&self, handler: F)
    where
        F: Fn(DisconnectReason) + Send + Sync + 'static,
    {
        self.inner.on_disconnect.set(Arc::new(handler));
    }

    /// Connects to the device and discovers its services and characteristics.
    ///
    /// If the connection already holds a resolved device (i.e. it is connected), device resolution is skipped and
    /// discovery starts over from the services step; characteristics handed out earlier become unusable.
    ///
    /// Any failing step closes the connection and releases everything acquired so far. Dropping the returned future
    /// before it completes does the same. If the connection was connected when the attempt started, the disconnect
    /// handler is notified of the lost link.
    pub async fn connect(&self) -> Result<()> {
        let (epoch, device) = self.inner.begin_attempt()?;
        let reason = device.is_some().then_some(DisconnectReason::Requested);
        let abort = defer(|| self.inner.abort(epoch, reason));
        self.inner.discover(epoch, device).await?;
        abort.defuse();
        Ok(())
    }

    /// Closes the connection. Does nothing if the connection is already closed.
    pub fn disconnect(&self) {
        self.inner.teardown(DisconnectReason::Requested);
    }

    /// Closes the connection if necessary and returns it to [`Idle`][ConnectionState::Idle] so that it may connect
    /// again.
    pub fn reset(&self) {
        if self.state() != ConnectionState::Idle {
            self.inner.teardown(DisconnectReason::Requested);
        }

        let mut gatt = lock(&self.inner.gatt);
        if gatt.state == ConnectionState::Disconnected {
            gatt.state = ConnectionState::Idle;
        }
    }

    /// Looks up a discovered characteristic by its canonical UUID text.
    ///
    /// Returns `None` if `uuid` is malformed, was not discovered, or the connection is not connected.
    pub fn find_characteristic(&self, uuid: &str) -> Option<Characteristic<T>> {
        btuuid::parse(uuid).and_then(|x| self.characteristic(x))
    }

    /// Looks up a discovered characteristic.
    pub fn characteristic(&self, uuid: Uuid) -> Option<Characteristic<T>> {
        let gatt = lock(&self.inner.gatt);
        if gatt.state != ConnectionState::Connected {
            return None;
        }
        gatt.characteristics.get(&uuid).map(Characteristic::new)
    }

    /// Whether a service with the given canonical UUID text was discovered.
    ///
    /// Returns `false` if `uuid` is malformed or the connection is not connected.
    pub fn service_exists(&self, uuid: &str) -> bool {
        btuuid::parse(uuid).is_some_and(|x| self.has_service(x))
    }

    /// Whether `uuid` was among the discovered services.
    pub fn has_service(&self, uuid: Uuid) -> bool {
        let gatt = lock(&self.inner.gatt);
        gatt.state == ConnectionState::Connected && gatt.services.contains(&uuid)
    }

    /// The discovered services
    pub fn services(&self) -> Vec<Uuid> {
        let gatt = lock(&self.inner.gatt);
        match gatt.state {
            ConnectionState::Connected => gatt.services.iter().copied().collect(),
            _ => Vec::new(),
        }
    }

    /// The discovered characteristics
    pub fn characteristics(&self) -> Vec<Characteristic<T>> {
        let gatt = lock(&self.inner.gatt);
        match gatt.state {
            ConnectionState::Connected => gatt.characteristics.values().map(Characteristic::new).collect(),
            _ => Vec::new(),
        }
    }
}

impl<T: Transport> std::fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.inner.address)
            .field("address_type", &self.inner.address_type)
            .field("state", &self.state())
            .finish()
    }
}

impl<T: Transport> ConnectionInner<T> {
    /// Whether a characteristic built in `epoch` is still usable
    pub(crate) fn is_live(&self, epoch: u64) -> bool {
        let gatt = lock(&self.gatt);
        gatt.state == ConnectionState::Connected && gatt.epoch == epoch
    }

    pub(crate) fn ensure_live(&self, epoch: u64) -> Result<()> {
        if self.is_live(epoch) {
            Ok(())
        } else {
            Err(ErrorKind::NotConnected.into())
        }
    }

    fn begin_attempt(&self) -> Result<(u64, Option<T::Device>)> {
        let (epoch, device, stale) = {
            let mut gatt = lock(&self.gatt);
            match gatt.state {
                ConnectionState::Discovering(_) => {
                    return Err(Error::new(
                        ErrorKind::InvalidState,
                        None,
                        "a connection attempt is already in progress",
                    ))
                }
                ConnectionState::Disconnected => {
                    return Err(Error::new(
                        ErrorKind::InvalidState,
                        None,
                        "the connection is closed; reset it before connecting again",
                    ))
                }
                ConnectionState::Idle | ConnectionState::Connected => {}
            }

            gatt.epoch += 1;
            gatt.services.clear();
            let stale: Vec<_> = gatt.characteristics.drain().map(|(_, x)| x).collect();
            let device = gatt.device.clone();
            gatt.state = ConnectionState::Discovering(if device.is_some() {
                DiscoveryStep::Services
            } else {
                DiscoveryStep::Device
            });
            (gatt.epoch, device, stale)
        };

        for characteristic in &stale {
            characteristic.retire(&self.transport);
        }

        Ok((epoch, device))
    }

    fn advance(&self, epoch: u64, step: DiscoveryStep) -> Result<()> {
        let mut gatt = lock(&self.gatt);
        if gatt.epoch != epoch {
            return Err(aborted());
        }
        gatt.state = ConnectionState::Discovering(step);
        Ok(())
    }

    async fn discover(self: &Arc<Self>, epoch: u64, device: Option<T::Device>) -> Result<()> {
        let device = match device {
            Some(device) => {
                debug!("{}: reusing resolved device", self.address);
                device
            }
            None => self.resolve(epoch).await?,
        };

        self.advance(epoch, DiscoveryStep::Services)?;
        let services = self.transport.discover_services(&device).await.map_err(|err| {
            Error::new(
                ErrorKind::ServiceDiscoveryFailed,
                Some(Box::new(err)),
                format!("discovering services of {}", self.address),
            )
        })?;
        debug!("{}: discovered {} services", self.address, services.len());

        self.advance(epoch, DiscoveryStep::Characteristics)?;
        let results = join_all(
            services
                .iter()
                .map(|(_, service)| self.transport.discover_characteristics(service)),
        )
        .await;

        let mut characteristics = HashMap::new();
        for ((service, _), result) in services.iter().zip(results) {
            let discovered = result.map_err(|err| {
                Error::new(
                    ErrorKind::CharacteristicDiscoveryFailed,
                    Some(Box::new(err)),
                    format!("discovering characteristics of service {service}"),
                )
            })?;

            for (uuid, handle) in discovered {
                characteristics
                    .entry(uuid)
                    .or_insert_with(|| Arc::new(CharacteristicInner::new(uuid, handle, Arc::downgrade(self), epoch)));
            }
        }

        let mut gatt = lock(&self.gatt);
        if gatt.epoch != epoch {
            return Err(aborted());
        }
        gatt.services = services.into_iter().map(|(uuid, _)| uuid).collect();
        gatt.characteristics = characteristics;
        gatt.state = ConnectionState::Connected;
        info!(
            "{}: connected with {} services and {} characteristics",
            self.address,
            gatt.services.len(),
            gatt.characteristics.len()
        );

        Ok(())
    }

    async fn resolve(self: &Arc<Self>, epoch: u64) -> Result<T::Device> {
        debug!("{}: resolving device ({} address)", self.address, self.address_type);
        let device = self
            .transport
            .resolve_device(self.address, self.address_type)
            .await
            .map_err(|err| {
                Error::new(
                    ErrorKind::DeviceNotFound,
                    Some(Box::new(err)),
                    format!("resolving {}", self.address),
                )
            })?
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::DeviceNotFound,
                    None,
                    format!("no device with address {}", self.address),
                )
            })?;

        let weak = Arc::downgrade(self);
        let handler: StatusHandler = Arc::new(move |status: ConnectionStatus| {
            if status == ConnectionStatus::Disconnected {
                if let Some(inner) = weak.upgrade() {
                    inner.teardown(DisconnectReason::Remote);
                }
            }
        });

        let subscription = match self.transport.subscribe_connection_status(&device, handler) {
            Ok(subscription) => subscription,
            Err(err) => {
                if let Err(err) = self.transport.release_device(device) {
                    warn!("Error releasing device: {:?}", err);
                }
                return Err(Error::new(
                    ErrorKind::DeviceNotFound,
                    Some(Box::new(err)),
                    format!("monitoring connection status of {}", self.address),
                ));
            }
        };

        let mut gatt = lock(&self.gatt);
        if gatt.epoch != epoch {
            drop(gatt);
            Released::<T> {
                device: Some(device),
                status_subscription: Some(subscription),
                characteristics: Vec::new(),
            }
            .release(&self.transport);
            return Err(aborted());
        }

        gatt.device = Some(device.clone());
        gatt.status_subscription = Some(subscription);
        Ok(device)
    }

    /// Closes a failed attempt. The disconnect handler is notified only when `reason` is given.
    fn abort(&self, epoch: u64, reason: Option<DisconnectReason>) {
        let released = {
            let mut gatt = lock(&self.gatt);
            if gatt.epoch != epoch {
                return;
            }
            gatt.state = ConnectionState::Disconnected;
            gatt.epoch += 1;
            gatt.take()
        };

        debug!("{}: connection attempt aborted", self.address);
        released.release(&self.transport);

        if let Some(reason) = reason {
            info!("{}: disconnected ({:?})", self.address, reason);
            if let Some(handler) = self.on_disconnect.get() {
                handler(reason);
            }
        }
    }

    fn teardown(&self, reason: DisconnectReason) {
        let released = {
            let mut gatt = lock(&self.gatt);
            if gatt.state == ConnectionState::Disconnected {
                return;
            }
            gatt.state = ConnectionState::Disconnected;
            gatt.epoch += 1;
            gatt.take()
        };

        released.release(&self.transport);
        info!("{}: disconnected ({:?})", self.address, reason);

        if let Some(handler) = self.on_disconnect.get() {
            handler(reason);
        }
    }
}

impl<T: Transport> Drop for ConnectionInner<T> {
    fn drop(&mut self) {
        let released = self.gatt.get_mut().unwrap_or_else(PoisonError::into_inner).take();
        released.release(&self.transport);
    }
}
