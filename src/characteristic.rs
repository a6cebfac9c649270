use std::sync::{Arc, Mutex, Weak};

use tracing::warn;

use crate::connection::ConnectionInner;
use crate::dispatch::Slot;
use crate::error::ErrorKind;
use crate::transport::{CccdValue, Transport, TransportError, ValueHandler, WriteKind};
use crate::util::{defer, lock};
use crate::{Error, Result, Uuid};

type NotificationHandler = dyn Fn(&[u8]) + Send + Sync;

/// A Bluetooth GATT characteristic discovered by a [`Connection`][crate::Connection].
///
/// A `Characteristic` is a non-owning handle. Once the connection that discovered it disconnects, reconnects, or is
/// dropped, every operation fails with [`ErrorKind::NotConnected`].
pub struct Characteristic<T: Transport> {
    uuid: Uuid,
    inner: Weak<CharacteristicInner<T>>,
}

pub(crate) struct CharacteristicInner<T: Transport> {
    uuid: Uuid,
    handle: T::Characteristic,
    owner: Weak<ConnectionInner<T>>,
    epoch: u64,
    on_value: Slot<NotificationHandler>,
    notify: Mutex<NotifyState<T>>,
}

struct NotifyState<T: Transport> {
    subscription: Option<T::Subscription>,
    // Identifies the value-changed subscription whose events are forwarded. Events from a retired subscription that
    // are already in flight carry an older id and are dropped.
    active: Option<u64>,
    next_id: u64,
}

impl<T: Transport> Clone for Characteristic<T> {
    fn clone(&self) -> Self {
        Characteristic {
            uuid: self.uuid,
            inner: self.inner.clone(),
        }
    }
}

impl<T: Transport> PartialEq for Characteristic<T> {
    fn eq(&self, other: &Self) -> bool {
        Weak::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: Transport> Eq for Characteristic<T> {}

impl<T: Transport> std::fmt::Debug for Characteristic<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Characteristic").field("uuid", &self.uuid).finish()
    }
}

impl<T: Transport> Characteristic<T> {
    pub(crate) fn new(inner: &Arc<CharacteristicInner<T>>) -> Self {
        Characteristic {
            uuid: inner.uuid,
            inner: Arc::downgrade(inner),
        }
    }

    /// The [`Uuid`] identifying the type of this GATT characteristic
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn live(&self) -> Result<(Arc<CharacteristicInner<T>>, Arc<ConnectionInner<T>>)> {
        let inner = self.inner.upgrade().ok_or(ErrorKind::NotConnected)?;
        let owner = inner.owner.upgrade().ok_or(ErrorKind::NotConnected)?;
        owner.ensure_live(inner.epoch)?;
        Ok((inner, owner))
    }

    /// Read the value of this characteristic from the device
    pub async fn read(&self) -> Result<Vec<u8>> {
        let (inner, owner) = self.live()?;
        let result = owner.transport.read(&inner.handle).await;
        owner.ensure_live(inner.epoch)?;
        result.map_err(|err| Error::new(ErrorKind::ReadFailed, Some(Box::new(err)), format!("reading {}", self.uuid)))
    }

    /// Write `value` to this characteristic on the device
    pub async fn write(&self, value: &[u8], kind: WriteKind) -> Result<()> {
        let (inner, owner) = self.live()?;
        let result = owner.transport.write(&inner.handle, value, kind).await;
        owner.ensure_live(inner.epoch)?;
        result.map_err(|err| {
            Error::new(
                ErrorKind::WriteFailed,
                Some(Box::new(err)),
                format!("writing {} bytes to {}", value.len(), self.uuid),
            )
        })
    }

    /// Enables notifications for this characteristic on the device.
    ///
    /// Notifications are delivered to the handler installed with [`on_notification`][Self::on_notification].
    pub async fn enable_notifications(&self) -> Result<()> {
        let (inner, owner) = self.live()?;
        let created = inner.subscribe(&owner.transport).map_err(|err| {
            Error::new(
                ErrorKind::NotifyEnableFailed,
                Some(Box::new(err)),
                format!("subscribing to {}", self.uuid),
            )
        })?;

        // A subscription made here is removed again unless the CCCD write succeeds
        let guard = created.then(|| defer(|| inner.retire(&owner.transport)));
        let result = owner.transport.write_cccd(&inner.handle, CccdValue::Notify).await;
        match guard {
            Some(guard) if result.is_ok() => guard.defuse(),
            guard => drop(guard),
        }

        owner.ensure_live(inner.epoch)?;
        result.map_err(|err| {
            Error::new(
                ErrorKind::NotifyEnableFailed,
                Some(Box::new(err)),
                format!("enabling notifications for {}", self.uuid),
            )
        })
    }

    /// Disables notifications for this characteristic on the device.
    ///
    /// Once this succeeds the notification handler is no longer invoked, even for value-changed events already
    /// queued by the transport. The handler stays installed for a later [`enable_notifications`][Self::enable_notifications].
    pub async fn disable_notifications(&self) -> Result<()> {
        let (inner, owner) = self.live()?;
        let result = owner.transport.write_cccd(&inner.handle, CccdValue::None).await;
        owner.ensure_live(inner.epoch)?;
        result.map_err(|err| {
            Error::new(
                ErrorKind::NotifyDisableFailed,
                Some(Box::new(err)),
                format!("disabling notifications for {}", self.uuid),
            )
        })?;

        inner.retire(&owner.transport);
        Ok(())
    }

    /// Installs the handler for notifications from this characteristic, replacing any previous handler.
    ///
    /// This subscribes to value-changed events from the transport but does not enable notifications on the device.
    pub fn on_notification<F>(&self, handler: F) -> Result<()>
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        let (inner, owner) = self.live()?;
        inner.on_value.set(Arc::new(handler));
        inner.subscribe(&owner.transport).map(|_| ()).map_err(|err| {
            Error::new(
                ErrorKind::NotifyEnableFailed,
                Some(Box::new(err)),
                format!("subscribing to {}", self.uuid),
            )
        })
    }
}

impl<T: Transport> CharacteristicInner<T> {
    pub(crate) fn new(uuid: Uuid, handle: T::Characteristic, owner: Weak<ConnectionInner<T>>, epoch: u64) -> Self {
        CharacteristicInner {
            uuid,
            handle,
            owner,
            epoch,
            on_value: Slot::new(),
            notify: Mutex::new(NotifyState {
                subscription: None,
                active: None,
                next_id: 0,
            }),
        }
    }

    /// Ensures a value-changed subscription exists. Returns `true` if this call created it.
    fn subscribe(self: &Arc<Self>, transport: &T) -> Result<bool, TransportError> {
        let id = {
            let mut state = lock(&self.notify);
            if state.active.is_some() {
                return Ok(false);
            }
            let id = state.next_id;
            state.next_id += 1;
            state.active = Some(id);
            id
        };

        let weak = Arc::downgrade(self);
        let handler: ValueHandler = Arc::new(move |value: &[u8]| {
            if let Some(inner) = weak.upgrade() {
                inner.on_value_changed(id, value);
            }
        });

        match transport.subscribe_value_changed(&self.handle, handler) {
            Ok(subscription) => {
                let mut state = lock(&self.notify);
                if state.active == Some(id) {
                    state.subscription = Some(subscription);
                    return Ok(true);
                }
                drop(state);

                // Retired while subscribing
                if let Err(err) = transport.unsubscribe_value_changed(&self.handle, subscription) {
                    warn!("Error removing value change event handler: {:?}", err);
                }
                Ok(false)
            }
            Err(err) => {
                let mut state = lock(&self.notify);
                if state.active == Some(id) {
                    state.active = None;
                }
                Err(err)
            }
        }
    }

    fn on_value_changed(&self, id: u64, value: &[u8]) {
        if lock(&self.notify).active != Some(id) {
            return;
        }

        if let Some(handler) = self.on_value.get() {
            handler(value);
        }
    }

    /// Revokes the value-changed subscription, if any
    pub(crate) fn retire(&self, transport: &T) {
        let subscription = {
            let mut state = lock(&self.notify);
            state.active = None;
            state.subscription.take()
        };

        if let Some(subscription) = subscription {
            if let Err(err) = transport.unsubscribe_value_changed(&self.handle, subscription) {
                warn!("Error removing value change event handler: {:?}", err);
            }
        }
    }
}
