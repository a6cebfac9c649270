//! Advertisement scanning and per-device aggregation.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, trace, warn};

use crate::dispatch::Slot;
use crate::error::ErrorKind;
use crate::transport::{FrameSink, Transport};
use crate::util::lock;
use crate::{btuuid, DeviceAddress, Error, ManufacturerData, Result, Uuid};

/// The kind of packet an [`AdvertisementFrame`] was received in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// An advertising packet (connectable or not)
    Advertisement,
    /// A scan response to an active scan request
    ScanResponse,
}

/// A raw advertising packet as delivered by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisementFrame {
    /// The sender of the packet
    pub address: DeviceAddress,
    /// Which kind of packet this is
    pub kind: FrameKind,
    /// Advertised GATT service UUIDs in their canonical text form
    pub service_uuids: Vec<String>,
    /// Manufacturer specific data sections
    pub manufacturer_data: Vec<ManufacturerData>,
    /// The (possibly shortened) local name of the device
    pub local_name: Option<String>,
    /// The signal strength in dBm of the received packet
    pub rssi: i16,
}

/// Everything learned about one device during a scan session.
///
/// Advertised services accumulate across advertising packets for the lifetime of the session. Manufacturer data is
/// replaced wholesale by every scan response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanRecord {
    services: HashSet<Uuid>,
    manufacturer_data: HashMap<u16, Vec<u8>>,
}

impl ScanRecord {
    /// The GATT services advertised by the device so far
    pub fn services(&self) -> impl Iterator<Item = &Uuid> + '_ {
        self.services.iter()
    }

    /// Whether the device has advertised `service`
    pub fn has_service(&self, service: &Uuid) -> bool {
        self.services.contains(service)
    }

    /// Manufacturer data from the most recent scan response, keyed by company identifier
    pub fn manufacturer_data(&self) -> &HashMap<u16, Vec<u8>> {
        &self.manufacturer_data
    }

    fn merge_services(&mut self, uuids: &[String]) {
        for text in uuids {
            match btuuid::parse(text) {
                Some(uuid) => {
                    self.services.insert(uuid);
                }
                None => trace!("ignoring malformed service UUID {:?}", text),
            }
        }
    }

    fn replace_manufacturer_data(&mut self, entries: Vec<ManufacturerData>) {
        self.manufacturer_data = entries.into_iter().map(|x| (x.company_id, x.data)).collect();
    }
}

/// A device reported by a scan response.
///
/// `record` is a snapshot of the device's [`ScanRecord`] taken when the scan response arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    /// The device that sent the scan response
    pub address: DeviceAddress,
    /// The local name carried by the scan response
    pub local_name: Option<String>,
    /// The signal strength in dBm of the scan response
    pub rssi: i16,
    /// The device's aggregated advertising data
    pub record: ScanRecord,
}

/// Active or passive scanning
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum ScanMode {
    /// Send scan requests; devices answer with scan responses
    #[default]
    Active,
    /// Only listen. Passive scans receive no scan responses and therefore report no results.
    Passive,
}

/// Parameters for a scan session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ScanConfig {
    /// The scanning mode requested from the transport
    pub mode: ScanMode,
    /// If not empty, only devices that have advertised at least one of these services are reported
    pub services: Vec<Uuid>,
}

type ScanHandler = dyn Fn(&ScanResult) + Send + Sync;

/// Aggregates advertising packets into per-device records and reports scan results.
///
/// At most one scan session is active at a time. Records are created when a device is first seen and discarded when
/// the session stops. Dropping the `Scanner` stops any active session.
pub struct Scanner<T: Transport> {
    transport: Arc<T>,
    shared: Arc<ScanShared>,
}

struct ScanShared {
    state: Mutex<ScanState>,
    observer: Slot<ScanHandler>,
}

#[derive(Default)]
struct ScanState {
    next_session: u64,
    session: Option<ScanSession>,
}

struct ScanSession {
    id: u64,
    filter: Vec<Uuid>,
    records: HashMap<DeviceAddress, ScanRecord>,
}

impl<T: Transport> Scanner<T> {
    /// Creates a scanner driving `transport`
    pub fn new(transport: Arc<T>) -> Self {
        Scanner {
            transport,
            shared: Arc::new(ScanShared {
                state: Mutex::new(ScanState::default()),
                observer: Slot::new(),
            }),
        }
    }

    /// Installs the handler that receives scan results, replacing any previous handler.
    ///
    /// The handler is invoked on whichever thread the transport delivers advertisement frames on.
    pub fn set_observer<F>(&self, handler: F)
    where
        F: Fn(&ScanResult) + Send + Sync + 'static,
    {
        self.shared.observer.set(Arc::new(handler));
    }

    /// Removes the scan result handler. Aggregation continues but no results are reported.
    pub fn clear_observer(&self) {
        self.shared.observer.clear();
    }

    /// Starts a scan session.
    pub fn start(&self, config: &ScanConfig) -> Result<()> {
        let id = {
            let mut state = lock(&self.shared.state);
            if state.session.is_some() {
                return Err(ErrorKind::AlreadyScanning.into());
            }
            let id = state.next_session;
            state.next_session += 1;
            state.session = Some(ScanSession {
                id,
                filter: config.services.clone(),
                records: HashMap::new(),
            });
            id
        };

        let weak = Arc::downgrade(&self.shared);
        let sink: FrameSink = Arc::new(move |frame: AdvertisementFrame| {
            if let Some(shared) = Weak::upgrade(&weak) {
                shared.on_frame(id, frame);
            }
        });

        if let Err(err) = self.transport.start_scan(config, sink) {
            let mut state = lock(&self.shared.state);
            if state.session.as_ref().is_some_and(|x| x.id == id) {
                state.session = None;
            }
            return Err(Error::new(ErrorKind::Other, Some(Box::new(err)), "starting scan"));
        }

        debug!("scan session {} started ({:?})", id, config.mode);
        Ok(())
    }

    /// Stops the active scan session and discards every per-device record. Does nothing if no session is active.
    pub fn stop(&self) {
        let Some(session) = lock(&self.shared.state).session.take() else {
            return;
        };

        if let Err(err) = self.transport.stop_scan() {
            warn!("Error stopping scan: {:?}", err);
        }

        debug!(
            "scan session {} stopped, discarded {} device records",
            session.id,
            session.records.len()
        );
    }

    /// Whether a scan session is active
    pub fn is_scanning(&self) -> bool {
        lock(&self.shared.state).session.is_some()
    }
}

impl<T: Transport> Drop for Scanner<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<T: Transport> std::fmt::Debug for Scanner<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scanner")
            .field("scanning", &self.is_scanning())
            .field("observer", &self.shared.observer)
            .finish()
    }
}

impl ScanShared {
    fn on_frame(&self, session_id: u64, frame: AdvertisementFrame) {
        let observer = self.observer.get();

        let result = {
            let mut state = lock(&self.state);
            let Some(session) = state.session.as_mut().filter(|x| x.id == session_id) else {
                trace!("dropping frame from {} delivered outside its scan session", frame.address);
                return;
            };

            let record = session.records.entry(frame.address).or_default();
            match frame.kind {
                FrameKind::Advertisement => {
                    record.merge_services(&frame.service_uuids);
                    None
                }
                FrameKind::ScanResponse => {
                    record.replace_manufacturer_data(frame.manufacturer_data);
                    let wanted = session.filter.is_empty() || session.filter.iter().any(|x| record.has_service(x));
                    (observer.is_some() && wanted).then(|| ScanResult {
                        address: frame.address,
                        local_name: frame.local_name.filter(|x| !x.is_empty()),
                        rssi: frame.rssi,
                        record: record.clone(),
                    })
                }
            }
        };

        if let (Some(result), Some(observer)) = (result, observer) {
            observer(&result);
        }
    }
}
