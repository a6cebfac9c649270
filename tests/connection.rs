use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::FutureExt;
use gattlink::btuuid::{characteristics, services};
use gattlink::error::ErrorKind;
use gattlink::fake::{FakeTransport, Operation, Peripheral, RecordedWrite};
use gattlink::transport::{CccdValue, TransportError};
use gattlink::*;

const DEVICE: DeviceAddress = DeviceAddress::new([0xa4, 0x34, 0xf1, 0x00, 0x11, 0x22]);

const HEART_RATE: &str = "0000180d-0000-1000-8000-00805f9b34fb";
const HEART_RATE_MEASUREMENT: &str = "00002a37-0000-1000-8000-00805f9b34fb";

fn heart_rate_monitor() -> Arc<FakeTransport> {
    let transport = Arc::new(FakeTransport::new());
    transport.add_peripheral(
        DEVICE,
        Peripheral::new()
            .with_service(
                services::HEART_RATE,
                &[
                    characteristics::HEART_RATE_MEASUREMENT,
                    characteristics::HEART_RATE_CONTROL_POINT,
                ],
            )
            .with_service(services::BATTERY, &[characteristics::BATTERY_LEVEL]),
    );
    transport
}

fn counting_observer(connection: &Connection<FakeTransport>) -> Arc<Mutex<Vec<DisconnectReason>>> {
    let reasons = Arc::new(Mutex::new(Vec::new()));
    let sink = reasons.clone();
    connection.on_disconnect(move |reason| sink.lock().unwrap().push(reason));
    reasons
}

async fn connected(transport: &Arc<FakeTransport>) -> Connection<FakeTransport> {
    let connection = Connection::new(transport.clone(), DEVICE, AddressType::Random);
    connection.connect().await.unwrap();
    connection
}

#[tokio::test]
async fn connect_discovers_the_gatt_database() {
    let transport = Arc::new(FakeTransport::new());
    transport.add_peripheral(
        DEVICE,
        Peripheral::new().with_service(services::HEART_RATE, &[characteristics::HEART_RATE_MEASUREMENT]),
    );

    let options = ConnectionOptions::from_pairs(&[("mac", "a4:34:f1:00:11:22")]).unwrap();
    let connection = Connection::with_options(transport.clone(), &options);
    assert_eq!(connection.state(), ConnectionState::Idle);

    connection.connect().await.unwrap();

    assert!(connection.is_connected());
    assert!(connection.service_exists(HEART_RATE));
    assert!(!connection.service_exists("0000180f-0000-1000-8000-00805f9b34fb"));
    assert!(!connection.service_exists("180d"));
    assert_eq!(connection.services(), vec![services::HEART_RATE]);

    let characteristic = connection.find_characteristic(HEART_RATE_MEASUREMENT).unwrap();
    assert_eq!(characteristic.uuid(), characteristics::HEART_RATE_MEASUREMENT);
    assert!(connection
        .find_characteristic("00002a19-0000-1000-8000-00805f9b34fb")
        .is_none());
    assert!(connection.find_characteristic("garbage").is_none());
    assert_eq!(connection.characteristics(), vec![characteristic]);

    assert_eq!(transport.open_devices(), 1);
    assert_eq!(transport.status_subscriptions(), 1);
}

#[tokio::test]
async fn unknown_device_is_not_found() {
    let transport = Arc::new(FakeTransport::new());
    let connection = Connection::new(transport.clone(), DEVICE, AddressType::Public);
    let reasons = counting_observer(&connection);

    let err = connection.connect().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeviceNotFound);
    assert_eq!(connection.state(), ConnectionState::Disconnected);
    assert!(connection.characteristics().is_empty());
    assert_eq!(transport.status_subscriptions(), 0);
    assert!(reasons.lock().unwrap().is_empty());
}

#[tokio::test]
async fn resolution_failure_is_not_found() {
    let transport = heart_rate_monitor();
    transport.fail(Operation::ResolveDevice, TransportError::Unreachable);
    let connection = Connection::new(transport.clone(), DEVICE, AddressType::Random);

    let err = connection.connect().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeviceNotFound);
    assert!(std::error::Error::source(&err).is_some());
    assert_eq!(transport.open_devices(), 0);
}

#[tokio::test]
async fn service_discovery_failure_releases_the_device() {
    let transport = heart_rate_monitor();
    transport.fail(Operation::DiscoverServices, TransportError::AccessDenied);
    let connection = Connection::new(transport.clone(), DEVICE, AddressType::Random);
    let reasons = counting_observer(&connection);

    let err = connection.connect().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ServiceDiscoveryFailed);
    assert_eq!(connection.state(), ConnectionState::Disconnected);
    assert!(!connection.service_exists(HEART_RATE));
    assert_eq!(transport.open_devices(), 0);
    assert_eq!(transport.status_subscriptions(), 0);
    assert!(reasons.lock().unwrap().is_empty());
}

#[tokio::test]
async fn characteristic_discovery_failure_aborts_connect() {
    let transport = heart_rate_monitor();
    transport.fail(Operation::DiscoverCharacteristics, TransportError::Unreachable);
    let connection = Connection::new(transport.clone(), DEVICE, AddressType::Random);

    let err = connection.connect().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CharacteristicDiscoveryFailed);
    assert_eq!(connection.state(), ConnectionState::Disconnected);
    assert!(connection.find_characteristic(HEART_RATE_MEASUREMENT).is_none());
    assert!(connection.services().is_empty());
    assert_eq!(transport.open_devices(), 0);
}

#[tokio::test]
async fn partial_characteristic_discovery_failure_discards_handles() {
    let transport = heart_rate_monitor();
    transport.fail_service(services::BATTERY, TransportError::Unreachable);
    let connection = Connection::new(transport.clone(), DEVICE, AddressType::Random);

    let err = connection.connect().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CharacteristicDiscoveryFailed);
    assert_eq!(connection.state(), ConnectionState::Disconnected);
    assert!(connection.find_characteristic(HEART_RATE_MEASUREMENT).is_none());
    assert!(connection.characteristics().is_empty());
    assert_eq!(transport.value_subscriptions(), 0);
    assert_eq!(transport.open_devices(), 0);
    assert_eq!(transport.status_subscriptions(), 0);
}

#[tokio::test]
async fn disconnect_invalidates_characteristics() {
    let transport = heart_rate_monitor();
    let connection = connected(&transport).await;
    let reasons = counting_observer(&connection);
    let characteristic = connection.find_characteristic(HEART_RATE_MEASUREMENT).unwrap();

    connection.disconnect();
    connection.disconnect();

    assert_eq!(*reasons.lock().unwrap(), vec![DisconnectReason::Requested]);
    assert_eq!(connection.state(), ConnectionState::Disconnected);
    assert!(!connection.service_exists(HEART_RATE));
    assert!(connection.find_characteristic(HEART_RATE_MEASUREMENT).is_none());

    assert_eq!(characteristic.read().await.unwrap_err().kind(), ErrorKind::NotConnected);
    let err = characteristic.write(&[1], WriteKind::WithResponse).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotConnected);
    let err = characteristic.enable_notifications().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotConnected);
    let err = characteristic.disable_notifications().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotConnected);
    let err = characteristic.on_notification(|_| {}).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotConnected);

    assert!(transport.writes().is_empty());
    assert!(transport.cccd_writes().is_empty());
    assert_eq!(transport.open_devices(), 0);
    assert_eq!(transport.status_subscriptions(), 0);
}

#[tokio::test]
async fn remote_disconnect_fires_observer_once() {
    let transport = heart_rate_monitor();
    let connection = connected(&transport).await;
    let reasons = counting_observer(&connection);
    let characteristic = connection.find_characteristic(HEART_RATE_MEASUREMENT).unwrap();

    transport.drop_connection(DEVICE);
    connection.disconnect();

    assert_eq!(*reasons.lock().unwrap(), vec![DisconnectReason::Remote]);
    assert_eq!(connection.state(), ConnectionState::Disconnected);

    assert_eq!(characteristic.read().await.unwrap_err().kind(), ErrorKind::NotConnected);
    let err = characteristic.write(&[1], WriteKind::WithResponse).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotConnected);
    let err = characteristic.enable_notifications().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotConnected);
    let err = characteristic.disable_notifications().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotConnected);
    let err = characteristic.on_notification(|_| {}).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotConnected);

    assert!(transport.writes().is_empty());
    assert!(transport.cccd_writes().is_empty());
    assert_eq!(transport.open_devices(), 0);
}

#[tokio::test]
async fn observer_is_replaced_not_stacked() {
    let transport = heart_rate_monitor();
    let connection = connected(&transport).await;
    let first = counting_observer(&connection);
    let second = counting_observer(&connection);

    connection.disconnect();

    assert!(first.lock().unwrap().is_empty());
    assert_eq!(second.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn read_and_write() {
    let transport = heart_rate_monitor();
    let connection = connected(&transport).await;
    transport.set_value(DEVICE, characteristics::BATTERY_LEVEL, &[87]);

    let battery = connection.characteristic(characteristics::BATTERY_LEVEL).unwrap();
    assert_eq!(battery.read().await.unwrap(), vec![87]);

    let control_point = connection.characteristic(characteristics::HEART_RATE_CONTROL_POINT).unwrap();
    assert_eq!(control_point.read().await.unwrap(), Vec::<u8>::new());
    control_point.write(&[0x01], WriteKind::WithResponse).await.unwrap();
    control_point.write(&[0x02, 0x03], WriteKind::WithoutResponse).await.unwrap();

    assert_eq!(
        transport.writes(),
        vec![
            RecordedWrite {
                address: DEVICE,
                characteristic: characteristics::HEART_RATE_CONTROL_POINT,
                value: vec![0x01],
                kind: WriteKind::WithResponse,
            },
            RecordedWrite {
                address: DEVICE,
                characteristic: characteristics::HEART_RATE_CONTROL_POINT,
                value: vec![0x02, 0x03],
                kind: WriteKind::WithoutResponse,
            },
        ]
    );
    assert_eq!(control_point.read().await.unwrap(), vec![0x02, 0x03]);
}

#[tokio::test]
async fn transport_failures_map_to_operation_errors() {
    let transport = heart_rate_monitor();
    let connection = connected(&transport).await;
    let characteristic = connection.find_characteristic(HEART_RATE_MEASUREMENT).unwrap();

    transport.fail(Operation::Read, TransportError::Unreachable);
    transport.fail(Operation::Write, TransportError::Protocol(error::AttError::from(0x03)));
    transport.fail(Operation::WriteCccd, TransportError::AccessDenied);

    assert_eq!(characteristic.read().await.unwrap_err().kind(), ErrorKind::ReadFailed);
    let err = characteristic.write(&[1], WriteKind::WithResponse).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WriteFailed);
    assert_eq!(
        err.att_error(),
        Some(error::AttError::Known(error::AttErrorCode::WriteNotPermitted))
    );
    let err = characteristic.enable_notifications().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotifyEnableFailed);
    assert_eq!(err.att_error(), None);
    let err = characteristic.disable_notifications().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotifyDisableFailed);

    assert!(connection.is_connected());
}

#[tokio::test]
async fn failed_enable_removes_its_subscription() {
    let transport = heart_rate_monitor();
    let connection = connected(&transport).await;
    let characteristic = connection.find_characteristic(HEART_RATE_MEASUREMENT).unwrap();
    transport.fail(Operation::WriteCccd, TransportError::AccessDenied);

    let err = characteristic.enable_notifications().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotifyEnableFailed);
    assert_eq!(transport.value_subscriptions(), 0);

    transport.clear_failure(Operation::WriteCccd);
    characteristic.enable_notifications().await.unwrap();
    assert_eq!(transport.value_subscriptions(), 1);
}

#[tokio::test]
async fn failed_enable_keeps_installed_handler() {
    let transport = heart_rate_monitor();
    let connection = connected(&transport).await;
    let characteristic = connection.find_characteristic(HEART_RATE_MEASUREMENT).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    characteristic
        .on_notification(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    transport.fail(Operation::WriteCccd, TransportError::AccessDenied);

    let err = characteristic.enable_notifications().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotifyEnableFailed);
    assert_eq!(transport.value_subscriptions(), 1);

    assert_eq!(transport.notify(DEVICE, characteristics::HEART_RATE_MEASUREMENT, &[0]), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn notifications_stop_after_disable() {
    let transport = heart_rate_monitor();
    let connection = connected(&transport).await;
    let characteristic = connection.find_characteristic(HEART_RATE_MEASUREMENT).unwrap();

    let values = Arc::new(Mutex::new(Vec::new()));
    let sink = values.clone();
    characteristic
        .on_notification(move |value| sink.lock().unwrap().push(value.to_vec()))
        .unwrap();
    characteristic.enable_notifications().await.unwrap();
    assert_eq!(transport.value_subscriptions(), 1);

    transport.notify(DEVICE, characteristics::HEART_RATE_MEASUREMENT, &[0x06, 0x48]);
    transport.notify(DEVICE, characteristics::BATTERY_LEVEL, &[0x50]);

    characteristic.disable_notifications().await.unwrap();
    assert_eq!(transport.value_subscriptions(), 0);
    assert_eq!(transport.notify(DEVICE, characteristics::HEART_RATE_MEASUREMENT, &[0x06, 0x49]), 0);

    assert_eq!(*values.lock().unwrap(), vec![vec![0x06, 0x48]]);
    assert_eq!(
        transport.cccd_writes(),
        vec![
            (characteristics::HEART_RATE_MEASUREMENT, CccdValue::Notify),
            (characteristics::HEART_RATE_MEASUREMENT, CccdValue::None),
        ]
    );

    characteristic.enable_notifications().await.unwrap();
    transport.notify(DEVICE, characteristics::HEART_RATE_MEASUREMENT, &[0x06, 0x4a]);
    assert_eq!(values.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn notification_handler_is_replaced() {
    let transport = heart_rate_monitor();
    let connection = connected(&transport).await;
    let characteristic = connection.find_characteristic(HEART_RATE_MEASUREMENT).unwrap();

    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));

    let counter = first.clone();
    characteristic
        .on_notification(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    let counter = second.clone();
    characteristic
        .on_notification(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    characteristic.enable_notifications().await.unwrap();

    assert_eq!(transport.notify(DEVICE, characteristics::HEART_RATE_MEASUREMENT, &[0]), 1);
    assert_eq!(first.load(Ordering::SeqCst), 0);
    assert_eq!(second.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn disconnect_retires_value_subscriptions() {
    let transport = heart_rate_monitor();
    let connection = connected(&transport).await;
    let characteristic = connection.find_characteristic(HEART_RATE_MEASUREMENT).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    characteristic
        .on_notification(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    characteristic.enable_notifications().await.unwrap();

    connection.disconnect();
    assert_eq!(transport.value_subscriptions(), 0);
    assert_eq!(transport.notify(DEVICE, characteristics::HEART_RATE_MEASUREMENT, &[0]), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn closed_connection_requires_reset() {
    let transport = heart_rate_monitor();
    let connection = connected(&transport).await;
    let stale = connection.find_characteristic(HEART_RATE_MEASUREMENT).unwrap();
    let reasons = counting_observer(&connection);

    connection.disconnect();
    let err = connection.connect().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    connection.reset();
    assert_eq!(connection.state(), ConnectionState::Idle);
    connection.connect().await.unwrap();

    let fresh = connection.find_characteristic(HEART_RATE_MEASUREMENT).unwrap();
    assert_ne!(stale, fresh);
    assert_eq!(stale.read().await.unwrap_err().kind(), ErrorKind::NotConnected);
    fresh.read().await.unwrap();
    assert_eq!(reasons.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn reset_of_connected_connection_disconnects() {
    let transport = heart_rate_monitor();
    let connection = connected(&transport).await;
    let reasons = counting_observer(&connection);

    connection.reset();

    assert_eq!(connection.state(), ConnectionState::Idle);
    assert_eq!(*reasons.lock().unwrap(), vec![DisconnectReason::Requested]);
    assert_eq!(transport.open_devices(), 0);
}

#[tokio::test]
async fn reconnect_reuses_resolved_device() {
    let transport = heart_rate_monitor();
    let resolutions = Arc::new(AtomicUsize::new(0));
    let counter = resolutions.clone();
    transport.on_call(Operation::ResolveDevice, move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let connection = connected(&transport).await;
    let stale = connection.find_characteristic(HEART_RATE_MEASUREMENT).unwrap();
    connection.connect().await.unwrap();

    assert_eq!(resolutions.load(Ordering::SeqCst), 1);
    assert_eq!(transport.open_devices(), 1);
    assert_eq!(transport.status_subscriptions(), 1);
    assert!(connection.is_connected());
    assert_eq!(stale.read().await.unwrap_err().kind(), ErrorKind::NotConnected);
    assert!(connection.find_characteristic(HEART_RATE_MEASUREMENT).is_some());
}

#[tokio::test]
async fn failed_rediscovery_reports_disconnect() {
    let transport = heart_rate_monitor();
    let connection = connected(&transport).await;
    let reasons = counting_observer(&connection);
    let stale = connection.find_characteristic(HEART_RATE_MEASUREMENT).unwrap();
    transport.fail(Operation::DiscoverServices, TransportError::Unreachable);

    let err = connection.connect().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ServiceDiscoveryFailed);
    assert_eq!(connection.state(), ConnectionState::Disconnected);
    assert_eq!(*reasons.lock().unwrap(), vec![DisconnectReason::Requested]);
    assert_eq!(stale.read().await.unwrap_err().kind(), ErrorKind::NotConnected);
    assert_eq!(transport.open_devices(), 0);
    assert_eq!(transport.status_subscriptions(), 0);
}

#[tokio::test]
async fn first_characteristic_per_uuid_wins() {
    let transport = Arc::new(FakeTransport::new());
    transport.add_peripheral(
        DEVICE,
        Peripheral::new()
            .with_service(services::BATTERY, &[characteristics::BATTERY_LEVEL])
            .with_service(services::HEART_RATE, &[characteristics::BATTERY_LEVEL]),
    );
    transport.set_value(DEVICE, characteristics::BATTERY_LEVEL, &[42]);

    let connection = connected(&transport).await;

    assert_eq!(connection.characteristics().len(), 1);
    let battery = connection.characteristic(characteristics::BATTERY_LEVEL).unwrap();
    assert_eq!(battery.read().await.unwrap(), vec![42]);
}

#[tokio::test]
async fn concurrent_connect_is_rejected() {
    let transport = heart_rate_monitor();
    transport.stall(Operation::DiscoverServices);
    let connection = Connection::new(transport.clone(), DEVICE, AddressType::Random);

    let mut first = Box::pin(connection.connect());
    assert!((&mut first).now_or_never().is_none());
    assert_eq!(
        connection.state(),
        ConnectionState::Discovering(DiscoveryStep::Services)
    );

    let second = connection.connect().now_or_never().unwrap();
    assert_eq!(second.unwrap_err().kind(), ErrorKind::InvalidState);

    // Operations issued before discovery completes fail fast
    assert!(connection.find_characteristic(HEART_RATE_MEASUREMENT).is_none());
    drop(first);
}

#[tokio::test]
async fn dropping_connect_releases_resources() {
    let transport = heart_rate_monitor();
    transport.stall(Operation::DiscoverServices);
    let connection = Connection::new(transport.clone(), DEVICE, AddressType::Random);
    let reasons = counting_observer(&connection);

    assert!(connection.connect().now_or_never().is_none());

    assert_eq!(connection.state(), ConnectionState::Disconnected);
    assert_eq!(transport.open_devices(), 0);
    assert_eq!(transport.status_subscriptions(), 0);
    assert!(reasons.lock().unwrap().is_empty());
}

#[tokio::test]
async fn remote_disconnect_during_discovery() {
    let transport = heart_rate_monitor();
    let weak = Arc::downgrade(&transport);
    transport.on_call(Operation::DiscoverServices, move || {
        if let Some(transport) = weak.upgrade() {
            transport.drop_connection(DEVICE);
        }
    });
    let connection = Connection::new(transport.clone(), DEVICE, AddressType::Random);
    let reasons = counting_observer(&connection);

    let err = connection.connect().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::NotConnected);
    assert_eq!(connection.state(), ConnectionState::Disconnected);
    assert!(connection.characteristics().is_empty());
    assert_eq!(*reasons.lock().unwrap(), vec![DisconnectReason::Remote]);
    assert_eq!(transport.open_devices(), 0);
    assert_eq!(transport.status_subscriptions(), 0);
}

#[tokio::test]
async fn dropping_the_connection_releases_resources() {
    let transport = heart_rate_monitor();
    let connection = connected(&transport).await;
    let characteristic = connection.find_characteristic(HEART_RATE_MEASUREMENT).unwrap();
    characteristic.on_notification(|_| {}).unwrap();
    let reasons = counting_observer(&connection);

    drop(connection);

    assert_eq!(transport.open_devices(), 0);
    assert_eq!(transport.status_subscriptions(), 0);
    assert_eq!(transport.value_subscriptions(), 0);
    assert!(reasons.lock().unwrap().is_empty());
    assert_eq!(characteristic.read().await.unwrap_err().kind(), ErrorKind::NotConnected);
}
