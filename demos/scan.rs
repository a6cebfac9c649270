use std::error::Error;
use std::sync::Arc;

use gattlink::fake::FakeTransport;
use gattlink::{AdvertisementFrame, DeviceAddress, FrameKind, ManufacturerData, ScanConfig, ScanResult, Scanner};
use tracing::info;
use tracing::metadata::LevelFilter;

fn main() -> Result<(), Box<dyn Error>> {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    // Options are given as key=value, e.g. `scan-type=active services=0000180d-0000-1000-8000-00805f9b34fb`
    let pairs: Vec<(String, String)> = std::env::args()
        .skip(1)
        .map(|arg| match arg.split_once('=') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => (arg, String::new()),
        })
        .collect();
    let config = ScanConfig::from_pairs(&pairs)?;

    let transport = Arc::new(FakeTransport::new());
    let scanner = Scanner::new(transport.clone());
    scanner.set_observer(|result: &ScanResult| {
        info!(
            "{} {} ({}dBm): services {:?}, manufacturer data {:?}",
            result.address,
            result.local_name.as_deref().unwrap_or("(unknown)"),
            result.rssi,
            result.record.services().collect::<Vec<_>>(),
            result.record.manufacturer_data()
        );
    });

    info!("starting scan");
    scanner.start(&config)?;
    info!("scan started");

    let address: DeviceAddress = "d5:7b:c3:1e:04:9a".parse()?;
    for (kind, payload) in [
        (FrameKind::Advertisement, 0x01),
        (FrameKind::ScanResponse, 0x02),
        (FrameKind::Advertisement, 0x03),
        (FrameKind::ScanResponse, 0x04),
    ] {
        transport.emit_frame(AdvertisementFrame {
            address,
            kind,
            service_uuids: vec!["0000180d-0000-1000-8000-00805f9b34fb".to_string()],
            manufacturer_data: vec![ManufacturerData {
                company_id: 0x067e,
                data: vec![payload],
            }],
            local_name: Some("MetaWear".to_string()),
            rssi: -58,
        });
    }

    scanner.stop();
    info!("scan stopped");

    Ok(())
}
