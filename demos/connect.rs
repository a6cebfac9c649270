use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use gattlink::btuuid::{characteristics, services};
use gattlink::fake::{FakeTransport, Peripheral};
use gattlink::{Connection, ConnectionOptions, WriteKind};
use tracing::info;
use tracing::metadata::LevelFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
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

    let mac = std::env::args().nth(1).unwrap_or_else(|| "a4:34:f1:00:11:22".to_string());
    let options = ConnectionOptions::from_pairs(&[("mac", mac.as_str()), ("address-type", "random")])?;

    let transport = Arc::new(FakeTransport::new());
    transport.add_peripheral(
        options.address,
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
    transport.set_value(options.address, characteristics::BATTERY_LEVEL, &[93]);

    let connection = Connection::with_options(transport.clone(), &options);
    connection.on_disconnect(|reason| info!("disconnected: {:?}", reason));

    connection.connect().await?;
    info!("connected!");

    let battery = connection
        .characteristic(characteristics::BATTERY_LEVEL)
        .ok_or("battery level characteristic not found")?;
    info!("battery level: {:?}", battery.read().await?);

    let measurement = connection
        .find_characteristic("00002a37-0000-1000-8000-00805f9b34fb")
        .ok_or("heart rate measurement characteristic not found")?;
    measurement.on_notification(|value| info!("heart rate measurement: {:?}", value))?;
    measurement.enable_notifications().await?;

    let control_point = connection
        .characteristic(characteristics::HEART_RATE_CONTROL_POINT)
        .ok_or("heart rate control point characteristic not found")?;
    control_point.write(&[0x01], WriteKind::WithResponse).await?;

    for bpm in [72u8, 75, 74] {
        transport.notify(options.address, characteristics::HEART_RATE_MEASUREMENT, &[0x00, bpm]);
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    measurement.disable_notifications().await?;
    transport.drop_connection(options.address);

    match measurement.read().await {
        Ok(_) => info!("unexpectedly still connected"),
        Err(err) => info!("after disconnect: {}", err),
    }

    Ok(())
}
