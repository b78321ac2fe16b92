use std::time::Duration;

use anyhow::Context as _;
use cgwacs::tree::MqttTree;
use cgwacs_meter::{
    ProcessInfo,
    sensor::{AcSensor, Identification},
    settings::{AcSensorSettings, Position, Settings},
};
use clap::Parser;

#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Communication port of the meter, eg. /dev/ttyUSB0
    port: String,

    /// MQTT broker address
    #[arg(short, long, env = "CGWACS_BROKER", default_value = "127.0.0.1:1883")]
    broker: String,

    /// Log level, 0 (trace) to 6 (off)
    #[arg(short, long, default_value_t = 2, value_parser = clap::value_parser!(u8).range(0..=6))]
    debug: u8,

    /// Include timestamps in log lines
    #[arg(short, long)]
    timestamp: bool,

    /// Role the meter is published under
    #[arg(long, default_value = cgwacs_meter::settings::GRID)]
    service_type: String,

    /// 0 = AC input 1, 1 = AC output, 2 = AC input 2
    #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u16).range(0..=2))]
    position: u16,

    #[arg(long, default_value = "")]
    custom_name: String,

    #[arg(long, default_value = "")]
    serial: String,

    #[arg(long, default_value = "")]
    firmware_version: String,

    #[arg(long, default_value = "")]
    product_name: String,

    #[arg(long, default_value_t = 0)]
    device_type: i64,

    /// Export interval in milliseconds
    #[arg(long, default_value_t = 1000)]
    update_interval: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    cgwacs::log::init(cgwacs::log::level_from_verbosity(args.debug), args.timestamp);

    let process = ProcessInfo::current();
    tracing::info!(name = %process.name, version = %process.version, "Started");
    tracing::info!(port = %args.port, "Connecting to meter");

    let tree = MqttTree::connect(&process.client_id(&args.port), &args.broker)
        .await
        .context("failed to connect to mqtt broker")?;

    tokio::spawn({
        let tree = tree.clone();

        async move {
            if let Err(e) = tree.handle().await {
                tracing::error!("MQTT connection lost: {e}");
            }
        }
    });

    let sensor = AcSensor::new(&args.port);
    sensor.identify(&Identification {
        product_name: args.product_name.into(),
        firmware_version: args.firmware_version.into(),
        serial: args.serial.into(),
        device_type: args.device_type,
    })?;

    let position = Position::from_ordinal(args.position).unwrap_or(Position::AcInput1);
    let sensor_settings = AcSensorSettings::new(&args.service_type, position, &args.custom_name);
    let settings = Settings::new();

    let mut bridges = cgwacs_meter::bridge(
        tree,
        &sensor,
        &sensor_settings,
        &settings,
        &process,
        Duration::from_millis(args.update_interval),
    )
    .await
    .context("failed to start bridges")?;

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("failed to listen for ctrl-c")?;
            tracing::info!("Interrupted, shutting down");
        }
        _ = bridges.ac_sensor.terminated() => {
            tracing::warn!("AC sensor bridge terminated");
        }
    }

    drop(sensor);
    bridges.shutdown().await;

    Ok(())
}
