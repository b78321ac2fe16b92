use std::{sync::Arc, time::Duration};

use cgwacs::{common::sanitize_connection, session::SessionHandle, tree::TreeClient};
use compact_str::{CompactString, format_compact};

pub mod ac_sensor_bridge;
pub mod hub4_bridge;
pub mod sensor;
pub mod settings;

use self::{
    sensor::AcSensor,
    settings::{AcSensorSettings, Settings},
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("cgwacs error: {0}")]
    Cgwacs(#[from] cgwacs::Error),
    #[error("bad service name: {0}")]
    BadServiceName(&'static str),
}

/// Identifies the process publishing a service, under `/Mgmt`.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub name: CompactString,
    pub version: CompactString,
}

impl ProcessInfo {
    pub fn current() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").into(),
            version: env!("CARGO_PKG_VERSION").into(),
        }
    }

    /// MQTT client id for the process serving `port`. One process runs per
    /// port, so the id must differ between ports.
    pub fn client_id(&self, port: &str) -> CompactString {
        format_compact!("{}-{}", self.name, sanitize_connection(port))
    }
}

/// Sessions started by [`bridge`]. The hub4 one only exists for grid meters.
pub struct Bridges {
    pub ac_sensor: SessionHandle,
    pub hub4: Option<SessionHandle>,
}

impl Bridges {
    pub async fn shutdown(self) {
        self.ac_sensor.shutdown().await;

        if let Some(hub4) = self.hub4 {
            hub4.shutdown().await;
        }
    }
}

/// Publishes `sensor` and, for a grid meter, the hub4 control service.
///
/// Failing to claim the hub4 service leaves the meter running without it.
pub async fn bridge<T: TreeClient>(
    tree: Arc<T>,
    sensor: &AcSensor,
    sensor_settings: &AcSensorSettings,
    settings: &Settings,
    process: &ProcessInfo,
    interval: Duration,
) -> Result<Bridges> {
    let ac_sensor = ac_sensor_bridge::compose(sensor, sensor_settings, Some(settings), process)?;
    let hub4 = sensor_settings
        .is_grid()
        .then(|| hub4_bridge::compose(settings))
        .transpose()?;

    let ac_sensor = ac_sensor.start(tree.clone(), interval).await?;

    let Some(hub4) = hub4 else {
        return Ok(Bridges { ac_sensor, hub4: None });
    };

    let hub4 = match hub4.start(tree, interval).await {
        Ok(hub4) => Some(hub4),
        Err(e) => {
            tracing::error!(service = %hub4_bridge::SERVICE, "Failed to start hub4 bridge: {e}");
            None
        }
    };

    Ok(Bridges { ac_sensor, hub4 })
}

#[cfg(test)]
mod tests {
    use cgwacs::{
        ServiceName,
        session::{DEFAULT_EXPORT_INTERVAL, SessionState},
        tree::MemoryTree,
    };

    use super::*;
    use crate::{sensor::Identification, settings::Position};

    fn process() -> ProcessInfo {
        ProcessInfo { name: "cgwacs-meter".into(), version: "0.1.0".into() }
    }

    fn sensor(port: &str) -> AcSensor {
        let sensor = AcSensor::new(port);
        sensor
            .identify(&Identification {
                product_name: "Energy Meter ET340".into(),
                firmware_version: "1.2".into(),
                serial: "BN0042".into(),
                device_type: 345,
            })
            .unwrap();
        sensor
    }

    #[test]
    fn client_id_per_port() {
        let process = process();

        assert_eq!(process.client_id("/dev/ttyUSB0"), "cgwacs-meter-ttyUSB0");
        assert_ne!(process.client_id("/dev/ttyUSB0"), process.client_id("/dev/ttyUSB1"));
    }

    #[tokio::test(start_paused = true)]
    async fn grid_meter_bridges_both_services() {
        let tree = MemoryTree::new();
        let sensor = sensor("/dev/ttyUSB0");
        let sensor_settings = AcSensorSettings::new("grid", Position::AcInput1, "");
        let settings = Settings::new();

        let bridges = bridge(
            tree.clone(),
            &sensor,
            &sensor_settings,
            &settings,
            &process(),
            DEFAULT_EXPORT_INTERVAL,
        )
        .await
        .unwrap();

        assert!(tree.is_registered(&hub4_bridge::SERVICE));
        assert_eq!(bridges.hub4.as_ref().map(SessionHandle::state), Some(SessionState::Active));

        bridges.shutdown().await;
        assert!(!tree.is_registered(&hub4_bridge::SERVICE));
    }

    #[tokio::test(start_paused = true)]
    async fn taken_hub4_keeps_meter_running() {
        let tree = MemoryTree::new();
        let _other = tree.register_service(&hub4_bridge::SERVICE).await.unwrap();

        let sensor = sensor("/dev/ttyUSB0");
        let sensor_settings = AcSensorSettings::new("grid", Position::AcInput1, "");
        let settings = Settings::new();

        let bridges = bridge(
            tree.clone(),
            &sensor,
            &sensor_settings,
            &settings,
            &process(),
            DEFAULT_EXPORT_INTERVAL,
        )
        .await
        .unwrap();

        assert!(bridges.hub4.is_none());
        assert_eq!(bridges.ac_sensor.state(), SessionState::Active);
        assert!(tree.is_registered(&ServiceName::const_new("com.victronenergy.grid.ttyUSB0")));
    }
}
