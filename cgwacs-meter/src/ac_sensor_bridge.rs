//! The meter as a `com.victronenergy.<role>.<port>` service.
//!
//! ```plain
//! /Connected              1 while the meter is connected
//! /ErrorCode
//! /Ac[/L1|/L2|/L3]/...    Current, Voltage, Power, Energy/Forward, Energy/Reverse
//! /Position               ordinal of the configured position
//! /CustomName             falls back to the product name
//! /Hub4/...               grid meters only, see hub4_bridge
//! /Mgmt/..., /Serial, ... fixed identification
//! ```

use cgwacs::{
    Format, ServiceName, TreePath, Value,
    coerce::Rule,
    registry::{CommittedRegistry, PathRegistry},
};
use cgwacs_common::identity::{self, DEFAULT_SCHEMES};

use crate::{
    Error, ProcessInfo, Result,
    hub4_bridge,
    sensor::{AcSensor, ConnectionState, PowerInfo},
    settings::{AcSensorSettings, Settings},
};

/// Product id of the Carlo Gavazzi energy meters.
pub const PRODUCT_ID: u32 = 0xB002;

pub fn compose(
    sensor: &AcSensor,
    sensor_settings: &AcSensorSettings,
    settings: Option<&Settings>,
    process: &ProcessInfo,
) -> Result<CommittedRegistry> {
    let port = sensor.port_name();
    let service = ServiceName::for_device(&sensor_settings.service_type(), &port)
        .map_err(Error::BadServiceName)?;

    tracing::info!(%service, %port, "Composing AC sensor bridge");

    let mut reg = PathRegistry::new(service);

    reg.bind_attribute("/Connected", sensor.object(), "connectionState")?;
    reg.coerce("/Connected", Rule::EnumFlag(ConnectionState::Connected.enum_value()))?;
    reg.bind_attribute("/ErrorCode", sensor.object(), "errorCode")?;

    for (path, group) in [
        ("/Ac", sensor.mean()),
        ("/Ac/L1", sensor.l1()),
        ("/Ac/L2", sensor.l2()),
        ("/Ac/L3", sensor.l3()),
    ] {
        bind_power_info(&mut reg, TreePath::const_new(path), group)?;
    }

    reg.bind_attribute("/Position", sensor_settings.object(), "position")?;
    reg.coerce("/Position", Rule::Ordinal)?;
    reg.bind_attribute("/CustomName", sensor_settings.object(), "customName")?;
    reg.coerce("/CustomName", Rule::name_fallback(sensor.object(), "productName"))?;

    if let Some(settings) = settings
        && sensor_settings.is_grid()
    {
        hub4_bridge::bind_settings(&mut reg, "/Hub4", settings)?;
    }
    reg.coerce_subtree("/Hub4/", Rule::Inert);

    reg.publish_literal("/Mgmt/ProcessName", process.name.clone())?;
    reg.publish_literal("/Mgmt/ProcessVersion", process.version.clone())?;
    reg.publish_literal("/Mgmt/Connection", port.clone())?;
    reg.publish_literal("/FirmwareVersion", sensor.firmware_version())?;
    reg.publish_literal("/ProductName", sensor.product_name())?;
    reg.publish_literal("/ProductId", PRODUCT_ID)?;
    reg.publish_literal("/DeviceType", sensor.device_type())?;
    reg.publish_literal("/Serial", sensor.serial())?;

    let instance = identity::resolve_device_instance(&port, DEFAULT_SCHEMES);
    if instance.is_none() {
        tracing::warn!(%port, "No device instance for this port");
    }
    reg.publish_literal("/DeviceInstance", instance.map_or(Value::Invalid, Value::from))?;

    Ok(reg.commit())
}

fn bind_power_info(reg: &mut PathRegistry, base: TreePath, group: &PowerInfo) -> Result<()> {
    let formats = [
        ("Current", "current", Format::new("A", 1)),
        ("Voltage", "voltage", Format::new("V", 0)),
        ("Power", "power", Format::new("W", 0)),
        ("Energy/Forward", "energyForward", Format::new("kWh", 1)),
        ("Energy/Reverse", "energyReverse", Format::new("kWh", 1)),
    ];

    for (leaf, attribute, format) in formats {
        let path = base.join(leaf).map_err(cgwacs::Error::BadPath)?;
        reg.bind_formatted(&path, group.object(), attribute, format)?;
    }

    Ok(())
}
