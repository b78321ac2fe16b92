//! Local model of the meter, filled in by the transport.

use std::sync::Arc;

use cgwacs::{
    Kind, Value,
    object::{Observable as _, PropertyObject},
};
use cgwacs_common::local_enum;
use compact_str::CompactString;

use crate::Result;

local_enum! {
    /// Progress of the transport towards a usable meter.
    pub enum ConnectionState { Disconnected, Searched, Detected, Connected }
}

/// Readings of one group of conductors. Unknown readings are NaN.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    /// A
    pub current: f64,
    /// V
    pub voltage: f64,
    /// W
    pub power: f64,
    /// kWh imported
    pub energy_forward: f64,
    /// kWh exported
    pub energy_reverse: f64,
}

impl Default for Measurement {
    fn default() -> Self {
        Self {
            current: f64::NAN,
            voltage: f64::NAN,
            power: f64::NAN,
            energy_forward: f64::NAN,
            energy_reverse: f64::NAN,
        }
    }
}

pub struct PowerInfo(Arc<PropertyObject>);

impl PowerInfo {
    pub const ATTRIBUTES: [&'static str; 5] =
        ["current", "voltage", "power", "energyForward", "energyReverse"];

    fn new(name: &str) -> Self {
        let builder = Self::ATTRIBUTES
            .iter()
            .fold(PropertyObject::builder(name), |builder, attr| builder.float(attr));

        Self(builder.build())
    }

    pub fn object(&self) -> &Arc<PropertyObject> {
        &self.0
    }

    pub fn update(&self, m: &Measurement) -> Result<()> {
        self.0.set("current", m.current)?;
        self.0.set("voltage", m.voltage)?;
        self.0.set("power", m.power)?;
        self.0.set("energyForward", m.energy_forward)?;
        self.0.set("energyReverse", m.energy_reverse)?;
        Ok(())
    }

    /// Marks every reading unknown, eg. after losing the meter.
    pub fn reset(&self) -> Result<()> {
        self.update(&Measurement::default())
    }

    pub fn measurement(&self) -> Measurement {
        let get = |attr| self.0.get(attr).and_then(|v| v.as_f64()).unwrap_or(f64::NAN);

        Measurement {
            current: get("current"),
            voltage: get("voltage"),
            power: get("power"),
            energy_forward: get("energyForward"),
            energy_reverse: get("energyReverse"),
        }
    }
}

/// What the meter reports about itself once detected.
#[derive(Debug, Clone, Default)]
pub struct Identification {
    pub product_name: CompactString,
    pub firmware_version: CompactString,
    pub serial: CompactString,
    pub device_type: i64,
}

/// One AC energy meter on a serial port.
///
/// Dropping the sensor destroys all of its objects, which ends every session
/// publishing them.
pub struct AcSensor {
    object: Arc<PropertyObject>,
    mean: PowerInfo,
    l1: PowerInfo,
    l2: PowerInfo,
    l3: PowerInfo,
}

impl AcSensor {
    pub fn new(port_name: &str) -> Self {
        let object = PropertyObject::builder("acSensor")
            .attribute(
                "connectionState",
                Kind::Enum(&ConnectionState::KIND),
                ConnectionState::Disconnected,
            )
            .attribute("errorCode", Kind::Int, 0)
            .attribute("portName", Kind::String, port_name)
            .attribute("productName", Kind::String, "")
            .attribute("firmwareVersion", Kind::String, "")
            .attribute("serial", Kind::String, "")
            .attribute("deviceType", Kind::Int, 0)
            .build();

        Self {
            object,
            mean: PowerInfo::new("acSensor.mean"),
            l1: PowerInfo::new("acSensor.l1"),
            l2: PowerInfo::new("acSensor.l2"),
            l3: PowerInfo::new("acSensor.l3"),
        }
    }

    pub fn object(&self) -> &Arc<PropertyObject> {
        &self.object
    }

    /// Totals over all phases.
    pub fn mean(&self) -> &PowerInfo {
        &self.mean
    }

    pub fn l1(&self) -> &PowerInfo {
        &self.l1
    }

    pub fn l2(&self) -> &PowerInfo {
        &self.l2
    }

    pub fn l3(&self) -> &PowerInfo {
        &self.l3
    }

    pub fn identify(&self, id: &Identification) -> Result<()> {
        self.object.set("productName", id.product_name.clone())?;
        self.object.set("firmwareVersion", id.firmware_version.clone())?;
        self.object.set("serial", id.serial.clone())?;
        self.object.set("deviceType", id.device_type)?;
        Ok(())
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.object
            .get("connectionState")
            .and_then(|v| ConnectionState::try_from(&v).ok())
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn set_connection_state(&self, state: ConnectionState) -> Result<()> {
        Ok(self.object.set("connectionState", state)?)
    }

    pub fn set_error_code(&self, code: i64) -> Result<()> {
        Ok(self.object.set("errorCode", code)?)
    }

    pub fn port_name(&self) -> CompactString {
        self.string("portName")
    }

    pub fn product_name(&self) -> CompactString {
        self.string("productName")
    }

    pub fn firmware_version(&self) -> CompactString {
        self.string("firmwareVersion")
    }

    pub fn serial(&self) -> CompactString {
        self.string("serial")
    }

    pub fn device_type(&self) -> i64 {
        self.object
            .attribute("deviceType")
            .and_then(|v| v.as_i64())
            .unwrap_or_default()
    }

    fn string(&self, attribute: &str) -> CompactString {
        match self.object.attribute(attribute) {
            Some(Value::String(s)) => s,
            _ => CompactString::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_sensor() {
        let sensor = AcSensor::new("/dev/ttyUSB0");

        assert_eq!(sensor.port_name(), "/dev/ttyUSB0");
        assert_eq!(sensor.connection_state(), ConnectionState::Disconnected);
        assert_eq!(sensor.product_name(), "");
        assert!(sensor.l2().measurement().power.is_nan());
    }

    #[test]
    fn identify_and_measure() {
        let sensor = AcSensor::new("/dev/ttyUSB0");

        sensor
            .identify(&Identification {
                product_name: "Energy Meter ET340".into(),
                firmware_version: "1.2".into(),
                serial: "BN0042".into(),
                device_type: 345,
            })
            .unwrap();
        sensor.set_connection_state(ConnectionState::Connected).unwrap();

        let m = Measurement { current: 1.5, voltage: 231.0, power: 346.5, ..Default::default() };
        sensor.l1().update(&m).unwrap();

        assert_eq!(sensor.product_name(), "Energy Meter ET340");
        assert_eq!(sensor.serial(), "BN0042");
        assert_eq!(sensor.device_type(), 345);
        assert_eq!(sensor.connection_state(), ConnectionState::Connected);
        assert_eq!(sensor.l1().measurement().voltage, 231.0);
        assert!(sensor.l1().measurement().energy_forward.is_nan());

        sensor.l1().reset().unwrap();
        assert!(sensor.l1().measurement().power.is_nan());
    }
}
