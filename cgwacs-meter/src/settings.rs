use std::sync::Arc;

use cgwacs::{Kind, Value, object::PropertyObject};
use cgwacs_common::local_enum;
use chrono::{DateTime, Utc};
use compact_str::CompactString;

use crate::Result;

local_enum! {
    /// Where in the installation the meter measures.
    pub enum Position { AcInput1, AcOutput, AcInput2 }
}

local_enum! {
    pub enum Hub4State { SelfConsumption, ChargeFromGrid, External, Disabled }
}

/// Role of a meter watching the grid connection, the only one that carries
/// hub4 control paths.
pub const GRID: &str = "grid";

/// User settings of one meter.
pub struct AcSensorSettings(Arc<PropertyObject>);

impl AcSensorSettings {
    pub fn new(service_type: &str, position: Position, custom_name: &str) -> Self {
        Self(
            PropertyObject::builder("acSensorSettings")
                .attribute("serviceType", Kind::String, service_type)
                .attribute("position", Kind::Enum(&Position::KIND), position)
                .attribute("customName", Kind::String, custom_name)
                .build(),
        )
    }

    pub fn object(&self) -> &Arc<PropertyObject> {
        &self.0
    }

    /// Role the meter is published under, eg. `grid` or `pvinverter`.
    pub fn service_type(&self) -> CompactString {
        match self.0.get("serviceType") {
            Some(Value::String(s)) => s,
            _ => CompactString::default(),
        }
    }

    pub fn is_grid(&self) -> bool {
        self.service_type() == GRID
    }

    pub fn position(&self) -> Position {
        self.0
            .get("position")
            .and_then(|v| Position::try_from(&v).ok())
            .unwrap_or(Position::AcInput1)
    }

    pub fn set_position(&self, position: Position) -> Result<()> {
        Ok(self.0.set("position", position)?)
    }

    pub fn custom_name(&self) -> CompactString {
        match self.0.get("customName") {
            Some(Value::String(s)) => s,
            _ => CompactString::default(),
        }
    }
}

/// Hub4 control settings, shared by every bridge that exposes them.
pub struct Settings(Arc<PropertyObject>);

impl Default for Settings {
    fn default() -> Self {
        Self(
            PropertyObject::builder("settings")
                .attribute("acPowerSetPoint", Kind::Float, 0.0)
                .attribute("maxChargePercentage", Kind::Float, 100.0)
                .attribute("maxDischargePercentage", Kind::Float, 100.0)
                .attribute("state", Kind::Enum(&Hub4State::KIND), Hub4State::SelfConsumption)
                .attribute("maintenanceInterval", Kind::Int, 7)
                .attribute("maintenanceDate", Kind::Timestamp, Value::Timestamp(None))
                .build(),
        )
    }
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object(&self) -> &Arc<PropertyObject> {
        &self.0
    }

    /// W, positive draws from the grid.
    pub fn ac_power_set_point(&self) -> f64 {
        self.0
            .get("acPowerSetPoint")
            .and_then(|v| v.as_f64())
            .unwrap_or_default()
    }

    pub fn set_ac_power_set_point(&self, watts: f64) -> Result<()> {
        Ok(self.0.set("acPowerSetPoint", watts)?)
    }

    pub fn state(&self) -> Hub4State {
        self.0
            .get("state")
            .and_then(|v| Hub4State::try_from(&v).ok())
            .unwrap_or(Hub4State::SelfConsumption)
    }

    pub fn maintenance_date(&self) -> Option<DateTime<Utc>> {
        match self.0.get("maintenanceDate") {
            Some(Value::Timestamp(t)) => t,
            _ => None,
        }
    }

    pub fn set_maintenance_date(&self, date: Option<DateTime<Utc>>) -> Result<()> {
        Ok(self.0.set("maintenanceDate", date)?)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone as _;

    use super::*;

    #[test]
    fn sensor_settings() {
        let settings = AcSensorSettings::new("grid", Position::AcInput1, "");
        assert!(settings.is_grid());
        assert_eq!(settings.custom_name(), "");

        settings.set_position(Position::AcInput2).unwrap();
        assert_eq!(settings.position(), Position::AcInput2);

        assert!(!AcSensorSettings::new("pvinverter", Position::AcOutput, "Roof").is_grid());
    }

    #[test]
    fn hub4_defaults() {
        let settings = Settings::new();
        assert_eq!(settings.ac_power_set_point(), 0.0);
        assert_eq!(settings.state(), Hub4State::SelfConsumption);
        assert_eq!(settings.maintenance_date(), None);

        let date = Utc.timestamp_opt(1_650_000_000, 0).single();
        settings.set_maintenance_date(date).unwrap();
        assert_eq!(settings.maintenance_date(), date);
    }
}
