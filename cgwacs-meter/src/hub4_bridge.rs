//! Hub4 control settings as the `com.victronenergy.hub4` service.

use cgwacs::{
    ServiceName,
    coerce::Rule,
    registry::{CommittedRegistry, PathRegistry},
};
use compact_str::format_compact;

use crate::{Result, settings::Settings};

pub const SERVICE: ServiceName = ServiceName::const_new("com.victronenergy.hub4");

const PATHS: [(&str, &str); 6] = [
    ("/AcPowerSetpoint", "acPowerSetPoint"),
    ("/MaxChargePercentage", "maxChargePercentage"),
    ("/MaxDischargePercentage", "maxDischargePercentage"),
    ("/State", "state"),
    ("/Maintenance/Interval", "maintenanceInterval"),
    ("/Maintenance/Date", "maintenanceDate"),
];

/// Binds the hub4 settings below `prefix`, which is empty for the hub4
/// service itself.
pub(crate) fn bind_settings(reg: &mut PathRegistry, prefix: &str, settings: &Settings) -> Result<()> {
    for (path, attribute) in PATHS {
        reg.bind_attribute(&format_compact!("{prefix}{path}"), settings.object(), attribute)?;
    }

    // state is reserved, neither direction is translated yet
    reg.coerce(&format_compact!("{prefix}/State"), Rule::Inert)?;
    reg.coerce(&format_compact!("{prefix}/Maintenance/Date"), Rule::EpochSeconds)?;

    Ok(())
}

pub fn compose(settings: &Settings) -> Result<CommittedRegistry> {
    tracing::info!(service = %SERVICE, "Composing hub4 control bridge");

    let mut reg = PathRegistry::new(SERVICE);
    bind_settings(&mut reg, "", settings)?;

    Ok(reg.commit())
}
