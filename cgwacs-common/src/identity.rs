//! Stable device instance numbers derived from the port a device is on.

/// Port name prefix and the first instance number handed out under it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NumberingScheme {
    pub prefix: &'static str,
    pub base: u32,
}

impl NumberingScheme {
    pub const USB_SERIAL: Self = Self { prefix: "/dev/ttyUSB", base: 288 };
    pub const ONBOARD_SERIAL: Self = Self { prefix: "/dev/ttyO", base: 256 };

    pub fn resolve(&self, connection: &str) -> Option<u32> {
        let number = connection.strip_prefix(self.prefix)?;

        if number.is_empty() || !number.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }

        self.base.checked_add(number.parse().ok()?)
    }
}

/// Schemes in the order they are tried.
pub const DEFAULT_SCHEMES: &[NumberingScheme] =
    &[NumberingScheme::USB_SERIAL, NumberingScheme::ONBOARD_SERIAL];

/// Device instance of the first scheme whose prefix matches `connection`.
pub fn resolve_device_instance(connection: &str, schemes: &[NumberingScheme]) -> Option<u32> {
    schemes
        .iter()
        .find(|scheme| connection.starts_with(scheme.prefix))
        .and_then(|scheme| scheme.resolve(connection))
}
