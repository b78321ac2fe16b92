use compact_str::{CompactString, ToCompactString, format_compact};
use serde::{Deserialize, Serialize};

use crate::Value;

/// Body of every value message on the tree.
///
/// ```plain
/// cgwacs/N/com.victronenergy.grid.ttyUSB0/Ac/L1/Current -> {"value": 1.5, "text": "1.5A"}
/// cgwacs/W/com.victronenergy.grid.ttyUSB0/CustomName    <- {"value": "Shed"}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub value: Value,
    /// Human readable rendering, only present for formatted paths
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<CompactString>,
}

impl Payload {
    pub fn new(value: Value, format: Option<&Format>) -> Self {
        let text = format.map(|format| format.text(&value));
        Self { value, text }
    }
}

/// Presentation hints for a bound path. Never used for coercion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Format {
    pub unit: Option<CompactString>,
    pub precision: Option<u8>,
}

impl Format {
    pub fn new(unit: &str, precision: u8) -> Self {
        Self {
            unit: Some(unit.to_compact_string()),
            precision: Some(precision),
        }
    }

    pub fn text(&self, value: &Value) -> CompactString {
        let unit = self.unit.as_deref().unwrap_or_default();

        match value {
            Value::Invalid => CompactString::const_new("--"),
            Value::Float(v) if !v.is_finite() => CompactString::const_new("--"),
            Value::Float(_) => match self.precision {
                Some(p) => format_compact!("{value:.0$}{unit}", p as usize),
                None => format_compact!("{value}{unit}"),
            },
            _ => format_compact!("{value}{unit}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn payload_format() {
        assert_eq!(
            serde_json::to_value(Payload::new(Value::Float(1.54), Some(&Format::new("A", 1))))
                .unwrap(),
            json!({ "value": 1.54, "text": "1.5A" })
        );
        assert_eq!(
            serde_json::to_value(Payload::new(Value::Int(3), None)).unwrap(),
            json!({ "value": 3 })
        );
        assert_eq!(
            serde_json::to_value(Payload::new(Value::Float(f64::NAN), Some(&Format::new("W", 0))))
                .unwrap(),
            json!({ "value": null, "text": "--" })
        );
    }

    #[test]
    fn parse_write_payload() {
        let payload: Payload = serde_json::from_value(json!({ "value": "Shed" })).unwrap();
        assert_eq!(payload.value, Value::from("Shed"));
        assert_eq!(payload.text, None);

        assert!(serde_json::from_value::<Payload>(json!({})).is_err());
        assert!(serde_json::from_value::<Payload>(json!({ "value": [1, 2] })).is_err());
    }

    #[test]
    fn format_text() {
        let volts = Format::new("V", 0);
        assert_eq!(volts.text(&Value::Float(229.6)), "230V");
        assert_eq!(volts.text(&Value::Int(12)), "12V");
        assert_eq!(Format::default().text(&Value::Float(0.25)), "0.25");
        assert_eq!(Format::new("kWh", 1).text(&Value::Invalid), "--");
    }
}
