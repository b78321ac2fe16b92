use core::{fmt::Display, str::FromStr};

use compact_str::{CompactString, ToCompactString};

pub mod identity;
pub mod meta;

mod payload;
mod string;
mod value;
pub use payload::*;
pub use string::*;
pub use value::*;

/// First topic level of everything the bridge publishes or listens to.
pub const ROOT: &str = "cgwacs";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topic {
    /// Current value of a path, published by the bridge.
    Value { service: ServiceName, path: TreePath },
    /// Request from another process to change a path.
    Write { service: ServiceName, path: TreePath },
    /// Every write addressed to a service.
    Writes { service: ServiceName },
    ServiceMeta { service: ServiceName, key: CompactString },
}

impl Display for Topic {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Topic::Value { service, path } => write!(f, "{ROOT}/N/{service}{path}"),
            Topic::Write { service, path } => write!(f, "{ROOT}/W/{service}{path}"),
            Topic::Writes { service } => write!(f, "{ROOT}/W/{service}/#"),
            Topic::ServiceMeta { service, key } => write!(f, "{ROOT}/N/{service}/$meta/{key}"),
        }
    }
}

impl FromStr for Topic {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some(rest) = s.strip_prefix(ROOT).and_then(|s| s.strip_prefix('/')) else {
            return Err("does not start with cgwacs/");
        };

        let (direction, rest) = rest.split_once('/').ok_or("cgwacs/{N|W}")?;
        let (service, path) = rest.split_once('/').ok_or("cgwacs/{N|W}/{service}")?;
        let service = ServiceName::new(service)?;

        match (direction, path.strip_prefix("$meta/")) {
            ("N", Some(key)) if !key.is_empty() && !key.contains('/') => {
                Ok(Topic::ServiceMeta { service, key: key.to_compact_string() })
            }
            ("N", Some(_)) => Err("cgwacs/N/{service}/$meta/{key}/..."),
            ("W", Some(_)) => Err("cgwacs/W/{service}/$meta"),
            ("N", None) => Ok(Topic::Value {
                service,
                path: TreePath::new(CompactString::const_new("/") + path)?,
            }),
            ("W", None) => Ok(Topic::Write {
                service,
                path: TreePath::new(CompactString::const_new("/") + path)?,
            }),
            _ => Err("cgwacs/..."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> ServiceName {
        ServiceName::const_new("com.victronenergy.grid.ttyUSB0")
    }

    #[test]
    fn topic_display() {
        assert_eq!(
            Topic::Value { service: grid(), path: TreePath::const_new("/Ac/L1/Power") }
                .to_string(),
            "cgwacs/N/com.victronenergy.grid.ttyUSB0/Ac/L1/Power"
        );

        assert_eq!(
            Topic::Write { service: grid(), path: TreePath::const_new("/CustomName") }.to_string(),
            "cgwacs/W/com.victronenergy.grid.ttyUSB0/CustomName"
        );

        assert_eq!(
            Topic::Writes { service: grid() }.to_string(),
            "cgwacs/W/com.victronenergy.grid.ttyUSB0/#"
        );

        assert_eq!(
            Topic::ServiceMeta { service: grid(), key: "status".to_compact_string() }.to_string(),
            "cgwacs/N/com.victronenergy.grid.ttyUSB0/$meta/status"
        );
    }

    #[test]
    fn topic_from_str() {
        assert_eq!(
            "cgwacs/W/com.victronenergy.grid.ttyUSB0/Hub4/Maintenance/Date"
                .parse::<Topic>()
                .unwrap(),
            Topic::Write {
                service: grid(),
                path: TreePath::const_new("/Hub4/Maintenance/Date"),
            }
        );

        assert_eq!(
            "cgwacs/N/com.victronenergy.grid.ttyUSB0/Serial".parse::<Topic>().unwrap(),
            Topic::Value { service: grid(), path: TreePath::const_new("/Serial") }
        );

        assert_eq!(
            "cgwacs/N/com.victronenergy.grid.ttyUSB0/$meta/status"
                .parse::<Topic>()
                .unwrap(),
            Topic::ServiceMeta { service: grid(), key: "status".to_compact_string() }
        );

        assert_eq!(
            "cgwacs/N/com.victronenergy.grid.ttyUSB0/$meta/status/extra".parse::<Topic>(),
            Err("cgwacs/N/{service}/$meta/{key}/...")
        );
        assert_eq!("venus/N/x/Serial".parse::<Topic>(), Err("does not start with cgwacs/"));
        assert_eq!("cgwacs/N".parse::<Topic>(), Err("cgwacs/{N|W}"));
        assert_eq!("cgwacs/N/svc".parse::<Topic>(), Err("cgwacs/{N|W}/{service}"));
        assert_eq!("cgwacs/X/svc/Serial".parse::<Topic>(), Err("cgwacs/..."));
        assert_eq!(
            "cgwacs/W/svc/Ac//Power".parse::<Topic>(),
            Err("tree path must not contain empty segments")
        );
    }
}
