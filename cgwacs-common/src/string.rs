use core::{borrow::Borrow, fmt::Display, ops::Deref, str::FromStr};

use compact_str::{CompactString, ToCompactString, format_compact};
use serde::{Deserialize, Serialize};

/// Path of a value in the external tree, eg. `/Ac/L1/Power`.
///
/// Always starts with `/`, never ends with one, and has no empty segments.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct TreePath(CompactString);

impl TreePath {
    pub fn new(path: impl AsRef<str>) -> Result<Self, &'static str> {
        let path = path.as_ref();

        let Some(rest) = path.strip_prefix('/') else {
            return Err("tree path must start with /");
        };

        if rest.is_empty() {
            return Err("tree path must not be empty");
        }

        if rest.split('/').any(str::is_empty) {
            return Err("tree path must not contain empty segments");
        }

        if rest.contains(['+', '#']) {
            return Err("tree path must not contain wildcards");
        }

        Ok(Self(CompactString::from(path)))
    }

    /// Unchecked constructor for paths known at compile time.
    pub const fn const_new(path: &'static str) -> Self {
        Self(CompactString::const_new(path))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Appends `rest` (with or without a leading `/`) below this path.
    pub fn join(&self, rest: impl AsRef<str>) -> Result<Self, &'static str> {
        let rest = rest.as_ref();
        let rest = rest.strip_prefix('/').unwrap_or(rest);
        Self::new(format_compact!("{}/{}", self.0, rest))
    }

    /// True when `prefix` names this path or one of its ancestors' sub-trees.
    ///
    /// A prefix ending in `/` matches everything strictly below it.
    pub fn is_under(&self, prefix: &str) -> bool {
        match prefix.strip_suffix('/') {
            Some(parent) => self
                .0
                .strip_prefix(parent)
                .is_some_and(|rest| rest.starts_with('/')),
            None => self.0 == prefix,
        }
    }
}

impl Deref for TreePath {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.0.as_str()
    }
}

impl Borrow<str> for TreePath {
    fn borrow(&self) -> &str {
        self.0.as_str()
    }
}

impl FromStr for TreePath {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl<'de> Deserialize<'de> for TreePath {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = CompactString::deserialize(deserializer)?;
        TreePath::new(s).map_err(serde::de::Error::custom)
    }
}

impl<T: AsRef<str> + ?Sized> PartialEq<T> for TreePath {
    fn eq(&self, other: &T) -> bool {
        self.0.as_str() == other.as_ref()
    }
}

impl Display for TreePath {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        self.0.fmt(f)
    }
}

/// Namespace every service claimed by this bridge lives in.
pub const NAMESPACE: &str = "com.victronenergy";

/// Name a service is registered under on the external tree, eg.
/// `com.victronenergy.grid.ttyUSB0`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceName(CompactString);

impl ServiceName {
    pub fn new(name: impl AsRef<str>) -> Result<Self, &'static str> {
        let name = name.as_ref();

        if name.is_empty() {
            return Err("service name must not be empty");
        }

        if name.contains(['/', '+', '#']) {
            return Err("service name must not contain topic separators or wildcards");
        }

        Ok(Self(CompactString::from(name)))
    }

    pub const fn const_new(name: &'static str) -> Self {
        Self(CompactString::const_new(name))
    }

    /// `<namespace>.<service_type>.<sanitized connection>`.
    pub fn for_device(service_type: &str, connection: &str) -> Result<Self, &'static str> {
        Self::new(format_compact!(
            "{NAMESPACE}.{service_type}.{}",
            sanitize_connection(connection)
        ))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Deref for ServiceName {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

impl Display for ServiceName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Strips the `/dev/` prefix off a port name and flattens the rest into a
/// single service name segment.
pub fn sanitize_connection(connection: &str) -> CompactString {
    connection
        .strip_prefix("/dev/")
        .unwrap_or(connection)
        .replace('/', "_")
        .to_compact_string()
}
