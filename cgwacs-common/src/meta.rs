use compact_str::CompactString;
use serde::{Deserialize, Serialize};

/// Service level metadata, published retained under `$meta/<KEY>`.
pub trait MetaField: Serialize {
    const KEY: &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Online,
    Offline,
}

impl MetaField for Status {
    const KEY: &'static str = "status";
}

/// Client id of the connection that holds a service name. Present while the
/// service is claimed, cleared on release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Owner(pub CompactString);

impl MetaField for Owner {
    const KEY: &'static str = "owner";
}
