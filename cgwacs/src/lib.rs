use compact_str::CompactString;
use mqtt_endpoint_tokio::mqtt_ep;

pub mod coerce;
pub mod log;
pub mod object;
pub mod registry;
pub mod session;
pub mod tree;

pub use cgwacs_common as common;
pub use cgwacs_common::{Format, Kind, ServiceName, TreePath, Value};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("mqtt transport error: {0}")]
    MqttTransport(#[from] mqtt_ep::TransportError),
    #[error("mqtt connection error: {0}")]
    MqttConnection(#[from] mqtt_ep::ConnectionError),
    #[error("mqtt packet field error: {0}")]
    MqttPacketField(&'static str),
    #[error("mqtt packet error: {0}")]
    MqttPacket(mqtt_ep::result_code::MqttError),
    #[error("serde json error: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("bad topic: {0}")]
    BadTopic(&'static str),
    #[error("bad tree path: {0}")]
    BadPath(&'static str),
    #[error("path {0} is already registered")]
    DuplicatePath(TreePath),
    #[error("{object} has no attribute {attribute}")]
    UnknownAttribute {
        object: CompactString,
        attribute: CompactString,
    },
    #[error("cannot store {value:?} in {object}.{attribute} ({expected:?})")]
    TypeMismatch {
        object: CompactString,
        attribute: CompactString,
        expected: Kind,
        value: Value,
    },
    #[error("service {0} is already registered")]
    ServiceTaken(ServiceName),
    #[error("service {0} is not registered")]
    UnknownService(ServiceName),
    #[error("source object of {0} is gone")]
    SourceGone(TreePath),
}

impl From<mqtt_ep::result_code::MqttError> for Error {
    fn from(e: mqtt_ep::result_code::MqttError) -> Self {
        Error::MqttPacket(e)
    }
}
