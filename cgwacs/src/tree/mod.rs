//! The external value tree the bridge publishes to.

use core::future::Future;

use cgwacs_common::Payload;
use tokio::sync::mpsc;

use crate::{Result, ServiceName, TreePath, Value};

pub mod memory;
pub mod mqtt;

pub use memory::MemoryTree;
pub use mqtt::MqttTree;

/// A write made by another process to one of our paths.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundWrite {
    pub path: TreePath,
    pub value: Value,
}

/// Writes addressed to one registered service.
pub type Writes = mpsc::UnboundedReceiver<InboundWrite>;

pub trait TreeClient: Send + Sync + 'static {
    /// Claims `service`. Fails if the name is already taken.
    fn register_service(&self, service: &ServiceName) -> impl Future<Output = Result<Writes>> + Send;

    fn publish(
        &self,
        service: &ServiceName,
        path: &TreePath,
        payload: &Payload,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Releases `service`; its writes channel closes.
    fn unregister_service(&self, service: &ServiceName) -> impl Future<Output = Result<()>> + Send;
}
