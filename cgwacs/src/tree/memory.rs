use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use cgwacs_common::Payload;
use tokio::sync::mpsc;

use super::{InboundWrite, TreeClient, Writes};
use crate::{Error, Result, ServiceName, TreePath, Value};

struct Service {
    values: BTreeMap<TreePath, Payload>,
    publishes: usize,
    writes: mpsc::UnboundedSender<InboundWrite>,
}

/// A tree living in this process, for tests and for embedding the bridge
/// without a broker.
#[derive(Default)]
pub struct MemoryTree {
    services: Mutex<BTreeMap<ServiceName, Service>>,
}

impl MemoryTree {
    pub fn new() -> Arc<Self> {
        Arc::default()
    }

    fn services(&self) -> MutexGuard<'_, BTreeMap<ServiceName, Service>> {
        self.services.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_registered(&self, service: &ServiceName) -> bool {
        self.services().contains_key(service)
    }

    pub fn payload(&self, service: &ServiceName, path: &str) -> Option<Payload> {
        self.services().get(service)?.values.get(path).cloned()
    }

    pub fn value(&self, service: &ServiceName, path: &str) -> Option<Value> {
        self.payload(service, path).map(|p| p.value)
    }

    pub fn paths(&self, service: &ServiceName) -> Vec<TreePath> {
        self.services()
            .get(service)
            .map(|s| s.values.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of publish calls made for `service` so far.
    pub fn publish_count(&self, service: &ServiceName) -> usize {
        self.services().get(service).map_or(0, |s| s.publishes)
    }

    /// Delivers a write to `service` as if another process had made it.
    pub fn write(&self, service: &ServiceName, path: &str, value: impl Into<Value>) -> Result<()> {
        let path = TreePath::new(path).map_err(Error::BadPath)?;
        let services = self.services();
        let Some(entry) = services.get(service) else {
            return Err(Error::UnknownService(service.clone()));
        };

        entry
            .writes
            .send(InboundWrite { path, value: value.into() })
            .map_err(|_| Error::UnknownService(service.clone()))
    }
}

impl TreeClient for MemoryTree {
    async fn register_service(&self, service: &ServiceName) -> Result<Writes> {
        let mut services = self.services();
        if services.contains_key(service) {
            return Err(Error::ServiceTaken(service.clone()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        services.insert(
            service.clone(),
            Service { values: BTreeMap::new(), publishes: 0, writes: tx },
        );

        Ok(rx)
    }

    async fn publish(&self, service: &ServiceName, path: &TreePath, payload: &Payload) -> Result<()> {
        let mut services = self.services();
        let Some(entry) = services.get_mut(service) else {
            return Err(Error::UnknownService(service.clone()));
        };

        entry.publishes += 1;
        entry.values.insert(path.clone(), payload.clone());
        Ok(())
    }

    async fn unregister_service(&self, service: &ServiceName) -> Result<()> {
        self.services()
            .remove(service)
            .map(|_| ())
            .ok_or_else(|| Error::UnknownService(service.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn claim_publish_release() {
        let tree = MemoryTree::new();
        let svc = ServiceName::const_new("com.victronenergy.grid.ttyUSB0");

        let mut writes = tree.register_service(&svc).await.unwrap();
        assert!(matches!(tree.register_service(&svc).await, Err(Error::ServiceTaken(_))));

        let path = TreePath::const_new("/Serial");
        tree.publish(&svc, &path, &Payload::new(Value::from("BN1"), None))
            .await
            .unwrap();
        assert_eq!(tree.value(&svc, "/Serial"), Some(Value::from("BN1")));
        assert_eq!(tree.publish_count(&svc), 1);

        tree.write(&svc, "/CustomName", "Shed").unwrap();
        assert_eq!(
            writes.recv().await,
            Some(InboundWrite {
                path: TreePath::const_new("/CustomName"),
                value: Value::from("Shed"),
            })
        );

        tree.unregister_service(&svc).await.unwrap();
        assert!(!tree.is_registered(&svc));
        assert_eq!(writes.recv().await, None);
        assert!(matches!(tree.write(&svc, "/CustomName", "x"), Err(Error::UnknownService(_))));
    }
}
