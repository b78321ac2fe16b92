//! The sync engine: one task per service mirroring a committed registry onto
//! a tree.
//!
//! Everything a session does happens on its own task, one event at a time:
//! export ticks, change notifications from the bound objects, writes coming
//! in from the tree and the shutdown request. A tick that is still publishing
//! therefore cannot be re-entered, and coercion rules never run concurrently.
//!
//! ```plain
//! PathRegistry::new ── commit() ──> CommittedRegistry ── start() ──> SessionHandle
//!   Unregistered          Registered               Active ... Terminated
//! ```

use std::{
    collections::{BTreeMap, HashMap},
    ops::ControlFlow,
    sync::{Arc, Weak},
    time::Duration,
};

use cgwacs_common::Payload;
use compact_str::CompactString;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::MissedTickBehavior,
};

use crate::{
    Error, Format, Result, ServiceName, TreePath, Value,
    coerce::{CoercionTable, Inbound},
    object::{ObjectEvent, Observable, Subscription},
    registry::{Binding, CommittedRegistry, Entry},
    tree::{InboundWrite, TreeClient, Writes},
};

pub const DEFAULT_EXPORT_INTERVAL: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Paths are still being registered.
    Unregistered,
    /// The registry is complete but not yet visible on the tree.
    Registered,
    /// The service is claimed and being kept in sync.
    Active,
    /// The service has been released; nothing will be published anymore.
    Terminated,
}

#[derive(Debug)]
struct SourceEvent {
    source: usize,
    event: ObjectEvent,
}

struct BridgeSession<T> {
    service: ServiceName,
    entries: BTreeMap<TreePath, Entry>,
    rules: CoercionTable,
    /// Paths to re-export when an attribute of a source changes
    watchers: HashMap<(usize, CompactString), Vec<TreePath>>,
    /// Last value the tree accepted per path
    exported: HashMap<TreePath, Value>,
    tree: Arc<T>,
    interval: Duration,
    state: watch::Sender<SessionState>,
    subscriptions: Vec<Subscription>,
}

impl CommittedRegistry {
    /// Claims the service on `tree`, publishes every path and starts keeping
    /// them in sync every `interval`.
    ///
    /// Fails without starting anything if a bound object is already gone or
    /// the tree refuses the service name.
    pub async fn start<T: TreeClient>(
        self,
        tree: Arc<T>,
        interval: Duration,
    ) -> Result<SessionHandle> {
        let CommittedRegistry { service, entries, sources, rules, state } = self;

        let gone = entries.iter().find_map(|(path, entry)| match entry {
            Entry::Binding(binding) if binding.source.strong_count() == 0 => Some(path.clone()),
            _ => None,
        });

        if let Some(path) = gone {
            return Err(Error::SourceGone(path));
        }

        let sources = sources
            .iter()
            .filter_map(Weak::upgrade)
            .collect::<Vec<Arc<dyn Observable>>>();

        let writes = match tree.register_service(&service).await {
            Ok(writes) => writes,
            Err(e) => {
                tracing::error!(%service, "Failed to register service: {e}");
                return Err(e);
            }
        };

        let (events_tx, events) = mpsc::unbounded_channel();
        let subscriptions = sources
            .iter()
            .enumerate()
            .map(|(source, object)| {
                let tx = events_tx.clone();
                object.subscribe(Box::new(move |event: &ObjectEvent| {
                    tx.send(SourceEvent { source, event: event.clone() }).is_ok()
                }))
            })
            .collect();
        drop(sources);

        let mut watchers = HashMap::<_, Vec<_>>::new();
        for (path, entry) in &entries {
            if let Entry::Binding(binding) = entry {
                watchers
                    .entry((binding.source_index, binding.attribute.clone()))
                    .or_default()
                    .push(path.clone());
            }
        }

        let mut session = BridgeSession {
            service,
            entries,
            rules,
            watchers,
            exported: HashMap::new(),
            tree,
            interval,
            state,
            subscriptions,
        };

        session.publish_literals().await;
        session.state.send_replace(SessionState::Active);
        tracing::info!(service = %session.service, "Service registered");

        let (shutdown_tx, shutdown) = oneshot::channel();
        let state = session.state.subscribe();
        let service = session.service.clone();

        let task = tokio::spawn(session.run(events, writes, shutdown));

        Ok(SessionHandle { service, state, shutdown: Some(shutdown_tx), task })
    }
}

impl<T: TreeClient> BridgeSession<T> {
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<SourceEvent>,
        mut writes: Writes,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let flow = tokio::select! {
                // the first tick completes immediately, doing the initial export
                _ = ticker.tick() => self.export_all().await,
                Some(SourceEvent { source, event }) = events.recv() => match event {
                    ObjectEvent::Changed(attribute) => self.forward(source, attribute).await,
                    ObjectEvent::Destroyed => {
                        tracing::info!(service = %self.service, "Source object destroyed");
                        ControlFlow::Break(())
                    }
                },
                Some(write) = writes.recv() => self.apply_write(write).await,
                Ok(()) = &mut shutdown => {
                    tracing::info!(service = %self.service, "Shutdown requested");
                    ControlFlow::Break(())
                }
            };

            if flow.is_break() {
                break;
            }
        }

        self.terminate().await;
    }

    async fn publish_literals(&mut self) {
        let literals = self
            .entries
            .iter()
            .filter_map(|(path, entry)| match entry {
                Entry::Literal(value) => Some((path.clone(), value.clone())),
                Entry::Binding(_) => None,
            })
            .collect::<Vec<_>>();

        for (path, value) in literals {
            let value = self.rules.outbound(&path, value);
            self.publish(&path, value, None).await;
        }
    }

    async fn export_all(&mut self) -> ControlFlow<()> {
        let paths = self
            .entries
            .iter()
            .filter(|(_, entry)| matches!(entry, Entry::Binding(_)))
            .map(|(path, _)| path.clone())
            .collect::<Vec<_>>();

        for path in paths {
            self.export(&path).await?;
        }

        ControlFlow::Continue(())
    }

    async fn forward(&mut self, source: usize, attribute: CompactString) -> ControlFlow<()> {
        let Some(paths) = self.watchers.get(&(source, attribute)).cloned() else {
            return ControlFlow::Continue(());
        };

        for path in paths {
            self.export(&path).await?;
        }

        ControlFlow::Continue(())
    }

    /// Publishes the current value of a bound path if it differs from what
    /// the tree already has.
    async fn export(&mut self, path: &TreePath) -> ControlFlow<()> {
        let Some(Entry::Binding(binding)) = self.entries.get(path) else {
            return ControlFlow::Continue(());
        };

        let Some(source) = binding.source.upgrade() else {
            tracing::info!(service = %self.service, %path, "Source object is gone");
            return ControlFlow::Break(());
        };

        let raw = source.attribute(&binding.attribute).unwrap_or_default();
        drop(source);

        let value = self.rules.outbound(path, raw);

        if self.exported.get(path).is_some_and(|exported| *exported == value) {
            return ControlFlow::Continue(());
        }

        let format = binding.format.clone();
        self.publish(path, value, format.as_ref()).await;

        ControlFlow::Continue(())
    }

    async fn publish(&mut self, path: &TreePath, value: Value, format: Option<&Format>) {
        let payload = Payload::new(value, format);

        match self.tree.publish(&self.service, path, &payload).await {
            Ok(()) => {
                tracing::trace!(service = %self.service, %path, value = ?payload.value, "Published");
                self.exported.insert(path.clone(), payload.value);
            }
            // not recorded, so the next tick tries again
            Err(e) => tracing::warn!(service = %self.service, %path, "Failed to publish: {e}"),
        }
    }

    async fn apply_write(&mut self, InboundWrite { path, value }: InboundWrite) -> ControlFlow<()> {
        let binding = match self.entries.get(&path) {
            Some(Entry::Binding(binding)) => binding.clone(),
            Some(Entry::Literal(_)) => {
                tracing::warn!(service = %self.service, %path, "Rejected write to read-only path");
                return ControlFlow::Continue(());
            }
            None => {
                match self.rules.inbound_unregistered(&path, &value) {
                    Some(Inbound::Ignore) => {
                        tracing::debug!(service = %self.service, %path, "Accepted write to reserved path")
                    }
                    _ => tracing::warn!(service = %self.service, %path, "Rejected write to unknown path"),
                }
                return ControlFlow::Continue(());
            }
        };

        let value = match self.rules.inbound(&path, &value) {
            Inbound::PassThrough => value,
            Inbound::Assign(value) => value,
            Inbound::Ignore => {
                tracing::debug!(service = %self.service, %path, ?value, "Write accepted without effect");
                return ControlFlow::Continue(());
            }
        };

        self.store(&path, &binding, value)?;

        // reflect what was actually stored, which may differ from the write
        self.export(&path).await
    }

    fn store(&self, path: &TreePath, binding: &Binding, value: Value) -> ControlFlow<()> {
        let Some(source) = binding.source.upgrade() else {
            tracing::info!(service = %self.service, %path, "Source object is gone");
            return ControlFlow::Break(());
        };

        tracing::debug!(service = %self.service, %path, ?value, "Applying write");

        if let Err(e) = source.set_attribute(&binding.attribute, value) {
            tracing::warn!(service = %self.service, %path, "Write refused: {e}");
        }

        ControlFlow::Continue(())
    }

    async fn terminate(mut self) {
        self.subscriptions.clear();

        if let Err(e) = self.tree.unregister_service(&self.service).await {
            tracing::warn!(service = %self.service, "Failed to unregister service: {e}");
        }

        self.state.send_replace(SessionState::Terminated);
        tracing::info!(service = %self.service, "Service terminated");
    }
}

/// Handle to a running session.
///
/// Dropping the handle leaves the session running; it then ends only when
/// one of its source objects is destroyed.
pub struct SessionHandle {
    service: ServiceName,
    state: watch::Receiver<SessionState>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn service(&self) -> &ServiceName {
        &self.service
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Resolves once the session has terminated, for whatever reason.
    pub async fn terminated(&mut self) {
        // the sender lives until the task ends, after sending Terminated
        let _ = self
            .state
            .wait_for(|state| *state == SessionState::Terminated)
            .await;
    }

    /// Stops the session and waits for it to release the service.
    pub async fn shutdown(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }

        if let Err(e) = (&mut self.task).await {
            tracing::error!(service = %self.service, "Session task failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use cgwacs_common::local_enum;
    use chrono::{TimeZone as _, Utc};

    use super::*;
    use crate::{
        Format, Kind,
        coerce::Rule,
        object::PropertyObject,
        registry::PathRegistry,
        tree::MemoryTree,
    };

    local_enum! {
        pub enum Link { Down, Up }
    }

    fn service() -> ServiceName {
        ServiceName::const_new("com.victronenergy.grid.ttyUSB0")
    }

    struct Fixture {
        meter: Arc<PropertyObject>,
        settings: Arc<PropertyObject>,
        tree: Arc<MemoryTree>,
        handle: SessionHandle,
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    async fn fixture() -> Fixture {
        let meter = PropertyObject::builder("meter")
            .attribute("link", Kind::Enum(&Link::KIND), Link::Down)
            .attribute("productName", Kind::String, "Energy Meter")
            .float("power")
            .build();

        let settings = PropertyObject::builder("settings")
            .attribute("customName", Kind::String, "")
            .attribute("maintenanceDate", Kind::Timestamp, Value::Timestamp(None))
            .attribute("setpoint", Kind::Float, 0.0)
            .build();

        let mut reg = PathRegistry::new(service());
        reg.bind_attribute("/Connected", &meter, "link").unwrap();
        reg.coerce("/Connected", Rule::EnumFlag(Link::Up.enum_value()))
            .unwrap();
        reg.bind_formatted("/Ac/Power", &meter, "power", Format::new("W", 0))
            .unwrap();
        reg.bind_attribute("/CustomName", &settings, "customName")
            .unwrap();
        reg.coerce("/CustomName", Rule::name_fallback(&meter, "productName"))
            .unwrap();
        reg.bind_attribute("/Hub4/AcPowerSetpoint", &settings, "setpoint")
            .unwrap();
        reg.bind_attribute("/Hub4/Maintenance/Date", &settings, "maintenanceDate")
            .unwrap();
        reg.coerce("/Hub4/Maintenance/Date", Rule::EpochSeconds)
            .unwrap();
        reg.coerce_subtree("/Hub4/", Rule::Inert);
        reg.publish_literal("/Serial", "BN0042").unwrap();

        let tree = MemoryTree::new();
        let handle = reg
            .commit()
            .start(tree.clone(), DEFAULT_EXPORT_INTERVAL)
            .await
            .unwrap();
        settle().await;

        Fixture { meter, settings, tree, handle }
    }

    #[tokio::test(start_paused = true)]
    async fn initial_export() {
        let f = fixture().await;
        let svc = service();

        assert_eq!(f.handle.state(), SessionState::Active);
        assert_eq!(f.tree.value(&svc, "/Connected"), Some(Value::Int(0)));
        assert_eq!(f.tree.value(&svc, "/Ac/Power"), Some(Value::Invalid));
        assert_eq!(f.tree.value(&svc, "/CustomName"), Some(Value::from("Energy Meter")));
        assert_eq!(f.tree.value(&svc, "/Hub4/Maintenance/Date"), Some(Value::Int(0)));
        assert_eq!(f.tree.value(&svc, "/Serial"), Some(Value::from("BN0042")));
        assert_eq!(f.tree.paths(&svc).len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn changes_are_forwarded_before_the_next_tick() {
        let f = fixture().await;
        let svc = service();

        f.meter.set("power", 1234.4).unwrap();
        f.meter.set("link", Link::Up).unwrap();
        settle().await;

        assert_eq!(f.tree.value(&svc, "/Ac/Power"), Some(Value::Float(1234.4)));
        assert_eq!(
            f.tree.payload(&svc, "/Ac/Power").unwrap().text.as_deref(),
            Some("1234W")
        );
        assert_eq!(f.tree.value(&svc, "/Connected"), Some(Value::Int(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_only_publish_changes() {
        let f = fixture().await;
        let svc = service();

        let before = f.tree.publish_count(&svc);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(f.tree.publish_count(&svc), before);

        f.meter.set("power", f64::INFINITY).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        // infinity is published as absent, which the tree already had
        assert_eq!(f.tree.publish_count(&svc), before);
        assert_eq!(f.tree.value(&svc, "/Ac/Power"), Some(Value::Invalid));

        f.meter.set("power", 10.0).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(f.tree.publish_count(&svc), before + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn name_fallback_round_trip() {
        let f = fixture().await;
        let svc = service();

        f.tree.write(&svc, "/CustomName", "Shed").unwrap();
        settle().await;
        assert_eq!(f.settings.get("customName"), Some(Value::from("Shed")));
        assert_eq!(f.tree.value(&svc, "/CustomName"), Some(Value::from("Shed")));

        f.settings.set("customName", "").unwrap();
        settle().await;
        assert_eq!(f.tree.value(&svc, "/CustomName"), Some(Value::from("Energy Meter")));

        f.settings.set("customName", "Garage").unwrap();
        f.tree.write(&svc, "/CustomName", "Energy Meter").unwrap();
        settle().await;
        assert_eq!(f.settings.get("customName"), Some(Value::from("")));
        assert_eq!(f.tree.value(&svc, "/CustomName"), Some(Value::from("Energy Meter")));
    }

    #[tokio::test(start_paused = true)]
    async fn maintenance_date_round_trip() {
        let f = fixture().await;
        let svc = service();

        f.tree.write(&svc, "/Hub4/Maintenance/Date", 1_650_000_000).unwrap();
        settle().await;
        assert_eq!(
            f.settings.get("maintenanceDate"),
            Some(Value::Timestamp(Utc.timestamp_opt(1_650_000_000, 0).single()))
        );
        assert_eq!(f.tree.value(&svc, "/Hub4/Maintenance/Date"), Some(Value::Int(1_650_000_000)));

        f.tree.write(&svc, "/Hub4/Maintenance/Date", 0).unwrap();
        settle().await;
        assert_eq!(f.settings.get("maintenanceDate"), Some(Value::Timestamp(None)));
        assert_eq!(f.tree.value(&svc, "/Hub4/Maintenance/Date"), Some(Value::Int(0)));
    }

    #[tokio::test(start_paused = true)]
    async fn pass_through_writes_are_narrowed() {
        let f = fixture().await;
        let svc = service();

        f.tree.write(&svc, "/Hub4/AcPowerSetpoint", -150).unwrap();
        settle().await;
        assert_eq!(f.settings.get("setpoint"), Some(Value::Float(-150.0)));
        assert_eq!(f.tree.value(&svc, "/Hub4/AcPowerSetpoint"), Some(Value::Float(-150.0)));

        // refused by the object, tree keeps showing the stored value
        f.tree.write(&svc, "/Hub4/AcPowerSetpoint", "lots").unwrap();
        settle().await;
        assert_eq!(f.settings.get("setpoint"), Some(Value::Float(-150.0)));
        assert_eq!(f.tree.value(&svc, "/Hub4/AcPowerSetpoint"), Some(Value::Float(-150.0)));
    }

    #[tokio::test(start_paused = true)]
    async fn literal_and_reserved_writes_change_nothing() {
        let f = fixture().await;
        let svc = service();
        let before = f.tree.publish_count(&svc);

        f.tree.write(&svc, "/Serial", "forged").unwrap();
        f.tree.write(&svc, "/Hub4/State", 3).unwrap();
        f.tree.write(&svc, "/Hub4/Reserved/Thing", 1).unwrap();
        f.tree.write(&svc, "/Connected", 1).unwrap();
        f.tree.write(&svc, "/Nowhere", 1).unwrap();
        settle().await;

        assert_eq!(f.handle.state(), SessionState::Active);
        assert_eq!(f.tree.publish_count(&svc), before);
        assert_eq!(f.tree.value(&svc, "/Serial"), Some(Value::from("BN0042")));
        assert_eq!(f.tree.value(&svc, "/Hub4/State"), None);
        assert_eq!(f.meter.get("link"), Some(Link::Down.into()));
    }

    #[tokio::test(start_paused = true)]
    async fn destroying_a_source_terminates() {
        let Fixture { meter, settings, tree, mut handle } = fixture().await;

        drop(meter);
        handle.terminated().await;

        assert_eq!(handle.state(), SessionState::Terminated);
        assert!(!tree.is_registered(&service()));
        // the session let go of its subscriptions
        assert_eq!(settings.observer_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn write_racing_destruction_terminates() {
        let Fixture { meter, settings, tree, mut handle } = fixture().await;

        drop(meter);
        // Destroyed is still queued
        assert_eq!(handle.state(), SessionState::Active);
        tree.write(&service(), "/Ac/Power", 1500).unwrap();

        handle.terminated().await;

        assert_eq!(handle.state(), SessionState::Terminated);
        assert!(!tree.is_registered(&service()));
        assert_eq!(settings.observer_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_shutdown() {
        let f = fixture().await;
        let state = f.handle.watch_state();

        f.handle.shutdown().await;

        assert_eq!(*state.borrow(), SessionState::Terminated);
        assert!(!f.tree.is_registered(&service()));
        assert_eq!(f.meter.observer_count(), 0);

        // the name is free again
        let reg = PathRegistry::new(service());
        assert!(reg.commit().start(f.tree.clone(), DEFAULT_EXPORT_INTERVAL).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn registration_failure_starts_nothing() {
        let f = fixture().await;

        let meter = PropertyObject::builder("other").float("power").build();
        let mut reg = PathRegistry::new(service());
        reg.bind_attribute("/Ac/Power", &meter, "power").unwrap();
        let committed = reg.commit();
        let state = committed.watch_state();

        let result = committed.start(f.tree.clone(), DEFAULT_EXPORT_INTERVAL).await;
        assert!(matches!(result, Err(Error::ServiceTaken(_))));
        assert_eq!(*state.borrow(), SessionState::Registered);
        assert_eq!(meter.observer_count(), 0);
    }
}
