//! Local objects whose attributes are mirrored onto the tree.
//!
//! An object never knows who is watching it. Observers register a handler and
//! get a [`Subscription`] back; dropping the subscription unregisters the
//! handler. When the object itself is dropped every handler receives
//! [`ObjectEvent::Destroyed`] before the memory goes away.

use core::sync::atomic::{AtomicU32, Ordering};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use compact_str::{CompactString, ToCompactString};

use crate::{Error, Kind, Result, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum ObjectEvent {
    Changed(CompactString),
    Destroyed,
}

/// Called for every event; returning `false` removes the handler.
///
/// A handler may subscribe to or unsubscribe from the object it observes,
/// but must not change that object's attributes itself.
pub type EventHandler = Box<dyn FnMut(&ObjectEvent) -> bool + Send + Sync>;

pub trait Observable: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Declared kind of `attribute`, `None` if there is no such attribute.
    fn kind_of(&self, attribute: &str) -> Option<Kind>;

    fn attribute(&self, attribute: &str) -> Option<Value>;

    /// Stores `value`, narrowed to the attribute's kind. Observers are only
    /// notified when the stored value actually changed.
    fn set_attribute(&self, attribute: &str, value: Value) -> Result<()>;

    fn subscribe(&self, handler: EventHandler) -> Subscription;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type SharedHandler = Arc<Mutex<EventHandler>>;

#[derive(Default)]
pub struct Observers {
    next_id: AtomicU32,
    handlers: Mutex<BTreeMap<u32, SharedHandler>>,
}

impl Observers {
    pub fn new() -> Arc<Self> {
        Arc::default()
    }

    pub fn subscribe(self: &Arc<Self>, handler: EventHandler) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.handlers).insert(id, Arc::new(Mutex::new(handler)));

        Subscription { observers: Arc::downgrade(self), id }
    }

    /// Calls every handler with the table unlocked, so handlers can
    /// subscribe and drop subscriptions.
    pub fn notify(&self, event: &ObjectEvent) {
        let snapshot: Vec<(u32, SharedHandler)> = lock(&self.handlers)
            .iter()
            .map(|(id, handler)| (*id, handler.clone()))
            .collect();

        for (id, handler) in snapshot {
            // dropped by an earlier handler in this round
            if !lock(&self.handlers).contains_key(&id) {
                continue;
            }

            let retain = {
                let mut handler = lock(&handler);
                (*handler)(event)
            };

            if !retain {
                lock(&self.handlers).remove(&id);
            }
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.handlers).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Keeps a handler registered for as long as it is alive.
#[must_use = "dropping a Subscription unregisters its handler"]
pub struct Subscription {
    observers: Weak<Observers>,
    id: u32,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(observers) = self.observers.upgrade() {
            lock(&observers.handlers).remove(&self.id);
        }
    }
}

#[derive(Debug)]
struct Attribute {
    kind: Kind,
    value: Value,
}

/// An [`Observable`] backed by a table of typed attributes.
pub struct PropertyObject {
    name: CompactString,
    attributes: Mutex<BTreeMap<CompactString, Attribute>>,
    observers: Arc<Observers>,
}

impl PropertyObject {
    pub fn builder(name: impl ToCompactString) -> PropertyObjectBuilder {
        PropertyObjectBuilder {
            name: name.to_compact_string(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn get(&self, attribute: &str) -> Option<Value> {
        self.attribute(attribute)
    }

    /// Convenience for local producers, eg. the meter transport.
    pub fn set(&self, attribute: &str, value: impl Into<Value>) -> Result<()> {
        self.set_attribute(attribute, value.into())
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }
}

impl Observable for PropertyObject {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind_of(&self, attribute: &str) -> Option<Kind> {
        lock(&self.attributes).get(attribute).map(|a| a.kind)
    }

    fn attribute(&self, attribute: &str) -> Option<Value> {
        lock(&self.attributes).get(attribute).map(|a| a.value.clone())
    }

    fn set_attribute(&self, attribute: &str, value: Value) -> Result<()> {
        let changed = {
            let mut attributes = lock(&self.attributes);

            let Some(slot) = attributes.get_mut(attribute) else {
                return Err(Error::UnknownAttribute {
                    object: self.name.clone(),
                    attribute: attribute.to_compact_string(),
                });
            };

            let Some(value) = value.clone().narrow(slot.kind) else {
                return Err(Error::TypeMismatch {
                    object: self.name.clone(),
                    attribute: attribute.to_compact_string(),
                    expected: slot.kind,
                    value,
                });
            };

            let changed = !same(&slot.value, &value);
            slot.value = value;
            changed
        };

        if changed {
            tracing::trace!(object = %self.name, attribute, "attribute changed");
            self.observers
                .notify(&ObjectEvent::Changed(attribute.to_compact_string()));
        }

        Ok(())
    }

    fn subscribe(&self, handler: EventHandler) -> Subscription {
        self.observers.subscribe(handler)
    }
}

impl Drop for PropertyObject {
    fn drop(&mut self) {
        tracing::debug!(object = %self.name, "object destroyed");
        self.observers.notify(&ObjectEvent::Destroyed);
    }
}

// NaN readings are "unknown", and unknown does not change into unknown.
fn same(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Float(a), Value::Float(b)) if a.is_nan() && b.is_nan() => true,
        _ => a == b,
    }
}

pub struct PropertyObjectBuilder {
    name: CompactString,
    attributes: BTreeMap<CompactString, Attribute>,
}

impl PropertyObjectBuilder {
    /// Declares an attribute. `initial` must already be of `kind`.
    pub fn attribute(mut self, name: &str, kind: Kind, initial: impl Into<Value>) -> Self {
        let initial = initial.into();
        debug_assert_eq!(initial.kind(), Some(kind), "initial value of {name}");

        self.attributes
            .insert(name.to_compact_string(), Attribute { kind, value: initial });
        self
    }

    pub fn float(self, name: &str) -> Self {
        self.attribute(name, Kind::Float, f64::NAN)
    }

    pub fn build(self) -> Arc<PropertyObject> {
        Arc::new(PropertyObject {
            name: self.name,
            attributes: Mutex::new(self.attributes),
            observers: Observers::new(),
        })
    }
}
