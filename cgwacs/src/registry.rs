use std::{
    collections::{BTreeMap, btree_map::Entry as MapEntry},
    sync::{Arc, Weak},
};

use compact_str::{CompactString, ToCompactString};
use tokio::sync::watch;

use crate::{
    Error, Format, Result, ServiceName, TreePath, Value,
    coerce::{CoercionTable, Rule},
    object::Observable,
    session::SessionState,
};

/// A tree path mirroring one attribute of a local object.
#[derive(Clone)]
pub struct Binding {
    pub(crate) source: Weak<dyn Observable>,
    /// Index into the registry's source list
    pub(crate) source_index: usize,
    pub attribute: CompactString,
    pub format: Option<Format>,
}

pub enum Entry {
    Binding(Binding),
    /// Fixed for the lifetime of the service, and read-only to writers.
    Literal(Value),
}

/// Everything one service will expose, collected before it goes live.
pub struct PathRegistry {
    service: ServiceName,
    entries: BTreeMap<TreePath, Entry>,
    sources: Vec<Weak<dyn Observable>>,
    rules: CoercionTable,
    state: watch::Sender<SessionState>,
}

impl PathRegistry {
    pub fn new(service: ServiceName) -> Self {
        Self {
            service,
            entries: BTreeMap::new(),
            sources: Vec::new(),
            rules: CoercionTable::new(),
            state: watch::Sender::new(SessionState::Unregistered),
        }
    }

    pub fn service(&self) -> &ServiceName {
        &self.service
    }

    /// Lifecycle of the session this registry turns into.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn bind_attribute<O: Observable + 'static>(
        &mut self,
        path: &str,
        object: &Arc<O>,
        attribute: &str,
    ) -> Result<()> {
        self.bind(path, object, attribute, None)
    }

    /// Like [`bind_attribute`](Self::bind_attribute), with a unit and
    /// precision for the human readable text.
    pub fn bind_formatted<O: Observable + 'static>(
        &mut self,
        path: &str,
        object: &Arc<O>,
        attribute: &str,
        format: Format,
    ) -> Result<()> {
        self.bind(path, object, attribute, Some(format))
    }

    fn bind<O: Observable + 'static>(
        &mut self,
        path: &str,
        object: &Arc<O>,
        attribute: &str,
        format: Option<Format>,
    ) -> Result<()> {
        if object.kind_of(attribute).is_none() {
            return Err(Error::UnknownAttribute {
                object: object.name().to_compact_string(),
                attribute: attribute.to_compact_string(),
            });
        }

        let source: Weak<dyn Observable> = Arc::downgrade(object) as Weak<dyn Observable>;
        let source_index = match self.sources.iter().position(|s| s.ptr_eq(&source)) {
            Some(index) => index,
            None => {
                self.sources.push(source.clone());
                self.sources.len() - 1
            }
        };

        self.insert(
            path,
            Entry::Binding(Binding {
                source,
                source_index,
                attribute: attribute.to_compact_string(),
                format,
            }),
        )
    }

    pub fn publish_literal(&mut self, path: &str, value: impl Into<Value>) -> Result<()> {
        self.insert(path, Entry::Literal(value.into()))
    }

    fn insert(&mut self, path: &str, entry: Entry) -> Result<()> {
        let path = TreePath::new(path).map_err(Error::BadPath)?;

        match self.entries.entry(path) {
            MapEntry::Occupied(occupied) => Err(Error::DuplicatePath(occupied.key().clone())),
            MapEntry::Vacant(vacant) => {
                tracing::trace!(service = %self.service, path = %vacant.key(), "registered path");
                vacant.insert(entry);
                Ok(())
            }
        }
    }

    /// Sets the coercion rule for one path.
    pub fn coerce(&mut self, path: &str, rule: Rule) -> Result<()> {
        let path = TreePath::new(path).map_err(Error::BadPath)?;
        self.rules.insert(path, rule);
        Ok(())
    }

    /// Sets the coercion rule for every path below `prefix`, registered or not.
    pub fn coerce_subtree(&mut self, prefix: &str, rule: Rule) {
        self.rules.insert_subtree(prefix, rule);
    }

    pub fn get(&self, path: &str) -> Option<&Entry> {
        self.entries.get(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn bindings(&self) -> impl Iterator<Item = (&TreePath, &Binding)> {
        self.entries.iter().filter_map(|(path, entry)| match entry {
            Entry::Binding(binding) => Some((path, binding)),
            Entry::Literal(_) => None,
        })
    }

    pub fn literals(&self) -> impl Iterator<Item = (&TreePath, &Value)> {
        self.entries.iter().filter_map(|(path, entry)| match entry {
            Entry::Literal(value) => Some((path, value)),
            Entry::Binding(_) => None,
        })
    }

    /// Freezes the registry. Nothing can be added afterwards.
    pub fn commit(self) -> CommittedRegistry {
        tracing::debug!(
            service = %self.service,
            paths = self.entries.len(),
            sources = self.sources.len(),
            "registry committed",
        );

        self.state.send_replace(SessionState::Registered);

        CommittedRegistry {
            service: self.service,
            entries: self.entries,
            sources: self.sources,
            rules: self.rules,
            state: self.state,
        }
    }
}

/// A registry ready to be claimed on a tree with
/// [`start`](CommittedRegistry::start).
pub struct CommittedRegistry {
    pub(crate) service: ServiceName,
    pub(crate) entries: BTreeMap<TreePath, Entry>,
    pub(crate) sources: Vec<Weak<dyn Observable>>,
    pub(crate) rules: CoercionTable,
    pub(crate) state: watch::Sender<SessionState>,
}

impl CommittedRegistry {
    pub fn service(&self) -> &ServiceName {
        &self.service
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn binding_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| matches!(e, Entry::Binding(_)))
            .count()
    }

    pub fn literal_count(&self) -> usize {
        self.len() - self.binding_count()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Kind, object::PropertyObject};

    fn registry() -> PathRegistry {
        PathRegistry::new(ServiceName::const_new("com.victronenergy.test.ttyUSB0"))
    }

    #[test]
    fn bind_and_literal() {
        let meter = PropertyObject::builder("meter").float("power").build();
        let mut reg = registry();

        reg.bind_formatted("/Ac/Power", &meter, "power", Format::new("W", 0))
            .unwrap();
        reg.publish_literal("/Serial", "BN123").unwrap();

        assert_eq!(reg.len(), 2);
        assert!(matches!(reg.get("/Ac/Power"), Some(Entry::Binding(b)) if b.attribute == "power"));
        assert!(matches!(reg.get("/Serial"), Some(Entry::Literal(Value::String(s))) if s == "BN123"));
        assert_eq!(reg.bindings().count(), 1);
        assert_eq!(reg.literals().count(), 1);
    }

    #[test]
    fn duplicate_paths_are_wiring_errors() {
        let meter = PropertyObject::builder("meter").float("power").build();
        let mut reg = registry();

        reg.bind_attribute("/Ac/Power", &meter, "power").unwrap();

        assert!(matches!(
            reg.bind_attribute("/Ac/Power", &meter, "power"),
            Err(Error::DuplicatePath(p)) if p == "/Ac/Power"
        ));
        assert!(matches!(
            reg.publish_literal("/Ac/Power", 1),
            Err(Error::DuplicatePath(_))
        ));
    }

    #[test]
    fn unknown_attributes_are_wiring_errors() {
        let meter = PropertyObject::builder("meter").float("power").build();
        let mut reg = registry();

        assert!(matches!(
            reg.bind_attribute("/Ac/Voltage", &meter, "voltage"),
            Err(Error::UnknownAttribute { .. })
        ));
        assert!(reg.is_empty());
    }

    #[test]
    fn bad_paths() {
        let mut reg = registry();
        assert!(matches!(reg.publish_literal("Serial", 1), Err(Error::BadPath(_))));
        assert!(matches!(reg.publish_literal("/Mgmt/", 1), Err(Error::BadPath(_))));
    }

    #[test]
    fn sources_are_deduplicated() {
        let a = PropertyObject::builder("a")
            .float("x")
            .attribute("y", Kind::Int, 0)
            .build();
        let b = PropertyObject::builder("b").float("x").build();
        let mut reg = registry();

        reg.bind_attribute("/A/X", &a, "x").unwrap();
        reg.bind_attribute("/A/Y", &a, "y").unwrap();
        reg.bind_attribute("/B/X", &b, "x").unwrap();

        let committed = reg.commit();
        assert_eq!(committed.sources.len(), 2);
        assert_eq!(committed.binding_count(), 3);
        assert_eq!(committed.literal_count(), 0);
    }

    #[test]
    fn commit_moves_to_registered() {
        let reg = registry();
        let state = reg.watch_state();
        assert_eq!(*state.borrow(), SessionState::Unregistered);

        let committed = reg.commit();
        assert_eq!(*state.borrow(), SessionState::Registered);
        assert_eq!(*committed.watch_state().borrow(), SessionState::Registered);
    }
}
