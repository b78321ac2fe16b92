//! Per-path value conversion between the local and the tree representation.
//!
//! Paths without a rule are published verbatim and written back verbatim.
//! Whatever the rule, a non-finite float never leaves the bridge: it is
//! published as absent.

use std::{
    collections::BTreeMap,
    sync::{Arc, Weak},
};

use cgwacs_common::EnumValue;
use chrono::DateTime;
use compact_str::{CompactString, ToCompactString};

use crate::{TreePath, Value, object::Observable};

/// What to do with a value written by another process.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Store the written value as is.
    PassThrough,
    /// Store this value instead.
    Assign(Value),
    /// Accept the write but leave the local object alone.
    Ignore,
}

pub enum Rule {
    /// Publishes 1 while the attribute equals the given variant, 0 otherwise.
    /// Writes are ignored, the flag cannot be turned back into a state.
    EnumFlag(EnumValue),
    /// Publishes enums as their ordinal.
    Ordinal,
    /// Publishes another attribute of `source` while the name is empty, and
    /// stores an empty name when that same fallback is written back.
    NameFallback {
        source: Weak<dyn Observable>,
        attribute: CompactString,
    },
    /// Calendar time as epoch seconds, 0 meaning unset.
    EpochSeconds,
    /// Reserved path: published verbatim, writes accepted without effect.
    Inert,
}

impl Rule {
    pub fn name_fallback<O: Observable + 'static>(source: &Arc<O>, attribute: &str) -> Self {
        let source: Weak<dyn Observable> = Arc::downgrade(source) as Weak<dyn Observable>;
        Rule::NameFallback { source, attribute: attribute.to_compact_string() }
    }

    pub fn outbound(&self, value: Value) -> Value {
        match (self, value) {
            (Rule::EnumFlag(flag), Value::Enum(e)) => Value::Int((e == *flag) as i64),
            (Rule::Ordinal, Value::Enum(e)) => Value::Int(e.ordinal.into()),
            (Rule::NameFallback { .. }, Value::String(name)) if name.is_empty() => {
                self.fallback().map_or(Value::String(name), Value::String)
            }
            (Rule::EpochSeconds, Value::Timestamp(t)) => Value::Int(t.map_or(0, |t| t.timestamp())),
            (_, value) => value,
        }
    }

    pub fn inbound(&self, value: &Value) -> Inbound {
        match self {
            Rule::EnumFlag(_) | Rule::Inert => Inbound::Ignore,
            Rule::Ordinal => Inbound::PassThrough,
            Rule::NameFallback { .. } => match (value.as_str(), self.fallback()) {
                (Some(name), Some(fallback)) if name == fallback.as_str() => {
                    Inbound::Assign(Value::String(CompactString::default()))
                }
                _ => Inbound::PassThrough,
            },
            Rule::EpochSeconds => match value.as_i64() {
                Some(0) => Inbound::Assign(Value::Timestamp(None)),
                Some(secs) if secs > 0 => match DateTime::from_timestamp(secs, 0) {
                    Some(t) => Inbound::Assign(Value::Timestamp(Some(t))),
                    None => Inbound::Ignore,
                },
                _ => {
                    tracing::warn!(?value, "not a valid epoch timestamp");
                    Inbound::Ignore
                }
            },
        }
    }

    fn fallback(&self) -> Option<CompactString> {
        let Rule::NameFallback { source, attribute } = self else {
            return None;
        };

        match source.upgrade()?.attribute(attribute)? {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

/// Rules by exact path, plus rules covering whole sub-trees.
///
/// An exact rule wins over a sub-tree rule, and a deeper sub-tree over a
/// shallower one. Sub-tree rules see writes only for paths that are not
/// registered; a registered path takes writes through its exact rule alone.
#[derive(Default)]
pub struct CoercionTable {
    exact: BTreeMap<TreePath, Rule>,
    subtrees: Vec<(CompactString, Rule)>,
}

impl CoercionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: TreePath, rule: Rule) {
        self.exact.insert(path, rule);
    }

    /// `prefix` should end in `/`, eg. `/Hub4/`.
    pub fn insert_subtree(&mut self, prefix: impl ToCompactString, rule: Rule) {
        self.subtrees.push((prefix.to_compact_string(), rule));
        self.subtrees.sort_by_key(|(prefix, _)| core::cmp::Reverse(prefix.len()));
    }

    pub fn rule(&self, path: &TreePath) -> Option<&Rule> {
        self.exact.get(path).or_else(|| {
            self.subtrees
                .iter()
                .find(|(prefix, _)| path.is_under(prefix))
                .map(|(_, rule)| rule)
        })
    }

    pub fn outbound(&self, path: &TreePath, value: Value) -> Value {
        match self.rule(path) {
            Some(rule) => rule.outbound(value),
            None => value,
        }
        .finite()
    }

    /// Write to a registered path.
    pub fn inbound(&self, path: &TreePath, value: &Value) -> Inbound {
        self.exact
            .get(path)
            .map_or(Inbound::PassThrough, |rule| rule.inbound(value))
    }

    /// Write to a path nothing is registered at. `None` when no rule covers
    /// it, in which case the write is rejected.
    pub fn inbound_unregistered(&self, path: &TreePath, value: &Value) -> Option<Inbound> {
        self.rule(path).map(|rule| rule.inbound(value))
    }
}
