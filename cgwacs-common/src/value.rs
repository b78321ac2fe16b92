use core::fmt::{self, Display};

use chrono::{DateTime, Utc};
use compact_str::CompactString;
use serde::{Deserialize, Serialize, Serializer};

/// Static description of a local enumeration, so values of it can travel as
/// [`Value::Enum`] and be narrowed back from a wire ordinal.
#[derive(Debug, PartialEq, Eq)]
pub struct EnumKind {
    pub name: &'static str,
    pub variants: &'static [&'static str],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnumValue {
    pub kind: &'static EnumKind,
    pub ordinal: u16,
}

impl EnumValue {
    pub fn new(kind: &'static EnumKind, ordinal: u16) -> Option<Self> {
        ((ordinal as usize) < kind.variants.len()).then_some(Self { kind, ordinal })
    }

    pub fn variant(&self) -> &'static str {
        self.kind.variants[self.ordinal as usize]
    }
}

/// A value as seen on either side of the bridge.
///
/// `Enum` and `Timestamp` only exist locally; [`Serialize`] maps every variant
/// to its wire form.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Invalid,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(CompactString),
    /// Calendar time, `None` when unset.
    Timestamp(Option<DateTime<Utc>>),
    Enum(EnumValue),
}

/// Declared type of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Bool,
    Int,
    Float,
    String,
    Timestamp,
    Enum(&'static EnumKind),
}

impl Value {
    pub fn kind(&self) -> Option<Kind> {
        Some(match self {
            Value::Invalid => return None,
            Value::Bool(_) => Kind::Bool,
            Value::Int(_) => Kind::Int,
            Value::Float(_) => Kind::Float,
            Value::String(_) => Kind::String,
            Value::Timestamp(_) => Kind::Timestamp,
            Value::Enum(e) => Kind::Enum(e.kind),
        })
    }

    pub fn is_valid(&self) -> bool {
        !matches!(self, Value::Invalid)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Bool(b) => Some(*b as i64),
            Value::Int(i) => Some(*i),
            // i64::MAX as f64 rounds up to 2^63, which is already out of range
            Value::Float(f)
                if f.fract() == 0.0 && *f >= i64::MIN as f64 && *f < i64::MAX as f64 =>
            {
                Some(*f as i64)
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Converts the value to `kind` where that loses no information.
    pub fn narrow(self, kind: Kind) -> Option<Value> {
        match (kind, self) {
            (Kind::Bool, Value::Bool(b)) => Some(Value::Bool(b)),
            (Kind::Bool, v @ (Value::Int(_) | Value::Float(_))) => match v.as_i64() {
                Some(0) => Some(Value::Bool(false)),
                Some(1) => Some(Value::Bool(true)),
                _ => None,
            },
            (Kind::Int, v @ (Value::Bool(_) | Value::Int(_) | Value::Float(_))) => {
                v.as_i64().map(Value::Int)
            }
            (Kind::Float, v @ (Value::Int(_) | Value::Float(_))) => v.as_f64().map(Value::Float),
            (Kind::String, Value::String(s)) => Some(Value::String(s)),
            (Kind::Timestamp, Value::Timestamp(t)) => Some(Value::Timestamp(t)),
            (Kind::Enum(kind), Value::Enum(e)) if e.kind == kind => Some(Value::Enum(e)),
            (Kind::Enum(kind), v @ (Value::Int(_) | Value::Float(_))) => v
                .as_i64()
                .and_then(|i| u16::try_from(i).ok())
                .and_then(|ordinal| EnumValue::new(kind, ordinal))
                .map(Value::Enum),
            _ => None,
        }
    }

    /// Replaces non-finite floats with [`Value::Invalid`].
    pub fn finite(self) -> Value {
        match self {
            Value::Float(f) if !f.is_finite() => Value::Invalid,
            v => v,
        }
    }

    /// Parses a JSON wire value. Arrays and objects have no local counterpart.
    pub fn from_wire(json: serde_json::Value) -> Result<Self, &'static str> {
        Ok(match json {
            serde_json::Value::Null => Value::Invalid,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match (n.as_i64(), n.as_f64()) {
                (Some(i), _) => Value::Int(i),
                (None, Some(f)) => Value::Float(f),
                (None, None) => return Err("number out of range"),
            },
            serde_json::Value::String(s) => Value::String(s.into()),
            serde_json::Value::Array(_) => return Err("arrays are not valid tree values"),
            serde_json::Value::Object(_) => return Err("objects are not valid tree values"),
        })
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Invalid => serializer.serialize_none(),
            Value::Bool(b) => serializer.serialize_i64(*b as i64),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(f) if f.is_finite() => serializer.serialize_f64(*f),
            Value::Float(_) => serializer.serialize_none(),
            Value::String(s) => serializer.serialize_str(s),
            Value::Timestamp(t) => serializer.serialize_i64(t.map_or(0, |t| t.timestamp())),
            Value::Enum(e) => serializer.serialize_u16(e.ordinal),
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = serde_json::Value::deserialize(deserializer)?;
        Value::from_wire(json).map_err(serde::de::Error::custom)
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Invalid => f.write_str("--"),
            Value::Bool(b) => write!(f, "{}", *b as u8),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(v) => match f.precision() {
                Some(p) => write!(f, "{v:.p$}"),
                None => write!(f, "{v}"),
            },
            Value::String(s) => f.write_str(s),
            Value::Timestamp(Some(t)) => write!(f, "{}", t.to_rfc3339()),
            Value::Timestamp(None) => f.write_str("--"),
            Value::Enum(e) => f.write_str(e.variant()),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value.into())
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::Int(value.into())
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.into())
    }
}

impl From<CompactString> for Value {
    fn from(value: CompactString) -> Self {
        Value::String(value)
    }
}

impl From<Option<DateTime<Utc>>> for Value {
    fn from(value: Option<DateTime<Utc>>) -> Self {
        Value::Timestamp(value)
    }
}

impl From<EnumValue> for Value {
    fn from(value: EnumValue) -> Self {
        Value::Enum(value)
    }
}

/// Implements [`EnumKind`] plumbing for a fieldless local enum.
///
/// Variants are numbered in declaration order, which is also their wire
/// ordinal.
#[macro_export]
macro_rules! local_enum {
    (
        $( #[ $meta:meta ] )*
        pub enum $name:ident { $( $variant:ident ),+ $(,)? }
    ) => {
        $( #[ $meta ] )*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum $name { $( $variant ),+ }

        impl $name {
            pub const KIND: $crate::EnumKind = $crate::EnumKind {
                name: stringify!($name),
                variants: &[ $( stringify!($variant) ),+ ],
            };

            const ALL: &[$name] = &[ $( $name::$variant ),+ ];

            pub fn ordinal(self) -> u16 {
                $name::ALL.iter().position(|v| *v == self).unwrap_or_default() as u16
            }

            pub fn from_ordinal(ordinal: u16) -> Option<Self> {
                $name::ALL.get(ordinal as usize).copied()
            }

            pub fn enum_value(self) -> $crate::EnumValue {
                $crate::EnumValue { kind: &$name::KIND, ordinal: self.ordinal() }
            }
        }

        impl From<$name> for $crate::Value {
            fn from(value: $name) -> Self {
                $crate::Value::Enum(value.enum_value())
            }
        }

        impl TryFrom<&$crate::Value> for $name {
            type Error = ();

            fn try_from(value: &$crate::Value) -> Result<Self, Self::Error> {
                match value {
                    $crate::Value::Enum(e) if *e.kind == $name::KIND => {
                        $name::ALL.get(e.ordinal as usize).copied().ok_or(())
                    }
                    _ => Err(()),
                }
            }
        }
    };
}
