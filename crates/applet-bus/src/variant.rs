use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Dynamically typed value carried in call bodies, replies and signals.
///
/// This mirrors the subset of the session-bus type system the applet
/// protocol actually uses; containers are kept homogeneous by convention
/// rather than by construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Variant {
    Bool(bool),
    Int32(i32),
    UInt32(u32),
    Double(f64),
    Str(String),
    ObjectPath(String),
    Array(Vec<Variant>),
    Dict(BTreeMap<String, Variant>),
    Tuple(Vec<Variant>),
}

impl Variant {
    pub fn object_path(path: impl Into<String>) -> Self {
        Variant::ObjectPath(path.into())
    }

    pub fn empty_dict() -> Self {
        Variant::Dict(BTreeMap::new())
    }

    /// Type signature in bus notation, e.g. `u`, `ai`, `a{sv}`.
    pub fn signature(&self) -> String {
        match self {
            Variant::Bool(_) => "b".into(),
            Variant::Int32(_) => "i".into(),
            Variant::UInt32(_) => "u".into(),
            Variant::Double(_) => "d".into(),
            Variant::Str(_) => "s".into(),
            Variant::ObjectPath(_) => "o".into(),
            Variant::Array(items) => match items.first() {
                Some(first) => format!("a{}", first.signature()),
                None => "av".into(),
            },
            Variant::Dict(_) => "a{sv}".into(),
            Variant::Tuple(items) => {
                let inner: String = items.iter().map(Variant::signature).collect();
                format!("({inner})")
            }
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Variant::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Variant::Int32(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Variant::UInt32(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Variant::Str(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_object_path(&self) -> Option<&str> {
        match self {
            Variant::ObjectPath(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Variant]> {
        match self {
            Variant::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<String, Variant>> {
        match self {
            Variant::Dict(entries) => Some(entries),
            _ => None,
        }
    }
}

impl From<bool> for Variant {
    fn from(value: bool) -> Self {
        Variant::Bool(value)
    }
}

impl From<i32> for Variant {
    fn from(value: i32) -> Self {
        Variant::Int32(value)
    }
}

impl From<u32> for Variant {
    fn from(value: u32) -> Self {
        Variant::UInt32(value)
    }
}

impl From<f64> for Variant {
    fn from(value: f64) -> Self {
        Variant::Double(value)
    }
}

impl From<&str> for Variant {
    fn from(value: &str) -> Self {
        Variant::Str(value.to_string())
    }
}

impl From<String> for Variant {
    fn from(value: String) -> Self {
        Variant::Str(value)
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variant::Bool(value) => write!(f, "{value}"),
            Variant::Int32(value) => write!(f, "{value}"),
            Variant::UInt32(value) => write!(f, "uint32 {value}"),
            Variant::Double(value) => write!(f, "{value}"),
            Variant::Str(value) => write!(f, "'{value}'"),
            Variant::ObjectPath(value) => write!(f, "objectpath '{value}'"),
            Variant::Array(items) => {
                f.write_str("[")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Variant::Dict(entries) => {
                f.write_str("{")?;
                for (idx, (key, value)) in entries.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "'{key}': <{value}>")?;
                }
                f.write_str("}")
            }
            Variant::Tuple(items) => {
                f.write_str("(")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str(")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signatures_follow_bus_notation() {
        assert_eq!(Variant::from(7u32).signature(), "u");
        assert_eq!(
            Variant::Array(vec![Variant::Int32(1), Variant::Int32(2)]).signature(),
            "ai"
        );
        assert_eq!(Variant::empty_dict().signature(), "a{sv}");
        assert_eq!(
            Variant::Tuple(vec![
                Variant::object_path("/obj/1"),
                Variant::Bool(false),
                Variant::UInt32(0),
                Variant::UInt32(7),
            ])
            .signature(),
            "(obuu)"
        );
    }

    #[test]
    fn display_renders_text_form() {
        let mut dict = BTreeMap::new();
        dict.insert("Flags".to_string(), Variant::UInt32(3));
        assert_eq!(Variant::Dict(dict).to_string(), "{'Flags': <uint32 3>}");
        assert_eq!(Variant::from("none").to_string(), "'none'");
    }
}
