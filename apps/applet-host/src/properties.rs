//! The fixed table of properties an applet exposes to its container.

use applet_bus::Variant;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Str,
    UInt32,
    Bool,
    Int32Array,
}

impl ValueKind {
    pub fn signature(self) -> &'static str {
        match self {
            ValueKind::Str => "s",
            ValueKind::UInt32 => "u",
            ValueKind::Bool => "b",
            ValueKind::Int32Array => "ai",
        }
    }

    pub fn accepts(self, value: &Variant) -> bool {
        match (self, value) {
            (ValueKind::Str, Variant::Str(_))
            | (ValueKind::UInt32, Variant::UInt32(_))
            | (ValueKind::Bool, Variant::Bool(_)) => true,
            (ValueKind::Int32Array, Variant::Array(items)) => {
                items.iter().all(|item| matches!(item, Variant::Int32(_)))
            }
            _ => false,
        }
    }

    /// Parses the textual form used on the command line. Arrays are
    /// comma separated, e.g. `24,0,48,0`.
    pub fn parse(self, text: &str) -> Result<Variant, String> {
        let text = text.trim();
        match self {
            ValueKind::Str => Ok(Variant::Str(text.to_string())),
            ValueKind::UInt32 => text
                .parse::<u32>()
                .map(Variant::UInt32)
                .map_err(|err| format!("expected an unsigned integer, got '{text}': {err}")),
            ValueKind::Bool => match text.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(Variant::Bool(true)),
                "false" | "0" | "no" => Ok(Variant::Bool(false)),
                _ => Err(format!("expected a boolean, got '{text}'")),
            },
            ValueKind::Int32Array => {
                if text.is_empty() {
                    return Ok(Variant::Array(Vec::new()));
                }
                text.split(',')
                    .map(|item| {
                        item.trim()
                            .parse::<i32>()
                            .map(Variant::Int32)
                            .map_err(|err| format!("invalid array item '{item}': {err}"))
                    })
                    .collect::<Result<Vec<_>, _>>()
                    .map(Variant::Array)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PropertyDescriptor {
    pub name: &'static str,
    pub remote_name: &'static str,
    pub kind: ValueKind,
    #[serde(skip)]
    pub aliases: &'static [&'static str],
}

impl PropertyDescriptor {
    fn answers_to(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
            || self.aliases.iter().any(|alias| alias.eq_ignore_ascii_case(name))
    }
}

const fn property(
    name: &'static str,
    remote_name: &'static str,
    kind: ValueKind,
) -> PropertyDescriptor {
    PropertyDescriptor {
        name,
        remote_name,
        kind,
        aliases: &[],
    }
}

pub static PROPERTIES: [PropertyDescriptor; 8] = [
    property("prefs-path", "PrefsPath", ValueKind::Str),
    PropertyDescriptor {
        name: "orient",
        remote_name: "Orient",
        kind: ValueKind::UInt32,
        aliases: &["orientation"],
    },
    property("size", "Size", ValueKind::UInt32),
    property("size-hints", "SizeHints", ValueKind::Int32Array),
    property("background", "Background", ValueKind::Str),
    property("flags", "Flags", ValueKind::UInt32),
    property("locked", "Locked", ValueKind::Bool),
    property("locked-down", "LockedDown", ValueKind::Bool),
];

/// Case-insensitive lookup by local name.
pub fn lookup(name: &str) -> Option<&'static PropertyDescriptor> {
    PROPERTIES.iter().find(|descriptor| descriptor.answers_to(name))
}

pub fn by_remote_name(remote_name: &str) -> Option<&'static PropertyDescriptor> {
    PROPERTIES
        .iter()
        .find(|descriptor| descriptor.remote_name == remote_name)
}
