//! Command Arguments
//!
//! Arguments travel to the host as a tree. Most of it is plain JSON, but a
//! channel can sit anywhere inside it (a watch-options object, an HTTP client
//! options object). [`Arg`] keeps channel references as their own variant so
//! the dispatcher's walk over the tree is an exhaustive match instead of a
//! probe for a marker property.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{self, Deserializer, Visitor};
use serde::ser::Error as _;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Number, Value};

use crate::registry::CallbackId;

/// Prefix of the string a channel reference is serialized as
pub const CHANNEL_PREFIX: &str = "__CHANNEL__:";

/// Reference to a guest channel, as embedded in command arguments
///
/// Serializes to (and deserializes from) `"__CHANNEL__:<id>"`, so host-side
/// argument structs can declare a field of this type directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelRef {
    id: CallbackId,
}

impl ChannelRef {
    /// Reference the channel registered under `id`
    #[must_use]
    pub const fn new(id: CallbackId) -> Self {
        Self { id }
    }

    /// Id of the referenced channel
    #[must_use]
    pub const fn id(&self) -> CallbackId {
        self.id
    }

    /// The wire form, `"__CHANNEL__:<id>"`
    #[must_use]
    pub fn sentinel(&self) -> String {
        format!("{CHANNEL_PREFIX}{}", self.id)
    }

    /// Parse the wire form back into a reference
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let raw = s.strip_prefix(CHANNEL_PREFIX)?;
        raw.parse::<u32>()
            .ok()
            .map(|id| Self::new(CallbackId::from_raw(id)))
    }
}

impl fmt::Display for ChannelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{CHANNEL_PREFIX}{}", self.id)
    }
}

impl Serialize for ChannelRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.sentinel())
    }
}

impl<'de> Deserialize<'de> for ChannelRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ChannelRefVisitor;

        impl Visitor<'_> for ChannelRefVisitor {
            type Value = ChannelRef;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "a string of the form \"{CHANNEL_PREFIX}<id>\"")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                ChannelRef::parse(v).ok_or_else(|| E::invalid_value(de::Unexpected::Str(v), &self))
            }
        }

        deserializer.deserialize_str(ChannelRefVisitor)
    }
}

/// One node of an argument tree
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Arg {
    /// JSON `null`
    #[default]
    Null,
    /// JSON boolean
    Bool(bool),
    /// JSON number
    Number(Number),
    /// JSON string
    String(String),
    /// JSON array
    Array(Vec<Arg>),
    /// JSON object
    Object(BTreeMap<String, Arg>),
    /// Channel reference, replaced by its sentinel string on the wire
    Channel(ChannelRef),
}

impl From<Value> for Arg {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => Self::Number(n),
            Value::String(s) => Self::String(s),
            Value::Array(items) => Self::Array(items.into_iter().map(Self::from).collect()),
            Value::Object(fields) => {
                Self::Object(fields.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
            }
        }
    }
}

impl From<ChannelRef> for Arg {
    fn from(channel: ChannelRef) -> Self {
        Self::Channel(channel)
    }
}

impl From<bool> for Arg {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<&str> for Arg {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Arg {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<u32> for Arg {
    fn from(n: u32) -> Self {
        Self::Number(n.into())
    }
}

impl From<i64> for Arg {
    fn from(n: i64) -> Self {
        Self::Number(n.into())
    }
}

impl From<u64> for Arg {
    fn from(n: u64) -> Self {
        Self::Number(n.into())
    }
}

impl From<f64> for Arg {
    fn from(n: f64) -> Self {
        Number::from_f64(n).map_or(Self::Null, Self::Number)
    }
}

impl<T: Into<Arg>> From<Vec<T>> for Arg {
    fn from(items: Vec<T>) -> Self {
        Self::Array(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Arg>> From<Option<T>> for Arg {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

impl From<Args> for Arg {
    fn from(args: Args) -> Self {
        Self::Object(args.0)
    }
}

/// Named arguments of one command
///
/// The top level of a command's payload is always an object.
///
/// ```ignore
/// let args = Args::new()
///     .with("path", "/tmp/watched")
///     .with("options", Args::new().with("recursive", true).with("onEvent", &channel));
/// ```
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Args(BTreeMap<String, Arg>);

impl Args {
    /// Empty argument object
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field, builder style
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Arg>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Add or replace a field
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Arg>) {
        self.0.insert(key.into(), value.into());
    }

    /// Look up a top-level field
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Arg> {
        self.0.get(key)
    }

    /// Iterate over top-level fields in key order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arg)> {
        self.0.iter()
    }

    /// Number of top-level fields
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no fields
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Build arguments from a serializable struct or map
    ///
    /// Fails if the value doesn't serialize to a JSON object.
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        match serde_json::to_value(value)? {
            Value::Object(fields) => Ok(Self(
                fields.into_iter().map(|(k, v)| (k, Arg::from(v))).collect(),
            )),
            other => Err(serde_json::Error::custom(format!(
                "command arguments must be a JSON object, got {other}"
            ))),
        }
    }
}
