//! # Extended JSON Values
//!
//! Message payloads are JSON, but a few payload kinds have no JSON form of their
//! own: raw byte buffers and regular expressions. Those are lowered to tagged
//! objects on the way out (the *replacer*) and raised back on the way in (the
//! *reviver*):
//!
//! ```text
//! Bytes        <-> { "__t": "bytes", "__d": "<base64>" }
//! Regex(s, f)  <-> { "__t": "regex", "__s": "<source>", "__f": "<flags>" }
//! {"__t", ..}  <-> { "__t": "object", "__d": { "__t", .. } }
//! ```
//!
//! Everything else maps one-to-one onto `serde_json::Value`.

use std::collections::BTreeMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use serde_json::Number;

use crate::error::Error;
use crate::error::Result;

const TAG_KEY: &str = "__t";
const BYTES_TAG: &str = "bytes";
const BYTES_DATA_KEY: &str = "__d";
const REGEX_TAG: &str = "regex";
const REGEX_SOURCE_KEY: &str = "__s";
const REGEX_FLAGS_KEY: &str = "__f";
const OBJECT_TAG: &str = "object";
const OBJECT_DATA_KEY: &str = "__d";

/// A JSON value that can also carry byte buffers and regular expressions.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
    Bytes(Bytes),
    Regex { source: String, flags: String },
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Lowers this value to plain JSON, tagging bytes and regexes.
    pub fn replace(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Value::Number(n.clone()),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::replace).collect())
            }
            Value::Object(fields) => {
                let plain: serde_json::Map<_, _> = fields.iter().map(|(k, v)| (k.clone(), v.replace())).collect();
                if fields.contains_key(TAG_KEY) {
                    // A user key that collides with the tag key is boxed so it cannot read back as a tag.
                    let mut boxed = serde_json::Map::new();
                    boxed.insert(TAG_KEY.to_owned(), serde_json::Value::String(OBJECT_TAG.to_owned()));
                    boxed.insert(OBJECT_DATA_KEY.to_owned(), serde_json::Value::Object(plain));
                    serde_json::Value::Object(boxed)
                } else {
                    serde_json::Value::Object(plain)
                }
            }
            Value::Bytes(data) => tagged(BYTES_TAG, [(BYTES_DATA_KEY, STANDARD.encode(data))]),
            Value::Regex { source, flags } => tagged(
                REGEX_TAG,
                [(REGEX_SOURCE_KEY, source.clone()), (REGEX_FLAGS_KEY, flags.clone())],
            ),
        }
    }

    /// Raises plain JSON back into a `Value`, reviving tagged objects.
    ///
    /// Objects whose `__t` is not a known tag are kept as ordinary objects.
    pub fn revive(raw: serde_json::Value) -> Result<Self> {
        Ok(match raw {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => Value::Array(
                items.into_iter().map(Value::revive).collect::<Result<Vec<_>>>()?,
            ),
            serde_json::Value::Object(mut fields) => {
                let tag = fields.get(TAG_KEY).and_then(|t| t.as_str()).map(str::to_owned);
                match tag.as_deref() {
                    Some(BYTES_TAG) => {
                        let data = take_str(&mut fields, BYTES_DATA_KEY)?;
                        Value::Bytes(Bytes::from(STANDARD.decode(data)?))
                    }
                    Some(REGEX_TAG) => Value::Regex {
                        source: take_str(&mut fields, REGEX_SOURCE_KEY)?,
                        flags: take_str(&mut fields, REGEX_FLAGS_KEY)?,
                    },
                    Some(OBJECT_TAG) => match fields.remove(OBJECT_DATA_KEY) {
                        Some(serde_json::Value::Object(inner)) => revive_fields(inner)?,
                        Some(_) => return Err(Error::InvalidTag(format!("field '{}' must be an object", OBJECT_DATA_KEY))),
                        None => return Err(Error::InvalidTag(format!("missing field '{}'", OBJECT_DATA_KEY))),
                    },
                    _ => revive_fields(fields)?,
                }
            }
        })
    }
}

fn revive_fields(fields: serde_json::Map<String, serde_json::Value>) -> Result<Value> {
    let fields = fields
        .into_iter()
        .map(|(k, v)| Ok((k, Value::revive(v)?)))
        .collect::<Result<BTreeMap<_, _>>>()?;
    Ok(Value::Object(fields))
}

fn tagged<const N: usize>(tag: &str, fields: [(&str, String); N]) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    map.insert(TAG_KEY.to_owned(), serde_json::Value::String(tag.to_owned()));
    for (key, value) in fields {
        map.insert(key.to_owned(), serde_json::Value::String(value));
    }
    serde_json::Value::Object(map)
}

fn take_str(fields: &mut serde_json::Map<String, serde_json::Value>, key: &str) -> Result<String> {
    match fields.remove(key) {
        Some(serde_json::Value::String(s)) => Ok(s),
        Some(_) => Err(Error::InvalidTag(format!("field '{}' must be a string", key))),
        None => Err(Error::InvalidTag(format!("missing field '{}'", key))),
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.replace().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;
        Value::revive(raw).map_err(serde::de::Error::custom)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n.into())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for Value {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        Value::Object(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// Serde adapter for `Bytes` fields that should use the tagged bytes form.
pub mod tagged_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(data: &Bytes, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        Value::Bytes(data.clone()).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Bytes, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Bytes(data) => Ok(data),
            other => Err(serde::de::Error::custom(format!("expected tagged bytes, found {:?}", other))),
        }
    }

    /// The same representation for optional fields; `null` or absence map to `None`.
    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(data: &Option<Bytes>, serializer: S) -> std::result::Result<S::Ok, S::Error> {
            match data {
                Some(data) => Value::Bytes(data.clone()).serialize(serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<Bytes>, D::Error> {
            match Value::deserialize(deserializer)? {
                Value::Null => Ok(None),
                Value::Bytes(data) => Ok(Some(data)),
                other => Err(serde::de::Error::custom(format!("expected tagged bytes, found {:?}", other))),
            }
        }
    }
}
