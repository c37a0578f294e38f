//! Dynamic values exchanged between the host and scripts.
//!
//! [`Value`] has exactly eight variants. Sequence containers coming from a
//! script are split into [`Value::Array`] (keys are exactly `0..n-1` in
//! iteration order) and [`Value::Map`] (anything else), see
//! [`classify`](super::classify::classify).

use super::classify::{classify, next_free_index, Shape};
use super::error::Error;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum container nesting accepted when copying values out of a script.
pub const MAX_VALUE_DEPTH: usize = 100;
/// Maximum approximate payload accepted when copying values out of a script.
pub const MAX_VALUE_BYTES: usize = 10 * 1024 * 1024;

/// Map key: either an integer index or a string.
///
/// String keys that spell a canonical integer (`"7"`, `"-3"`, but not `"07"`
/// or `"+1"`) are normalized to [`Key::Int`] when converted from text, which
/// is how the script runtime treats them as property names.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Key {
    Int(i64),
    Str(String),
}

impl Key {
    /// Parse a property name, normalizing canonical integers.
    pub fn parse(name: &str) -> Key {
        match canonical_int(name) {
            Some(index) => Key::Int(index),
            None => Key::Str(name.to_owned()),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Key::Int(index) => Some(*index),
            Key::Str(_) => None,
        }
    }
}

fn canonical_int(name: &str) -> Option<i64> {
    let digits = name.strip_prefix('-').unwrap_or(name);
    let canonical = match digits.as_bytes() {
        [] => false,
        [b'0'] => digits.len() == name.len(),
        [first, rest @ ..] => {
            (b'1'..=b'9').contains(first) && rest.iter().all(u8::is_ascii_digit)
        }
    };
    if canonical {
        name.parse().ok()
    } else {
        None
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Int(index) => write!(f, "{index}"),
            Key::Str(name) => f.write_str(name),
        }
    }
}

impl From<i64> for Key {
    fn from(index: i64) -> Self {
        Key::Int(index)
    }
}

impl From<i32> for Key {
    fn from(index: i32) -> Self {
        Key::Int(index.into())
    }
}

impl From<usize> for Key {
    fn from(index: usize) -> Self {
        Key::Int(index as i64)
    }
}

impl From<&str> for Key {
    fn from(name: &str) -> Self {
        Key::parse(name)
    }
}

impl From<String> for Key {
    fn from(name: String) -> Self {
        match canonical_int(&name) {
            Some(index) => Key::Int(index),
            None => Key::Str(name),
        }
    }
}

/// Variant tag of a [`Value`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    Null,
    Long,
    Double,
    Bool,
    String,
    Array,
    Map,
    Object,
}

/// Instance of a named class, copied out of the script.
///
/// `string_cast` holds the result of the instance's own `toString` when the
/// class overrides it. It is captured at conversion time because the
/// instance itself does not survive the copy.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Object {
    pub class: String,
    pub properties: IndexMap<String, Value>,
    pub string_cast: Option<Vec<u8>>,
}

impl Object {
    pub fn new(class: impl Into<String>) -> Self {
        Object {
            class: class.into(),
            ..Default::default()
        }
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }
}

/// Dynamic value exchanged with a script.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Value {
    #[default]
    Null,
    Long(i64),
    Double(f64),
    Bool(bool),
    /// Byte string. Script strings arrive as UTF-8.
    String(Vec<u8>),
    /// Contiguous list, keys `0..n-1`.
    Array(Vec<Value>),
    /// Ordered map with integer or string keys.
    Map(IndexMap<Key, Value>),
    Object(Object),
}

impl Value {
    pub fn string(bytes: impl Into<Vec<u8>>) -> Value {
        Value::String(bytes.into())
    }

    /// Build a container from ordered entries.
    ///
    /// The result is an `Array` when the keys are exactly `0..n-1` in order,
    /// otherwise a `Map`. Later duplicates replace earlier values in place.
    pub fn from_entries<K, V, I>(entries: I) -> Value
    where
        K: Into<Key>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        let map: IndexMap<Key, Value> = entries
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .collect();
        let next_free = next_free_index(map.keys());
        match classify(next_free, map.keys()) {
            Shape::Array => Value::Array(map.into_values().collect()),
            Shape::Map => Value::Map(map),
        }
    }

    pub fn kind(&self) -> Kind {
        match self {
            Value::Null => Kind::Null,
            Value::Long(_) => Kind::Long,
            Value::Double(_) => Kind::Double,
            Value::Bool(_) => Kind::Bool,
            Value::String(_) => Kind::String,
            Value::Array(_) => Kind::Array,
            Value::Map(_) => Kind::Map,
            Value::Object(_) => Kind::Object,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Number of elements. `Null` has none and every scalar counts as one.
    pub fn size(&self) -> usize {
        match self {
            Value::Null => 0,
            Value::Array(items) => items.len(),
            Value::Map(entries) => entries.len(),
            Value::Object(object) => object.properties.len(),
            Value::Long(_) | Value::Double(_) | Value::Bool(_) | Value::String(_) => 1,
        }
    }

    /// Element at integer key `index`, or `Null` when there is none.
    ///
    /// A scalar behaves like a one-element list holding itself.
    pub fn index(&self, index: i64) -> Value {
        match self {
            Value::Null => Value::Null,
            Value::Array(items) => usize::try_from(index)
                .ok()
                .and_then(|at| items.get(at))
                .cloned()
                .unwrap_or_default(),
            Value::Map(entries) => entries.get(&Key::Int(index)).cloned().unwrap_or_default(),
            Value::Object(object) => object
                .properties
                .get(&index.to_string())
                .cloned()
                .unwrap_or_default(),
            scalar if index == 0 => scalar.clone(),
            _ => Value::Null,
        }
    }

    /// Element at the named key, or `Null` when there is none.
    pub fn key(&self, name: &str) -> Value {
        match (self, Key::parse(name)) {
            (Value::Map(entries), key) => entries.get(&key).cloned().unwrap_or_default(),
            (Value::Object(object), _) => {
                object.properties.get(name).cloned().unwrap_or_default()
            }
            (_, Key::Int(index)) => self.index(index),
            (_, Key::Str(_)) => Value::Null,
        }
    }

    /// Keys in iteration order. A scalar has the single key `0`.
    pub fn keys(&self) -> Vec<Key> {
        match self {
            Value::Null => Vec::new(),
            Value::Array(items) => (0..items.len()).map(Key::from).collect(),
            Value::Map(entries) => entries.keys().cloned().collect(),
            Value::Object(object) => object
                .properties
                .keys()
                .map(|name| Key::parse(name))
                .collect(),
            Value::Long(_) | Value::Double(_) | Value::Bool(_) | Value::String(_) => {
                vec![Key::Int(0)]
            }
        }
    }

    pub fn cursor(&self) -> Cursor<'_> {
        Cursor {
            value: self,
            position: 0,
        }
    }

    /// Copy an ordered JSON value. Objects are classified like any other
    /// keyed container.
    pub fn from_json(json: serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(flag) => Value::Bool(flag),
            serde_json::Value::Number(number) => match number.as_i64() {
                Some(long) => Value::Long(long),
                None => Value::Double(number.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(text) => Value::String(text.into_bytes()),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(entries) => Value::from_entries(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, Value::from_json(value))),
            ),
        }
    }
}

/// Explicitly resettable walk over a value's entries.
///
/// Scalars yield themselves once under key `0`; `Null` yields nothing.
pub struct Cursor<'a> {
    value: &'a Value,
    position: usize,
}

impl<'a> Cursor<'a> {
    pub fn reset(&mut self) {
        self.position = 0;
    }
}

impl<'a> Iterator for Cursor<'a> {
    type Item = (Key, &'a Value);

    fn next(&mut self) -> Option<Self::Item> {
        let at = self.position;
        let entry = match self.value {
            Value::Null => None,
            Value::Array(items) => items.get(at).map(|item| (Key::from(at), item)),
            Value::Map(entries) => entries.get_index(at).map(|(key, item)| (key.clone(), item)),
            Value::Object(object) => object
                .properties
                .get_index(at)
                .map(|(name, item)| (Key::parse(name), item)),
            scalar => (at == 0).then_some((Key::Int(0), scalar)),
        };
        if entry.is_some() {
            self.position += 1;
        }
        entry
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Null
    }
}

impl From<bool> for Value {
    fn from(flag: bool) -> Self {
        Value::Bool(flag)
    }
}

impl From<i32> for Value {
    fn from(long: i32) -> Self {
        Value::Long(long.into())
    }
}

impl From<i64> for Value {
    fn from(long: i64) -> Self {
        Value::Long(long)
    }
}

impl From<u32> for Value {
    fn from(long: u32) -> Self {
        Value::Long(long.into())
    }
}

impl From<f64> for Value {
    fn from(double: f64) -> Self {
        Value::Double(double)
    }
}

impl From<&str> for Value {
    fn from(text: &str) -> Self {
        Value::String(text.as_bytes().to_vec())
    }
}

impl From<String> for Value {
    fn from(text: String) -> Self {
        Value::String(text.into_bytes())
    }
}

impl From<&[u8]> for Value {
    fn from(bytes: &[u8]) -> Self {
        Value::String(bytes.to_vec())
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::Array(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or_default()
    }
}

impl<K: Into<Key>, V: Into<Value>> From<IndexMap<K, V>> for Value {
    fn from(entries: IndexMap<K, V>) -> Self {
        Value::from_entries(entries)
    }
}

impl From<Object> for Value {
    fn from(object: Object) -> Self {
        Value::Object(object)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        Value::from_json(json)
    }
}

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeMap;

        match self {
            Value::Null => serializer.serialize_none(),
            Value::Long(long) => serializer.serialize_i64(*long),
            Value::Double(double) => serializer.serialize_f64(*double),
            Value::Bool(flag) => serializer.serialize_bool(*flag),
            Value::String(bytes) => match std::str::from_utf8(bytes) {
                Ok(text) => serializer.serialize_str(text),
                Err(_) => serializer.serialize_bytes(bytes),
            },
            Value::Array(items) => items.serialize(serializer),
            Value::Map(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (key, value) in entries {
                    map.serialize_entry(&key.to_string(), value)?;
                }
                map.end()
            }
            Value::Object(object) => {
                let mut map = serializer.serialize_map(Some(object.properties.len()))?;
                for (name, value) in &object.properties {
                    map.serialize_entry(name, value)?;
                }
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::{self, Visitor};

        struct ValueVisitor;

        impl<'de> Visitor<'de> for ValueVisitor {
            type Value = Value;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a null, bool, number, string, sequence or map")
            }

            fn visit_bool<E>(self, flag: bool) -> Result<Value, E> {
                Ok(Value::Bool(flag))
            }

            fn visit_i64<E>(self, long: i64) -> Result<Value, E> {
                Ok(Value::Long(long))
            }

            fn visit_u64<E>(self, long: u64) -> Result<Value, E> {
                Ok(i64::try_from(long)
                    .map(Value::Long)
                    .unwrap_or(Value::Double(long as f64)))
            }

            fn visit_f64<E>(self, double: f64) -> Result<Value, E> {
                Ok(Value::Double(double))
            }

            fn visit_str<E>(self, text: &str) -> Result<Value, E> {
                Ok(Value::from(text))
            }

            fn visit_string<E>(self, text: String) -> Result<Value, E> {
                Ok(Value::from(text))
            }

            fn visit_bytes<E>(self, bytes: &[u8]) -> Result<Value, E> {
                Ok(Value::from(bytes))
            }

            fn visit_none<E>(self) -> Result<Value, E> {
                Ok(Value::Null)
            }

            fn visit_unit<E>(self) -> Result<Value, E> {
                Ok(Value::Null)
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Value, A::Error>
            where
                A: de::SeqAccess<'de>,
            {
                let mut items = Vec::new();
                while let Some(item) = seq.next_element()? {
                    items.push(item);
                }
                Ok(Value::Array(items))
            }

            fn visit_map<A>(self, mut map: A) -> Result<Value, A::Error>
            where
                A: de::MapAccess<'de>,
            {
                let mut entries: Vec<(String, Value)> = Vec::new();
                while let Some(entry) = map.next_entry()? {
                    entries.push(entry);
                }
                Ok(Value::from_entries(entries))
            }
        }

        deserializer.deserialize_any(ValueVisitor)
    }
}

/// Depth and size accounting for a single copy out of the script heap.
pub struct LimitTracker {
    max_depth: usize,
    max_bytes: usize,
    depth: usize,
    bytes: usize,
}

impl LimitTracker {
    pub fn new(max_depth: usize, max_bytes: usize) -> Self {
        Self {
            max_depth,
            max_bytes,
            depth: 0,
            bytes: 0,
        }
    }

    pub fn enter(&mut self) -> Result<(), Error> {
        self.depth += 1;
        if self.depth > self.max_depth {
            return Err(Error::Conversion(format!(
                "nesting deeper than {} levels",
                self.max_depth
            )));
        }
        Ok(())
    }

    pub fn exit(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    pub fn add_bytes(&mut self, bytes: usize) -> Result<(), Error> {
        self.bytes += bytes;
        if self.bytes > self.max_bytes {
            return Err(Error::Conversion(format!(
                "value of {} bytes exceeds the {} byte limit",
                self.bytes, self.max_bytes
            )));
        }
        Ok(())
    }
}

impl Default for LimitTracker {
    fn default() -> Self {
        Self::new(MAX_VALUE_DEPTH, MAX_VALUE_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_normalization() {
        assert_eq!(Key::parse("0"), Key::Int(0));
        assert_eq!(Key::parse("42"), Key::Int(42));
        assert_eq!(Key::parse("-7"), Key::Int(-7));
        assert_eq!(Key::parse("07"), Key::Str("07".into()));
        assert_eq!(Key::parse("-0"), Key::Str("-0".into()));
        assert_eq!(Key::parse("+1"), Key::Str("+1".into()));
        assert_eq!(Key::parse(""), Key::Str(String::new()));
        assert_eq!(Key::parse("1.5"), Key::Str("1.5".into()));
        assert_eq!(
            Key::parse("99999999999999999999"),
            Key::Str("99999999999999999999".into())
        );
    }

    #[test]
    fn from_entries_classifies() {
        let list = Value::from_entries([(0, "a"), (1, "b")]);
        assert_eq!(list, Value::Array(vec!["a".into(), "b".into()]));

        let shuffled = Value::from_entries([(1, "b"), (0, "a")]);
        assert_eq!(shuffled.kind(), Kind::Map);

        let named = Value::from_entries([("a", 1)]);
        assert_eq!(named.kind(), Kind::Map);

        let numeric_text = Value::from_entries([("0", 1), ("1", 2)]);
        assert_eq!(numeric_text, Value::Array(vec![1.into(), 2.into()]));

        let empty = Value::from_entries(Vec::<(Key, Value)>::new());
        assert_eq!(empty, Value::Array(Vec::new()));
    }

    #[test]
    fn size_rules() {
        assert_eq!(Value::Null.size(), 0);
        assert_eq!(Value::Long(5).size(), 1);
        assert_eq!(Value::Double(0.5).size(), 1);
        assert_eq!(Value::Bool(false).size(), 1);
        assert_eq!(Value::from("").size(), 1);
        assert_eq!(Value::from(vec![1, 2, 3]).size(), 3);
        assert_eq!(Value::from_entries([("a", 1), ("b", 2)]).size(), 2);
        assert_eq!(
            Value::from(Object::new("Point").with_property("x", 1)).size(),
            1
        );
    }

    #[test]
    fn index_on_scalars_and_null() {
        let scalar = Value::from("abc");
        assert_eq!(scalar.index(0), scalar);
        assert_eq!(scalar.index(1), Value::Null);
        assert_eq!(scalar.index(-1), Value::Null);
        assert_eq!(Value::Null.index(0), Value::Null);
        assert_eq!(scalar.keys(), vec![Key::Int(0)]);
        assert!(Value::Null.keys().is_empty());
    }

    #[test]
    fn index_and_key_on_containers() {
        let list = Value::from(vec!["x", "y"]);
        assert_eq!(list.index(1), Value::from("y"));
        assert_eq!(list.index(2), Value::Null);
        assert_eq!(list.key("0"), Value::from("x"));
        assert_eq!(list.key("name"), Value::Null);

        let map = Value::from_entries([(Key::from(3), Value::from("three")), ("k".into(), 1.into())]);
        assert_eq!(map.index(3), Value::from("three"));
        assert_eq!(map.key("3"), Value::from("three"));
        assert_eq!(map.key("k"), Value::Long(1));
        assert_eq!(map.keys(), vec![Key::Int(3), Key::Str("k".into())]);

        let object = Value::from(Object::new("User").with_property("name", "ada"));
        assert_eq!(object.key("name"), Value::from("ada"));
        assert_eq!(object.key("missing"), Value::Null);
    }

    #[test]
    fn cursor_walks_and_resets() {
        let scalar = Value::Long(9);
        let mut cursor = scalar.cursor();
        assert_eq!(cursor.next(), Some((Key::Int(0), &Value::Long(9))));
        assert_eq!(cursor.next(), None);
        cursor.reset();
        assert_eq!(cursor.next(), Some((Key::Int(0), &Value::Long(9))));

        assert_eq!(Value::Null.cursor().count(), 0);

        let map = Value::from_entries([("a", 1), ("b", 2)]);
        let keys: Vec<Key> = map.cursor().map(|(key, _)| key).collect();
        assert_eq!(keys, vec![Key::Str("a".into()), Key::Str("b".into())]);
    }

    #[test]
    fn deserializes_json_with_classification() {
        let value: Value = serde_json::from_value(json!({
            "list": [1, 2.5, "three", null, true],
            "indexed": {"0": "a", "1": "b"},
            "sparse": {"0": "a", "2": "c"}
        }))
        .unwrap();

        assert_eq!(value.kind(), Kind::Map);
        assert_eq!(
            value.key("list"),
            Value::Array(vec![
                Value::Long(1),
                Value::Double(2.5),
                Value::from("three"),
                Value::Null,
                Value::Bool(true),
            ])
        );
        assert_eq!(value.key("indexed").kind(), Kind::Array);
        assert_eq!(value.key("sparse").kind(), Kind::Map);
        assert_eq!(Value::from_json(json!({"x": 1})), value_with_x());
    }

    fn value_with_x() -> Value {
        Value::from_entries([("x", 1)])
    }

    #[test]
    fn serializes_to_json() {
        let value = Value::from_entries([
            (Key::from("name"), Value::from("ada")),
            (Key::from(7), Value::from(vec![1, 2])),
        ]);
        let json = serde_json::to_value(&value).unwrap();
        assert_eq!(json, json!({"name": "ada", "7": [1, 2]}));

        let object = Value::from(Object::new("Point").with_property("x", 1.5));
        assert_eq!(serde_json::to_value(&object).unwrap(), json!({"x": 1.5}));
    }

    #[test]
    fn limit_tracker_enforces_depth_and_size() {
        let mut tracker = LimitTracker::new(2, 10);
        tracker.enter().unwrap();
        tracker.enter().unwrap();
        assert!(tracker.enter().is_err());
        tracker.exit();
        tracker.exit();
        tracker.exit();
        tracker.add_bytes(10).unwrap();
        assert!(matches!(tracker.add_bytes(1), Err(Error::Conversion(_))));
    }
}
