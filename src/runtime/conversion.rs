//! Conversion between V8 handles and [`Value`].
//!
//! Copying out of V8 is always deep. Arrays, plain objects and `Map`s are
//! classified into `Array` or `Map`; instances of any other class become
//! `Object` carrying the constructor name. Cycles and oversized values are
//! rejected.

use super::classify::{classify, next_free_index, Shape};
use super::error::{Error, Result};
use super::value::{Key, LimitTracker, Object, Value};
use indexmap::IndexMap;

/// Largest integer a JS number holds exactly.
const MAX_SAFE_INTEGER: i64 = (1 << 53) - 1;

pub(crate) fn v8_str<'s>(scope: &mut v8::HandleScope<'s>, text: &str) -> Result<v8::Local<'s, v8::String>> {
    v8::String::new(scope, text)
        .ok_or_else(|| Error::Allocation(format!("string of {} bytes", text.len())))
}

fn v8_bytes<'s>(scope: &mut v8::HandleScope<'s>, bytes: &[u8]) -> Result<v8::Local<'s, v8::String>> {
    v8::String::new_from_utf8(scope, bytes, v8::NewStringType::Normal)
        .ok_or_else(|| Error::Allocation(format!("string of {} bytes", bytes.len())))
}

/// Build the V8 counterpart of `value`.
pub(crate) fn to_v8<'s>(
    scope: &mut v8::HandleScope<'s>,
    value: &Value,
) -> Result<v8::Local<'s, v8::Value>> {
    let converted: v8::Local<v8::Value> = match value {
        Value::Null => v8::null(scope).into(),
        Value::Long(long) if (-MAX_SAFE_INTEGER..=MAX_SAFE_INTEGER).contains(long) => {
            v8::Number::new(scope, *long as f64).into()
        }
        Value::Long(long) => v8::BigInt::new_from_i64(scope, *long).into(),
        Value::Double(double) => v8::Number::new(scope, *double).into(),
        Value::Bool(flag) => v8::Boolean::new(scope, *flag).into(),
        Value::String(bytes) => v8_bytes(scope, bytes)?.into(),
        Value::Array(items) => {
            let length = i32::try_from(items.len())
                .map_err(|_| Error::Allocation(format!("array of {} elements", items.len())))?;
            let array = v8::Array::new(scope, length);
            for (index, item) in items.iter().enumerate() {
                let item = to_v8(scope, item)?;
                array
                    .set_index(scope, index as u32, item)
                    .ok_or_else(|| Error::Conversion(format!("could not store index {index}")))?;
            }
            array.into()
        }
        Value::Map(entries) if object_keeps_order(entries.keys()) => {
            let object = v8::Object::new(scope);
            for (key, item) in entries {
                define_property(scope, object, &key.to_string(), item)?;
            }
            object.into()
        }
        Value::Map(entries) => {
            let map = v8::Map::new(scope);
            for (key, item) in entries {
                let key = match key {
                    Key::Int(index) => to_v8(scope, &Value::Long(*index))?,
                    Key::Str(name) => v8_str(scope, name)?.into(),
                };
                let item = to_v8(scope, item)?;
                map.set(scope, key, item)
                    .ok_or_else(|| Error::Conversion("could not store map entry".to_string()))?;
            }
            map.into()
        }
        Value::Object(object) => instantiate(scope, object)?.into(),
    };
    Ok(converted)
}

/// Whether a plain object enumerates `keys` in the order given.
///
/// Objects list array-index keys first in ascending order, then every other
/// key in insertion order. Maps that disagree travel as a JS `Map`.
fn object_keeps_order<'k>(keys: impl IntoIterator<Item = &'k Key>) -> bool {
    let mut last_index = None;
    let mut named = false;
    for key in keys {
        match array_index(key) {
            Some(index) => {
                if named || last_index.is_some_and(|last| last >= index) {
                    return false;
                }
                last_index = Some(index);
            }
            None => named = true,
        }
    }
    true
}

fn array_index(key: &Key) -> Option<u32> {
    let index = match key {
        Key::Int(index) => u32::try_from(*index).ok()?,
        Key::Str(name) => name.parse::<u32>().ok().filter(|index| index.to_string() == *name)?,
    };
    (index != u32::MAX).then_some(index)
}

/// Assign a global the way script assignment would.
pub(crate) fn set_property<'s>(
    scope: &mut v8::HandleScope<'s>,
    target: v8::Local<'s, v8::Object>,
    name: &str,
    value: &Value,
) -> Result<()> {
    let key = v8_str(scope, name)?;
    let value = to_v8(scope, value)?;
    target
        .set(scope, key.into(), value)
        .ok_or_else(|| Error::Conversion(format!("could not store property '{name}'")))?;
    Ok(())
}

/// Define an own data property, bypassing setters such as `__proto__`.
fn define_property<'s>(
    scope: &mut v8::HandleScope<'s>,
    target: v8::Local<'s, v8::Object>,
    name: &str,
    value: &Value,
) -> Result<()> {
    let key = v8_str(scope, name)?;
    let value = to_v8(scope, value)?;
    match target.create_data_property(scope, key.into(), value) {
        Some(true) => Ok(()),
        _ => Err(Error::Conversion(format!("could not define property '{name}'"))),
    }
}

fn construct(
    _scope: &mut v8::HandleScope,
    _args: v8::FunctionCallbackArguments,
    _rv: v8::ReturnValue,
) {
}

/// `toString` of a host object: returns the string cast bound as its data.
fn cast_to_string(
    _scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    mut rv: v8::ReturnValue,
) {
    rv.set(args.data());
}

/// Create an instance whose constructor is named after the object's class.
fn instantiate<'s>(
    scope: &mut v8::HandleScope<'s>,
    object: &Object,
) -> Result<v8::Local<'s, v8::Object>> {
    let template = v8::FunctionTemplate::new(scope, construct);
    let class = v8_str(scope, &object.class)?;
    template.set_class_name(class);
    if let Some(cast) = &object.string_cast {
        let cast = v8_bytes(scope, cast)?;
        let method = v8::FunctionTemplate::builder(cast_to_string)
            .data(cast.into())
            .build(scope);
        let name = v8_str(scope, "toString")?;
        template
            .prototype_template(scope)
            .set(name.into(), method.into());
    }
    let constructor = template
        .get_function(scope)
        .ok_or_else(|| Error::Allocation(format!("constructor for class {}", object.class)))?;
    constructor.set_name(class);
    let instance = constructor
        .new_instance(scope, &[])
        .ok_or_else(|| Error::Allocation(format!("instance of class {}", object.class)))?;
    for (name, value) in &object.properties {
        define_property(scope, instance, name, value)?;
    }
    Ok(instance)
}

/// Deep-copy a V8 value.
pub(crate) fn from_v8<'s>(
    scope: &mut v8::HandleScope<'s>,
    value: v8::Local<'s, v8::Value>,
) -> Result<Value> {
    let object_prototype = v8::Object::new(scope).get_prototype(scope);
    let default_to_string = object_prototype
        .and_then(|prototype| prototype.to_object(scope))
        .and_then(|prototype| named(scope, prototype, "toString"));
    let mut copier = Copier {
        ancestors: Vec::new(),
        tracker: LimitTracker::default(),
        object_prototype,
        default_to_string,
    };
    copier.copy(scope, value)
}

/// State of one deep copy out of V8.
struct Copier<'s> {
    /// Objects on the path from the root to the value being copied.
    ancestors: Vec<v8::Local<'s, v8::Object>>,
    tracker: LimitTracker,
    object_prototype: Option<v8::Local<'s, v8::Value>>,
    default_to_string: Option<v8::Local<'s, v8::Value>>,
}

impl<'s> Copier<'s> {
    fn copy(
        &mut self,
        scope: &mut v8::HandleScope<'s>,
        value: v8::Local<'s, v8::Value>,
    ) -> Result<Value> {
        self.tracker.enter()?;
        let result = self.copy_inner(scope, value);
        self.tracker.exit();
        result
    }

    fn copy_inner(
        &mut self,
        scope: &mut v8::HandleScope<'s>,
        value: v8::Local<'s, v8::Value>,
    ) -> Result<Value> {
        if value.is_null_or_undefined() {
            return Ok(Value::Null);
        }
        if value.is_boolean() {
            return Ok(Value::Bool(value.is_true()));
        }
        if value.is_number() {
            self.tracker.add_bytes(8)?;
            let number = value.number_value(scope).unwrap_or(f64::NAN);
            return Ok(number_to_value(number));
        }
        if value.is_string() {
            let text = value
                .to_string(scope)
                .ok_or_else(|| Error::Conversion("failed to read string".to_string()))?
                .to_rust_string_lossy(scope);
            self.tracker.add_bytes(text.len())?;
            return Ok(Value::String(text.into_bytes()));
        }
        if value.is_big_int() {
            let bigint = v8::Local::<v8::BigInt>::try_from(value)
                .map_err(|_| Error::Conversion("failed to cast to BigInt".to_string()))?;
            return match bigint.i64_value() {
                (long, true) => Ok(Value::Long(long)),
                (_, false) => Err(Error::Conversion(
                    "BigInt does not fit in a 64-bit integer".to_string(),
                )),
            };
        }
        if value.is_symbol() {
            return Err(Error::Conversion("cannot copy a Symbol".to_string()));
        }

        let object = value
            .to_object(scope)
            .ok_or_else(|| Error::Conversion("failed to cast to object".to_string()))?;
        if self
            .ancestors
            .iter()
            .any(|ancestor| ancestor.strict_equals(value))
        {
            return Err(Error::Conversion("circular reference".to_string()));
        }

        self.ancestors.push(object);
        let converted = if let Ok(map) = v8::Local::<v8::Map>::try_from(value) {
            self.copy_map(scope, map)
        } else if value.is_array() || self.is_plain(scope, object) {
            self.copy_container(scope, object)
        } else {
            let class = object.get_constructor_name().to_rust_string_lossy(scope);
            self.copy_instance(scope, object, class)
        };
        self.ancestors.pop();
        converted
    }

    /// Plain objects inherit straight from `Object.prototype`, or from nothing.
    fn is_plain(&self, scope: &mut v8::HandleScope<'s>, object: v8::Local<'s, v8::Object>) -> bool {
        match object.get_prototype(scope) {
            Some(prototype) if prototype.is_null() => true,
            Some(prototype) => self
                .object_prototype
                .is_some_and(|plain| plain.strict_equals(prototype)),
            None => false,
        }
    }

    fn own_properties(
        &mut self,
        scope: &mut v8::HandleScope<'s>,
        object: v8::Local<'s, v8::Object>,
    ) -> Result<Vec<(String, v8::Local<'s, v8::Value>)>> {
        let names = object
            .get_own_property_names(scope, v8::GetPropertyNamesArgs::default())
            .ok_or_else(|| Error::Conversion("failed to list properties".to_string()))?;

        let mut properties = Vec::with_capacity(names.length() as usize);
        for index in 0..names.length() {
            let name = names
                .get_index(scope, index)
                .ok_or_else(|| Error::Conversion("failed to read property name".to_string()))?;
            let name_text = name
                .to_string(scope)
                .ok_or_else(|| Error::Conversion("failed to convert property name".to_string()))?
                .to_rust_string_lossy(scope);
            let value = object
                .get(scope, name)
                .ok_or_else(|| Error::Conversion(format!("failed to read property '{name_text}'")))?;
            self.tracker.add_bytes(name_text.len())?;
            properties.push((name_text, value));
        }
        Ok(properties)
    }

    fn copy_container(
        &mut self,
        scope: &mut v8::HandleScope<'s>,
        object: v8::Local<'s, v8::Object>,
    ) -> Result<Value> {
        let properties = self.own_properties(scope, object)?;
        let keys: Vec<Key> = properties.iter().map(|(name, _)| Key::parse(name)).collect();

        let as_value: v8::Local<v8::Value> = object.into();
        let next_free = match v8::Local::<v8::Array>::try_from(as_value) {
            Ok(array) => i64::from(array.length()),
            Err(_) => next_free_index(&keys),
        };

        let shape = classify(next_free, &keys);
        let mut entries = IndexMap::with_capacity(keys.len());
        for (key, (_, item)) in keys.into_iter().zip(properties) {
            entries.insert(key, self.copy(scope, item)?);
        }

        Ok(match shape {
            Shape::Array => Value::Array(entries.into_values().collect()),
            Shape::Map => Value::Map(entries),
        })
    }

    /// A JS `Map` keeps its insertion order, and its keys become [`Key`]s.
    fn copy_map(
        &mut self,
        scope: &mut v8::HandleScope<'s>,
        map: v8::Local<'s, v8::Map>,
    ) -> Result<Value> {
        let flat = map.as_array(scope);
        let mut entries = IndexMap::with_capacity(flat.length() as usize / 2);
        for index in (0..flat.length()).step_by(2) {
            let key = flat
                .get_index(scope, index)
                .ok_or_else(|| Error::Conversion("failed to read map key".to_string()))?;
            let item = flat
                .get_index(scope, index + 1)
                .ok_or_else(|| Error::Conversion("failed to read map value".to_string()))?;
            let key = self.copy(scope, key)?.to_key();
            let item = self.copy(scope, item)?;
            entries.insert(key, item);
        }
        Ok(Value::from_entries(entries))
    }

    fn copy_instance(
        &mut self,
        scope: &mut v8::HandleScope<'s>,
        object: v8::Local<'s, v8::Object>,
        class: String,
    ) -> Result<Value> {
        let mut properties = IndexMap::new();
        for (name, item) in self.own_properties(scope, object)? {
            let item = self.copy(scope, item)?;
            properties.insert(name, item);
        }
        let string_cast = string_cast(scope, object, self.default_to_string);
        if let Some(cast) = &string_cast {
            self.tracker.add_bytes(cast.len())?;
        }

        Ok(Value::Object(Object {
            class,
            properties,
            string_cast,
        }))
    }
}

/// Integral numbers become `Long`; everything else stays `Double`.
fn number_to_value(number: f64) -> Value {
    const LIMIT: f64 = 9_223_372_036_854_775_808.0; // 2^63
    if number.fract() == 0.0 && (-LIMIT..LIMIT).contains(&number) {
        return Value::Long(number as i64);
    }
    Value::Double(number)
}

/// Result of the instance's own `toString`, when its class overrides the
/// default. Exceptions thrown by the override are swallowed here.
fn string_cast<'s>(
    scope: &mut v8::HandleScope<'s>,
    object: v8::Local<'s, v8::Object>,
    default: Option<v8::Local<'s, v8::Value>>,
) -> Option<Vec<u8>> {
    let scope = &mut v8::TryCatch::new(scope);
    let name = v8::String::new(scope, "toString")?;
    let method = object.get(scope, name.into())?;
    if default.is_some_and(|default| method.strict_equals(default)) {
        return None;
    }
    let method = v8::Local::<v8::Function>::try_from(method).ok()?;
    let text = method.call(scope, object.into(), &[])?;
    let text = text.to_string(scope)?;
    Some(text.to_rust_string_lossy(scope).into_bytes())
}

fn named<'s>(
    scope: &mut v8::HandleScope<'s>,
    object: v8::Local<'s, v8::Object>,
    name: &str,
) -> Option<v8::Local<'s, v8::Value>> {
    let key = v8::String::new(scope, name)?;
    object.get(scope, key.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_order_follows_index_rules() {
        let keys = |keys: &[Key]| keys.to_vec();
        assert!(object_keeps_order(&keys(&[0.into(), 2.into(), "a".into(), "b".into()])));
        assert!(object_keeps_order(&keys(&["b".into(), "a".into(), Key::Int(-1)])));
        assert!(!object_keeps_order(&keys(&[1.into(), 0.into()])));
        assert!(!object_keeps_order(&keys(&["a".into(), 0.into()])));
        // past the array-index range keys keep insertion order
        assert!(object_keeps_order(&keys(&[Key::Int(1 << 40), 0.into()])));
        assert!(!object_keeps_order(&keys(&[Key::Str("7".into()), Key::Str("3".into())])));
    }

    #[test]
    fn integral_numbers_become_longs() {
        assert_eq!(number_to_value(2.0), Value::Long(2));
        assert_eq!(number_to_value(-0.0), Value::Long(0));
        assert_eq!(number_to_value(2.5), Value::Double(2.5));
        assert!(matches!(number_to_value(f64::NAN), Value::Double(n) if n.is_nan()));
        assert_eq!(
            number_to_value(f64::INFINITY),
            Value::Double(f64::INFINITY)
        );
        assert_eq!(number_to_value(1e300), Value::Double(1e300));
        assert_eq!(
            number_to_value(9_223_372_036_854_775_808.0),
            Value::Double(9_223_372_036_854_775_808.0)
        );
    }
}
