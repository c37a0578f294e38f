//! List-versus-map classification of keyed containers.

use super::value::Key;

/// Outcome of [`classify`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Shape {
    Array,
    Map,
}

/// Decide whether a keyed container is a list or a map.
///
/// `next_free` is the index the container would assign to an appended
/// element. A container is a list only when it holds exactly `next_free`
/// entries whose keys, in iteration order, are `Int(0)`, `Int(1)`, ... The
/// empty container is a list.
pub fn classify<'k, I>(next_free: i64, keys: I) -> Shape
where
    I: IntoIterator<Item = &'k Key>,
    I::IntoIter: ExactSizeIterator,
{
    let keys = keys.into_iter();
    if i64::try_from(keys.len()).ok() != Some(next_free) {
        return Shape::Map;
    }

    for (position, key) in keys.enumerate() {
        match key {
            Key::Int(index) if usize::try_from(*index).ok() == Some(position) => {}
            _ => return Shape::Map,
        }
    }
    Shape::Array
}

/// One past the largest non-negative integer key, or `0` without one.
pub fn next_free_index<'k, I>(keys: I) -> i64
where
    I: IntoIterator<Item = &'k Key>,
{
    keys.into_iter()
        .filter_map(Key::as_int)
        .filter(|index| *index >= 0)
        .max()
        .map_or(0, |index| index.saturating_add(1))
}
