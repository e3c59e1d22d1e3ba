//! Picks the newest record out of a list by comparing timestamp strings.
//!
//! Values are compared lexicographically, so callers must hand in a
//! representation that sorts correctly as text (ISO-8601 does). A record
//! without the field is treated as `"0"` and can never win.

use serde_json::Value;

const FLOOR: &str = "0";

/// Returns the record whose key is greatest. Ties keep the first record seen.
pub fn select_max_by<'a, T, F>(records: &'a [T], key: F) -> Option<&'a T>
where
    F: Fn(&'a T) -> Option<&'a str>,
{
    let mut best: Option<(&'a T, &'a str)> = None;
    for record in records {
        let value = key(record).unwrap_or(FLOOR);
        let current = best.map_or(FLOOR, |(_, v)| v);
        if value > current {
            best = Some((record, value));
        }
    }
    best.map(|(record, _)| record)
}

/// [`select_max_by`] over untyped JSON records with a dotted field path,
/// e.g. `created.date`.
pub fn select_max<'a>(records: &'a [Value], field_path: &str) -> Option<&'a Value> {
    if !is_valid_path(field_path) {
        return None;
    }
    select_max_by(records, |record| lookup(record, field_path))
}

fn is_valid_path(field_path: &str) -> bool {
    !field_path.is_empty() && field_path.split('.').all(|segment| !segment.is_empty())
}

fn lookup<'a>(record: &'a Value, field_path: &str) -> Option<&'a str> {
    let mut current = record;
    for segment in field_path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    current.as_str()
}
