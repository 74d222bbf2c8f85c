//! Field-level merge rules shared by snapshots, capture, and coalescing.
//!
//! - scalar fields: last writer wins, in change order
//! - array fields: sets; an update contributes `to - from` and retracts
//!   `from - to`, so concurrent additions from different replicas commute.
//!   Merged arrays are kept in canonical (sorted) order, so replicas that
//!   merged in different orders hold identical bytes
//! - nested objects: the same rules, one level down
//! - a key present in `from` but missing from `to` is removed

use serde_json::Value;

use crate::models::Document;

/// Merge an update's `from`/`to` pair into `doc`.
pub fn apply_update(doc: &mut Document, from: &Document, to: &Document) {
    for (key, new_value) in to {
        match new_value {
            Value::Array(new_items) => {
                let old_items = from.get(key).and_then(Value::as_array);
                let current = doc.get(key).and_then(Value::as_array);
                let merged = merge_array(current, old_items, new_items);
                doc.insert(key.clone(), Value::Array(merged));
            }
            Value::Object(sub_to) => {
                let empty = Document::new();
                let sub_from = from.get(key).and_then(Value::as_object).unwrap_or(&empty);
                let mut sub_doc = match doc.remove(key) {
                    Some(Value::Object(existing)) => existing,
                    _ => Document::new(),
                };
                apply_update(&mut sub_doc, sub_from, sub_to);
                doc.insert(key.clone(), Value::Object(sub_doc));
            }
            scalar => {
                doc.insert(key.clone(), scalar.clone());
            }
        }
    }

    for key in from.keys() {
        if !to.contains_key(key) {
            doc.remove(key);
        }
    }
}

fn merge_array(current: Option<&Vec<Value>>, from: Option<&Vec<Value>>, to: &[Value]) -> Vec<Value> {
    let from = from.map_or(&[][..], Vec::as_slice);
    let removed: Vec<&Value> = from.iter().filter(|item| !to.contains(item)).collect();
    let added = to.iter().filter(|item| !from.contains(item));

    let mut merged: Vec<Value> = Vec::new();
    for item in current.into_iter().flatten().chain(added) {
        if !removed.contains(&item) && !merged.contains(item) {
            merged.push(item.clone());
        }
    }
    merged.sort_by_cached_key(Value::to_string);
    merged
}

/// Remove duplicate array elements, keeping first occurrences.
pub fn dedupe_arrays(doc: &mut Document) {
    for value in doc.values_mut() {
        match value {
            Value::Array(items) => {
                let mut unique: Vec<Value> = Vec::with_capacity(items.len());
                for item in items.drain(..) {
                    if !unique.contains(&item) {
                        unique.push(item);
                    }
                }
                *items = unique;
            }
            Value::Object(sub) => dedupe_arrays(sub),
            _ => {}
        }
    }
}

/// Compute the `(from, to)` pair describing the edit from `before` to `after`.
///
/// Only changed keys appear. Nested objects are diffed recursively; arrays
/// and scalars are carried whole.
pub fn diff_documents(before: &Document, after: &Document) -> (Document, Document) {
    let mut from = Document::new();
    let mut to = Document::new();

    for (key, new_value) in after {
        match (before.get(key), new_value) {
            (Some(old_value), _) if old_value == new_value => {}
            (Some(Value::Object(old_sub)), Value::Object(new_sub)) => {
                let (sub_from, sub_to) = diff_documents(old_sub, new_sub);
                from.insert(key.clone(), Value::Object(sub_from));
                to.insert(key.clone(), Value::Object(sub_to));
            }
            (Some(old_value), _) => {
                from.insert(key.clone(), old_value.clone());
                to.insert(key.clone(), new_value.clone());
            }
            (None, _) => {
                to.insert(key.clone(), new_value.clone());
            }
        }
    }

    for (key, old_value) in before {
        if !after.contains_key(key) {
            from.insert(key.clone(), old_value.clone());
        }
    }

    (from, to)
}

/// Collapse two consecutive updates of one entity into one.
///
/// Keeps the earliest `from` and the latest `to` per key, and drops keys whose
/// value nets out unchanged.
pub fn compose_updates(
    first_from: &Document,
    first_to: &Document,
    second_from: &Document,
    second_to: &Document,
) -> (Document, Document) {
    let mut from = Document::new();
    let mut to = Document::new();

    let keys = first_from
        .keys()
        .chain(first_to.keys())
        .chain(second_from.keys())
        .chain(second_to.keys());
    let mut seen: Vec<&String> = Vec::new();

    for key in keys {
        if seen.contains(&key) {
            continue;
        }
        seen.push(key);

        let in_first = first_from.contains_key(key) || first_to.contains_key(key);
        let in_second = second_from.contains_key(key) || second_to.contains_key(key);

        let (merged_from, merged_to) = match (in_first, in_second) {
            (true, false) => (first_from.get(key).cloned(), first_to.get(key).cloned()),
            (false, _) => (second_from.get(key).cloned(), second_to.get(key).cloned()),
            (true, true) => compose_key(
                first_from.get(key),
                first_to.get(key),
                second_from.get(key),
                second_to.get(key),
            ),
        };

        if merged_from == merged_to {
            continue;
        }
        if let Some(value) = merged_from {
            from.insert(key.clone(), value);
        }
        if let Some(value) = merged_to {
            to.insert(key.clone(), value);
        }
    }

    (from, to)
}

fn compose_key(
    first_from: Option<&Value>,
    first_to: Option<&Value>,
    second_from: Option<&Value>,
    second_to: Option<&Value>,
) -> (Option<Value>, Option<Value>) {
    let object_or_empty = |value: Option<&Value>| match value {
        None => Some(Document::new()),
        Some(Value::Object(map)) => Some(map.clone()),
        Some(_) => None,
    };

    if let (Some(Value::Object(_)), Some(Value::Object(_))) = (first_to, second_to) {
        if let (Some(ff), Some(ft), Some(sf), Some(st)) = (
            object_or_empty(first_from),
            object_or_empty(first_to),
            object_or_empty(second_from),
            object_or_empty(second_to),
        ) {
            let (from, to) = compose_updates(&ff, &ft, &sf, &st);
            let from = if first_from.is_none() && second_from.is_none() {
                None
            } else {
                Some(Value::Object(from))
            };
            return (from, Some(Value::Object(to)));
        }
    }

    (first_from.cloned(), second_to.cloned())
}
