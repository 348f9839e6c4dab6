//! Two-way strategic merge patches between serialized Kubernetes objects.
//!
//! Maps are diffed recursively and removed keys become `null`. Lists that carry a merge key in the
//! core/v1 Pod schema are diffed element by element keyed on that field, with a
//! `$setElementOrder/<field>` directive keeping the server side ordering. Any other list is
//! replaced wholesale, as the API server would do for it.

use serde_json::{Map, Value};

/// The merge key of a Pod list field, by field name.
fn merge_key(field: &str) -> Option<&'static str> {
    match field {
        "containers" | "initContainers" | "ephemeralContainers" | "env" | "volumes"
        | "volumeMounts" | "volumeDevices" | "imagePullSecrets" | "resourceClaims"
        | "schedulingGates" => Some("name"),
        "ports" => Some("containerPort"),
        "hostAliases" => Some("ip"),
        "topologySpreadConstraints" => Some("topologyKey"),
        _ => None,
    }
}

/// Compute the patch that turns `original` into `modified`.
///
/// An empty object means both documents are equal.
pub fn create_two_way_merge_patch(original: &Value, modified: &Value) -> Value {
    match (original, modified) {
        (Value::Object(original), Value::Object(modified)) => {
            Value::Object(diff_maps(original, modified))
        }
        _ if original == modified => Value::Object(Map::new()),
        _ => modified.clone(),
    }
}

/// Whether the patch would leave the object untouched.
pub fn is_empty_patch(patch: &Value) -> bool {
    patch.as_object().is_some_and(Map::is_empty)
}

fn diff_maps(original: &Map<String, Value>, modified: &Map<String, Value>) -> Map<String, Value> {
    let mut patch = Map::new();

    for (key, new) in modified {
        match original.get(key) {
            None => {
                patch.insert(key.clone(), new.clone());
            }
            Some(old) if old == new => {}
            Some(Value::Object(old)) if new.is_object() => {
                let nested = diff_maps(old, new.as_object().unwrap_or(&Map::new()));
                if !nested.is_empty() {
                    patch.insert(key.clone(), Value::Object(nested));
                }
            }
            Some(Value::Array(old)) if new.is_array() => {
                let new = new.as_array().map(Vec::as_slice).unwrap_or_default();
                match merge_key(key).filter(|k| keyed_by(old, k) && keyed_by(new, k)) {
                    Some(merge_key) => {
                        if let Some(list) = diff_keyed_lists(old, new, merge_key) {
                            patch.insert(key.clone(), Value::Array(list));
                            patch.insert(
                                format!("$setElementOrder/{key}"),
                                Value::Array(element_order(new, merge_key)),
                            );
                        }
                    }
                    None => {
                        patch.insert(key.clone(), Value::Array(new.to_vec()));
                    }
                }
            }
            Some(_) => {
                patch.insert(key.clone(), new.clone());
            }
        }
    }

    for key in original.keys() {
        if !modified.contains_key(key) {
            patch.insert(key.clone(), Value::Null);
        }
    }

    patch
}

fn keyed_by(list: &[Value], merge_key: &str) -> bool {
    list.iter().all(|item| item.get(merge_key).is_some())
}

fn find_keyed<'a>(list: &'a [Value], merge_key: &str, value: &Value) -> Option<&'a Value> {
    list.iter().find(|item| item.get(merge_key) == Some(value))
}

fn element_order(list: &[Value], merge_key: &str) -> Vec<Value> {
    list.iter()
        .filter_map(|item| item.get(merge_key))
        .map(|value| {
            let mut entry = Map::new();
            entry.insert(merge_key.to_string(), value.clone());
            Value::Object(entry)
        })
        .collect()
}

/// Diff two lists of objects keyed on `merge_key`. Returns `None` when nothing changed.
fn diff_keyed_lists(original: &[Value], modified: &[Value], merge_key: &str) -> Option<Vec<Value>> {
    let mut list = Vec::new();

    for new in modified {
        let key = &new[merge_key];
        match find_keyed(original, merge_key, key) {
            None => list.push(new.clone()),
            Some(old) if old == new => {}
            Some(old) => {
                let (Some(old), Some(new)) = (old.as_object(), new.as_object()) else {
                    list.push(new.clone());
                    continue;
                };
                let mut nested = diff_maps(old, new);
                nested.insert(merge_key.to_string(), key.clone());
                list.push(Value::Object(nested));
            }
        }
    }

    for old in original {
        let key = &old[merge_key];
        if find_keyed(modified, merge_key, key).is_none() {
            let mut entry = Map::new();
            entry.insert(merge_key.to_string(), key.clone());
            entry.insert("$patch".to_string(), Value::String("delete".to_string()));
            list.push(Value::Object(entry));
        }
    }

    let reordered = original.len() == modified.len()
        && original
            .iter()
            .zip(modified)
            .any(|(old, new)| old[merge_key] != new[merge_key]);

    if list.is_empty() && !reordered {
        None
    } else {
        Some(list)
    }
}
