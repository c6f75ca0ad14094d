//! Typed accessors over untyped Kubernetes object trees. Everything in the
//! engine that touches a manifest goes through these instead of ad-hoc
//! `Value` walking.

use anyhow::{anyhow, Result};
use serde_json::{Map, Value};

pub fn nested<'a>(obj: &'a Value, fields: &[&str]) -> Option<&'a Value> {
    let mut cur = obj;
    for f in fields {
        cur = cur.get(f)?;
    }
    Some(cur)
}

pub fn nested_str<'a>(obj: &'a Value, fields: &[&str]) -> Option<&'a str> {
    nested(obj, fields).and_then(Value::as_str)
}

pub fn nested_map<'a>(obj: &'a Value, fields: &[&str]) -> Option<&'a Map<String, Value>> {
    nested(obj, fields).and_then(Value::as_object)
}

pub fn nested_slice<'a>(obj: &'a Value, fields: &[&str]) -> Option<&'a Vec<Value>> {
    nested(obj, fields).and_then(Value::as_array)
}

/// Set a nested field, creating intermediate objects along the way. Fails if
/// an intermediate value exists and is not an object.
pub fn set_nested(obj: &mut Value, fields: &[&str], value: Value) -> Result<()> {
    let (last, parents) = fields
        .split_last()
        .ok_or_else(|| anyhow!("empty field path"))?;
    let mut cur = obj;
    for f in parents {
        let map = cur
            .as_object_mut()
            .ok_or_else(|| anyhow!("field {:?} is not an object", f))?;
        cur = map
            .entry(f.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    let map = cur
        .as_object_mut()
        .ok_or_else(|| anyhow!("field {:?} is not an object", last))?;
    map.insert(last.to_string(), value);
    Ok(())
}

pub fn remove_nested(obj: &mut Value, fields: &[&str]) {
    let Some((last, parents)) = fields.split_last() else {
        return;
    };
    let mut cur = obj;
    for f in parents {
        match cur.get_mut(*f) {
            Some(next) => cur = next,
            None => return,
        }
    }
    if let Some(map) = cur.as_object_mut() {
        map.remove(*last);
    }
}

// -------- metadata shorthands --------

pub fn api_version(obj: &Value) -> &str {
    nested_str(obj, &["apiVersion"]).unwrap_or("")
}

pub fn kind(obj: &Value) -> &str {
    nested_str(obj, &["kind"]).unwrap_or("")
}

pub fn name(obj: &Value) -> &str {
    nested_str(obj, &["metadata", "name"]).unwrap_or("")
}

pub fn namespace(obj: &Value) -> &str {
    nested_str(obj, &["metadata", "namespace"]).unwrap_or("")
}

pub fn resource_version(obj: &Value) -> &str {
    nested_str(obj, &["metadata", "resourceVersion"]).unwrap_or("")
}

pub fn set_resource_version(obj: &mut Value, rv: &str) -> Result<()> {
    set_nested(obj, &["metadata", "resourceVersion"], Value::from(rv))
}

pub fn labels(obj: &Value) -> Option<&Map<String, Value>> {
    nested_map(obj, &["metadata", "labels"])
}

pub fn annotations(obj: &Value) -> Option<&Map<String, Value>> {
    nested_map(obj, &["metadata", "annotations"])
}

/// The `namespace/name` cache key; cluster-scoped objects key by bare name.
pub fn meta_key(obj: &Value) -> String {
    let ns = namespace(obj);
    if ns.is_empty() {
        name(obj).to_string()
    } else {
        format!("{}/{}", ns, name(obj))
    }
}

/// An object is a list when it carries an `items` array, kind suffix aside.
pub fn is_list(obj: &Value) -> bool {
    matches!(obj.get("items"), Some(Value::Array(_)))
}

pub fn list_items(obj: &Value) -> &[Value] {
    nested_slice(obj, &["items"])
        .map(Vec::as_slice)
        .unwrap_or(&[])
}
