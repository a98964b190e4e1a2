//! JSON patch application and generation.
//!
//! Applies RFC 6902 operation arrays to `serde_json::Value` documents, with
//! three extensions used by the commit pipeline: `safeReplace` (replace only
//! when the current value equals `oldValue`), `removeIfExists` (idempotent
//! remove) and `testAbsence` (assert a location does not exist). Patch
//! violations surface as `ChangeConflict` so a stale client sees the same
//! error for a JSON conflict as for a text conflict.
//!
//! Generation runs in safe-replace mode: primitives and arrays are replaced
//! wholesale, objects are recursed into. Applying a generated patch to the
//! document it was generated from always reproduces the target document.

use serde_json::{Map, Value, json};

use crate::errors::{Result, StoreError};

fn conflict(detail: impl Into<String>) -> StoreError {
    StoreError::ChangeConflict(detail.into())
}

/// Split an RFC 6901 pointer into unescaped reference tokens.
fn parse_pointer(pointer: &str) -> Result<Vec<String>> {
    if pointer.is_empty() {
        return Ok(Vec::new());
    }
    if !pointer.starts_with('/') {
        return Err(conflict(format!("invalid JSON pointer `{pointer}`")));
    }
    Ok(pointer[1..]
        .split('/')
        .map(|token| token.replace("~1", "/").replace("~0", "~"))
        .collect())
}

fn lookup<'a>(doc: &'a Value, tokens: &[String]) -> Option<&'a Value> {
    let mut current = doc;
    for token in tokens {
        match current {
            Value::Object(map) => current = map.get(token)?,
            Value::Array(items) => {
                let index: usize = token.parse().ok()?;
                current = items.get(index)?;
            }
            _ => return None,
        }
    }
    Some(current)
}

/// Resolve the container holding the last token of `tokens`.
fn lookup_parent<'a>(
    doc: &'a mut Value,
    tokens: &[String],
    pointer: &str,
) -> Result<(&'a mut Value, String)> {
    let (last, parents) = tokens
        .split_last()
        .ok_or_else(|| conflict(format!("`{pointer}` does not address a member")))?;
    let mut current = doc;
    for token in parents {
        current = match current {
            Value::Object(map) => map
                .get_mut(token)
                .ok_or_else(|| conflict(format!("no such member `{token}` in `{pointer}`")))?,
            Value::Array(items) => {
                let index: usize = token
                    .parse()
                    .map_err(|_| conflict(format!("bad array index `{token}` in `{pointer}`")))?;
                items
                    .get_mut(index)
                    .ok_or_else(|| conflict(format!("index {index} out of bounds in `{pointer}`")))?
            }
            _ => return Err(conflict(format!("`{pointer}` traverses a non-container"))),
        };
    }
    Ok((current, last.clone()))
}

fn add_at(doc: &mut Value, pointer: &str, value: Value) -> Result<()> {
    let tokens = parse_pointer(pointer)?;
    if tokens.is_empty() {
        *doc = value;
        return Ok(());
    }
    let (parent, last) = lookup_parent(doc, &tokens, pointer)?;
    match parent {
        Value::Object(map) => {
            map.insert(last, value);
            Ok(())
        }
        Value::Array(items) => {
            if last == "-" {
                items.push(value);
                return Ok(());
            }
            let index: usize = last
                .parse()
                .map_err(|_| conflict(format!("bad array index `{last}` in `{pointer}`")))?;
            if index > items.len() {
                return Err(conflict(format!("index {index} out of bounds in `{pointer}`")));
            }
            items.insert(index, value);
            Ok(())
        }
        _ => Err(conflict(format!("`{pointer}` addresses into a non-container"))),
    }
}

fn remove_at(doc: &mut Value, pointer: &str) -> Result<Value> {
    let tokens = parse_pointer(pointer)?;
    if tokens.is_empty() {
        return Err(conflict("cannot remove the document root"));
    }
    let (parent, last) = lookup_parent(doc, &tokens, pointer)?;
    match parent {
        Value::Object(map) => map
            .remove(&last)
            .ok_or_else(|| conflict(format!("no such member to remove: `{pointer}`"))),
        Value::Array(items) => {
            let index: usize = last
                .parse()
                .map_err(|_| conflict(format!("bad array index `{last}` in `{pointer}`")))?;
            if index >= items.len() {
                return Err(conflict(format!("index {index} out of bounds in `{pointer}`")));
            }
            Ok(items.remove(index))
        }
        _ => Err(conflict(format!("`{pointer}` addresses into a non-container"))),
    }
}

fn replace_at(doc: &mut Value, pointer: &str, value: Value) -> Result<Value> {
    let tokens = parse_pointer(pointer)?;
    if tokens.is_empty() {
        return Ok(std::mem::replace(doc, value));
    }
    let (parent, last) = lookup_parent(doc, &tokens, pointer)?;
    match parent {
        Value::Object(map) => match map.get_mut(&last) {
            Some(slot) => Ok(std::mem::replace(slot, value)),
            None => Err(conflict(format!("no such member to replace: `{pointer}`"))),
        },
        Value::Array(items) => {
            let index: usize = last
                .parse()
                .map_err(|_| conflict(format!("bad array index `{last}` in `{pointer}`")))?;
            match items.get_mut(index) {
                Some(slot) => Ok(std::mem::replace(slot, value)),
                None => Err(conflict(format!("index {index} out of bounds in `{pointer}`"))),
            }
        }
        _ => Err(conflict(format!("`{pointer}` addresses into a non-container"))),
    }
}

fn op_field<'a>(op: &'a Map<String, Value>, name: &str, kind: &str) -> Result<&'a Value> {
    op.get(name)
        .ok_or_else(|| conflict(format!("`{kind}` operation is missing `{name}`")))
}

fn op_pointer(op: &Map<String, Value>, name: &str, kind: &str) -> Result<String> {
    match op_field(op, name, kind)? {
        Value::String(s) => Ok(s.clone()),
        _ => Err(conflict(format!("`{name}` of `{kind}` must be a string"))),
    }
}

/// Apply a patch (an array of operation objects) to `base`, returning the
/// patched document. `base` is left untouched on failure.
pub fn apply(base: &Value, patch: &Value) -> Result<Value> {
    let operations = patch
        .as_array()
        .ok_or_else(|| conflict("JSON patch must be an array of operations"))?;
    let mut doc = base.clone();
    for operation in operations {
        let op = operation
            .as_object()
            .ok_or_else(|| conflict("JSON patch operation must be an object"))?;
        let kind = match op.get("op").and_then(Value::as_str) {
            Some(kind) => kind,
            None => return Err(conflict("JSON patch operation is missing `op`")),
        };
        match kind {
            "add" => {
                let path = op_pointer(op, "path", kind)?;
                let value = op_field(op, "value", kind)?.clone();
                add_at(&mut doc, &path, value)?;
            }
            "remove" => {
                let path = op_pointer(op, "path", kind)?;
                remove_at(&mut doc, &path)?;
            }
            "replace" => {
                let path = op_pointer(op, "path", kind)?;
                let value = op_field(op, "value", kind)?.clone();
                replace_at(&mut doc, &path, value)?;
            }
            "move" => {
                let from = op_pointer(op, "from", kind)?;
                let path = op_pointer(op, "path", kind)?;
                let taken = remove_at(&mut doc, &from)?;
                add_at(&mut doc, &path, taken)?;
            }
            "copy" => {
                let from = op_pointer(op, "from", kind)?;
                let path = op_pointer(op, "path", kind)?;
                let tokens = parse_pointer(&from)?;
                let value = lookup(&doc, &tokens)
                    .ok_or_else(|| conflict(format!("no value at `{from}` to copy")))?
                    .clone();
                add_at(&mut doc, &path, value)?;
            }
            "test" => {
                let path = op_pointer(op, "path", kind)?;
                let expected = op_field(op, "value", kind)?;
                let tokens = parse_pointer(&path)?;
                match lookup(&doc, &tokens) {
                    Some(actual) if actual == expected => {}
                    Some(actual) => {
                        return Err(conflict(format!(
                            "test failed at `{path}`: expected {expected}, found {actual}"
                        )));
                    }
                    None => {
                        return Err(conflict(format!("test failed: no value at `{path}`")));
                    }
                }
            }
            "safeReplace" => {
                let path = op_pointer(op, "path", kind)?;
                let old_value = op_field(op, "oldValue", kind)?;
                let value = op_field(op, "value", kind)?.clone();
                let tokens = parse_pointer(&path)?;
                match lookup(&doc, &tokens) {
                    Some(actual) if actual == old_value => {}
                    Some(actual) => {
                        return Err(conflict(format!(
                            "safeReplace failed at `{path}`: expected {old_value}, found {actual}"
                        )));
                    }
                    None => {
                        return Err(conflict(format!(
                            "safeReplace failed: no value at `{path}`"
                        )));
                    }
                }
                replace_at(&mut doc, &path, value)?;
            }
            "removeIfExists" => {
                let path = op_pointer(op, "path", kind)?;
                let tokens = parse_pointer(&path)?;
                if lookup(&doc, &tokens).is_some() {
                    remove_at(&mut doc, &path)?;
                }
            }
            "testAbsence" => {
                let path = op_pointer(op, "path", kind)?;
                let tokens = parse_pointer(&path)?;
                if lookup(&doc, &tokens).is_some() {
                    return Err(conflict(format!(
                        "testAbsence failed: value exists at `{path}`"
                    )));
                }
            }
            other => {
                return Err(conflict(format!("unsupported JSON patch op `{other}`")));
            }
        }
    }
    Ok(doc)
}

fn escape(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

fn generate_into(path: &str, old: &Value, new: &Value, ops: &mut Vec<Value>) {
    if old == new {
        return;
    }
    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            for (key, old_value) in old_map {
                let child = format!("{path}/{}", escape(key));
                match new_map.get(key) {
                    Some(new_value) => generate_into(&child, old_value, new_value, ops),
                    None => ops.push(json!({"op": "remove", "path": child})),
                }
            }
            for (key, new_value) in new_map {
                if !old_map.contains_key(key) {
                    let child = format!("{path}/{}", escape(key));
                    ops.push(json!({"op": "add", "path": child, "value": new_value}));
                }
            }
        }
        // Primitives and whole arrays are replaced guarded by the old value.
        _ => ops.push(json!({
            "op": "safeReplace",
            "path": path,
            "oldValue": old,
            "value": new,
        })),
    }
}

/// Generate a safe-replace patch turning `old` into `new`.
pub fn generate(old: &Value, new: &Value) -> Value {
    let mut ops = Vec::new();
    generate_into("", old, new, &mut ops);
    Value::Array(ops)
}
