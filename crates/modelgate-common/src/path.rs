//! Dotted-path edits over `serde_json::Value`.
//!
//! Paths look like `request.generationConfig.thinkingConfig.thinkingBudget`
//! or `choices.0.delta`. A numeric segment indexes into an array; the
//! special segment `-1` appends. Unknown sibling fields are untouched, so
//! payloads round-trip everything the edit did not name.

use serde_json::Value;

/// Reads the value at `path`, or `None` when any segment is missing.
pub fn json_get<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = root;
    for seg in segments(path) {
        match cur {
            Value::Object(map) => {
                cur = map.get(seg)?;
            }
            Value::Array(items) => {
                let idx: usize = seg.parse().ok()?;
                cur = items.get(idx)?;
            }
            _ => return None,
        }
    }
    Some(cur)
}

/// Writes `value` at `path`, creating intermediate objects as needed.
///
/// Creating intermediate arrays is supported only through existing arrays;
/// a missing segment always materializes as an object.
pub fn json_set(root: &mut Value, path: &str, value: Value) {
    let segs: Vec<&str> = segments(path).collect();
    if segs.is_empty() {
        *root = value;
        return;
    }
    set_inner(root, &segs, value);
}

fn set_inner(cur: &mut Value, segs: &[&str], value: Value) {
    let seg = segs[0];
    let last = segs.len() == 1;

    if let Value::Array(items) = cur {
        if seg == "-1" {
            if last {
                items.push(value);
            } else {
                items.push(Value::Object(serde_json::Map::new()));
                let slot = items.last_mut().expect("just pushed");
                set_inner(slot, &segs[1..], value);
            }
            return;
        }
        if let Ok(idx) = seg.parse::<usize>() {
            while items.len() <= idx {
                items.push(Value::Null);
            }
            if last {
                items[idx] = value;
            } else {
                if !items[idx].is_object() && !items[idx].is_array() {
                    items[idx] = Value::Object(serde_json::Map::new());
                }
                set_inner(&mut items[idx], &segs[1..], value);
            }
            return;
        }
    }

    if !cur.is_object() {
        *cur = Value::Object(serde_json::Map::new());
    }
    let map = cur.as_object_mut().expect("coerced to object");
    if last {
        map.insert(seg.to_string(), value);
        return;
    }
    let slot = map
        .entry(seg.to_string())
        .or_insert_with(|| Value::Object(serde_json::Map::new()));
    set_inner(slot, &segs[1..], value);
}

/// Deletes the value at `path`. Missing segments are a no-op.
pub fn json_delete(root: &mut Value, path: &str) {
    let segs: Vec<&str> = segments(path).collect();
    if segs.is_empty() {
        return;
    }
    delete_inner(root, &segs);
}

fn delete_inner(cur: &mut Value, segs: &[&str]) {
    let seg = segs[0];
    if segs.len() == 1 {
        match cur {
            Value::Object(map) => {
                map.remove(seg);
            }
            Value::Array(items) => {
                if let Ok(idx) = seg.parse::<usize>()
                    && idx < items.len()
                {
                    items.remove(idx);
                }
            }
            _ => {}
        }
        return;
    }
    let next = match cur {
        Value::Object(map) => map.get_mut(seg),
        Value::Array(items) => seg.parse::<usize>().ok().and_then(|idx| items.get_mut(idx)),
        _ => None,
    };
    if let Some(next) = next {
        delete_inner(next, &segs[1..]);
    }
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('.').filter(|s| !s.is_empty())
}
