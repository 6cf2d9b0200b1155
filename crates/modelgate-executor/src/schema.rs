//! JSON-schema sanitization for upstreams with restricted schema support.

use serde_json::{Value, json};

/// Keywords the Antigravity backend rejects outright.
const UNSUPPORTED_KEYWORDS: &[&str] = &[
    "$schema",
    "$id",
    "$defs",
    "definitions",
    "additionalProperties",
    "patternProperties",
    "propertyNames",
    "pattern",
    "format",
    "default",
    "examples",
    "minLength",
    "maxLength",
    "minItems",
    "maxItems",
    "uniqueItems",
    "exclusiveMinimum",
    "exclusiveMaximum",
    "multipleOf",
];

/// Recursively rewrites a tool parameter schema: drops unsupported
/// keywords, converts `const` to a single-value `enum`, and flattens type
/// unions and nullable `anyOf` wrappers to their first non-null variant.
pub fn clean_schema(schema: &mut Value) {
    match schema {
        Value::Object(map) => {
            for keyword in UNSUPPORTED_KEYWORDS {
                map.remove(*keyword);
            }
            if let Some(constant) = map.remove("const") {
                map.entry("enum".to_string())
                    .or_insert_with(|| json!([constant]));
            }
            if let Some(Value::Array(types)) = map.get("type") {
                let first = types
                    .iter()
                    .find(|t| t.as_str() != Some("null"))
                    .or_else(|| types.first())
                    .cloned();
                if let Some(first) = first {
                    map.insert("type".to_string(), first);
                }
            }
            for union_key in ["anyOf", "oneOf"] {
                if let Some(Value::Array(variants)) = map.remove(union_key) {
                    let chosen = variants
                        .iter()
                        .find(|v| v.get("type").and_then(Value::as_str) != Some("null"))
                        .or_else(|| variants.first())
                        .cloned();
                    if let Some(Value::Object(fields)) = chosen {
                        for (key, value) in fields {
                            map.entry(key).or_insert(value);
                        }
                    }
                }
            }
            for value in map.values_mut() {
                clean_schema(value);
            }
        }
        Value::Array(items) => {
            for item in items {
                clean_schema(item);
            }
        }
        _ => {}
    }
}

/// Renames `parametersJsonSchema` to `parameters` on every function
/// declaration under `request.tools`, cleaning each schema on the way.
pub fn rewrite_tool_schemas(payload: &mut Value) {
    let Some(tools) = payload
        .pointer_mut("/request/tools")
        .and_then(Value::as_array_mut)
    else {
        return;
    };
    for tool in tools {
        let Some(declarations) = tool
            .get_mut("functionDeclarations")
            .and_then(Value::as_array_mut)
        else {
            continue;
        };
        for declaration in declarations {
            let Some(map) = declaration.as_object_mut() else {
                continue;
            };
            if let Some(mut schema) = map.remove("parametersJsonSchema") {
                clean_schema(&mut schema);
                map.insert("parameters".to_string(), schema);
            } else if let Some(schema) = map.get_mut("parameters") {
                clean_schema(schema);
            }
        }
    }
}
