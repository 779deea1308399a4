//! Response normalization
//!
//! The proxy reports property values in several encodings: plain JSON
//! scalars, tuples, and a few tagged objects:
//!
//! - `{"_value": x}` wraps a value
//! - `{"name": "segmented-both", "value": 0}` is an enumeration
//! - `{"_bytes": [65, 72, 85]}` is a raw octet string
//! - `{"_type": "ObjectType", "_display": "analog-input"}` is a typed value
//!   the engine could only render as text
//!
//! [`ProtocolValue`] captures all of them; [`normalize`] folds any of them into
//! a stable JSON shape and never fails. Normalized output never contains one of
//! the tagged shapes, so normalizing it again changes nothing.

use serde_json::{Map, Number, Value};

use crate::error::{Error, Result};

/// A loosely-typed value as produced by the protocol engine
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolValue {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<ProtocolValue>),
    Map(Vec<(String, ProtocolValue)>),
    /// Protocol enumeration (e.g. `segmented-both = 0`)
    Enumerated { name: String, value: u32 },
    /// A value the engine could only describe by type tag and display form
    Typed { type_tag: String, display: String },
}

/// Family of a [`ProtocolValue::Typed`] tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeFamily {
    ObjectType,
    Address,
    Other,
}

impl TypeFamily {
    pub fn of(type_tag: &str) -> Self {
        if type_tag.starts_with("ObjectType") {
            TypeFamily::ObjectType
        } else if type_tag.ends_with("Address") || type_tag.starts_with("Address") {
            TypeFamily::Address
        } else {
            TypeFamily::Other
        }
    }
}

/// Fold a protocol value into JSON
pub fn normalize(value: &ProtocolValue) -> Value {
    match value {
        ProtocolValue::Null => Value::Null,
        ProtocolValue::Bool(b) => Value::Bool(*b),
        ProtocolValue::Number(n) => Value::Number(n.clone()),
        ProtocolValue::String(s) => Value::String(s.clone()),
        ProtocolValue::Bytes(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ProtocolValue::Array(items) => Value::Array(items.iter().map(normalize).collect()),
        ProtocolValue::Map(entries) => {
            let map: Map<String, Value> = entries
                .iter()
                .map(|(key, value)| (key.clone(), normalize(value)))
                .collect();
            // A hand-built map can still spell a tagged shape
            match tagged(&map) {
                Some(value) => normalize(&value),
                None => Value::Object(map),
            }
        }
        ProtocolValue::Enumerated { name, .. } => Value::String(name.clone()),
        ProtocolValue::Typed { type_tag, display } => {
            if TypeFamily::of(type_tag) == TypeFamily::Other {
                tracing::trace!(type_tag = %type_tag, "Unrecognized value type, using display form");
            }
            Value::String(display.clone())
        }
    }
}

/// Decode engine JSON and normalize it in one step
pub fn normalize_json(value: Value) -> Value {
    normalize(&ProtocolValue::from(value))
}

/// Render a normalized value as text. `Null` is an absence, not `""`.
pub fn stringify(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Decode a raw engine reply as JSON.
///
/// An object carrying `"status": "error"` becomes [`Error::Engine`] with the
/// engine's message.
pub fn engine_json(raw: &[u8]) -> Result<Value> {
    let text = String::from_utf8_lossy(raw);
    if text.trim().is_empty() {
        return Err(Error::decode("empty response", raw));
    }
    let value: Value =
        serde_json::from_str(text.trim()).map_err(|e| Error::decode(format!("not JSON: {}", e), raw))?;
    if let Some(message) = engine_error(&value) {
        return Err(Error::Engine(message));
    }
    Ok(value)
}

/// The engine's error message when `value` is an error envelope
pub fn engine_error(value: &Value) -> Option<String> {
    let object = value.as_object()?;
    if object.get("status").and_then(Value::as_str) != Some("error") {
        return None;
    }
    let message = object
        .get("error")
        .or_else(|| object.get("message"))
        .and_then(Value::as_str)
        .unwrap_or("unspecified engine error");
    Some(message.to_string())
}

impl From<Value> for ProtocolValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => ProtocolValue::Null,
            Value::Bool(b) => ProtocolValue::Bool(b),
            Value::Number(n) => ProtocolValue::Number(n),
            Value::String(s) => ProtocolValue::String(s),
            Value::Array(items) => {
                ProtocolValue::Array(items.into_iter().map(ProtocolValue::from).collect())
            }
            Value::Object(map) => match tagged(&map) {
                Some(value) => value,
                None => ProtocolValue::Map(
                    map.into_iter()
                        .map(|(key, value)| (key, ProtocolValue::from(value)))
                        .collect(),
                ),
            },
        }
    }
}

/// Recognize the tagged object encodings
fn tagged(map: &Map<String, Value>) -> Option<ProtocolValue> {
    match map.len() {
        1 => {
            if let Some(inner) = map.get("_value") {
                return Some(ProtocolValue::from(inner.clone()));
            }
            let bytes = map.get("_bytes")?.as_array()?;
            bytes
                .iter()
                .map(|b| b.as_u64().and_then(|b| u8::try_from(b).ok()))
                .collect::<Option<Vec<u8>>>()
                .map(ProtocolValue::Bytes)
        }
        2 => {
            if let (Some(name), Some(value)) = (map.get("name"), map.get("value")) {
                return Some(ProtocolValue::Enumerated {
                    name: name.as_str()?.to_string(),
                    value: u32::try_from(value.as_u64()?).ok()?,
                });
            }
            Some(ProtocolValue::Typed {
                type_tag: map.get("_type")?.as_str()?.to_string(),
                display: map.get("_display")?.as_str()?.to_string(),
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn twice(value: &ProtocolValue) -> (Value, Value) {
        let once = normalize(value);
        let again = normalize_json(once.clone());
        (once, again)
    }

    #[test]
    fn test_scalars_pass_through() {
        assert_eq!(normalize(&ProtocolValue::Bool(true)), json!(true));
        assert_eq!(normalize(&ProtocolValue::Number(72.into())), json!(72));
        assert_eq!(normalize(&ProtocolValue::Null), Value::Null);
    }

    #[test]
    fn test_bytes_decode_lossy() {
        let value = ProtocolValue::Bytes(vec![b'A', b'H', b'U', 0xff]);
        assert_eq!(normalize(&value), json!("AHU\u{fffd}"));
    }

    #[test]
    fn test_engine_octet_strings() {
        let value = ProtocolValue::from(json!({"_bytes": [65, 72, 85, 255]}));
        assert_eq!(value, ProtocolValue::Bytes(vec![b'A', b'H', b'U', 0xff]));
        assert_eq!(normalize(&value), json!("AHU\u{fffd}"));

        // Not octets: left as an ordinary map
        let not_bytes = ProtocolValue::from(json!({"_bytes": [65, 300]}));
        assert_eq!(normalize(&not_bytes), json!({"_bytes": [65, 300]}));
    }

    #[test]
    fn test_engine_typed_values() {
        let reply = json!({
            "object-type": {"_type": "ObjectType", "_display": "analog-input"},
            "address": {"_type": "IPv4Address", "_display": "10.0.0.5:47808"},
            "local-date": {"_type": "Date", "_display": "2024-01-01"}
        });
        assert_eq!(
            normalize_json(reply),
            json!({"object-type": "analog-input", "address": "10.0.0.5:47808", "local-date": "2024-01-01"})
        );
        assert!(matches!(
            ProtocolValue::from(json!({"_type": "ObjectType", "_display": "device"})),
            ProtocolValue::Typed { ref type_tag, .. } if type_tag == "ObjectType"
        ));
    }

    #[test]
    fn test_enumerations_reduce_to_name() {
        let value = ProtocolValue::from(json!({"name": "segmented-both", "value": 0}));
        assert_eq!(normalize(&value), json!("segmented-both"));
    }

    #[test]
    fn test_value_wrappers_unwrap_recursively() {
        let value = ProtocolValue::from(json!({"_value": {"_value": 21.5}}));
        assert_eq!(normalize(&value), json!(21.5));
    }

    #[test]
    fn test_typed_values_use_display() {
        let object_type = ProtocolValue::Typed {
            type_tag: "ObjectTypeEnum".into(),
            display: "analog-input".into(),
        };
        let address = ProtocolValue::Typed {
            type_tag: "IPv4Address".into(),
            display: "10.0.0.5:47808".into(),
        };
        let unknown = ProtocolValue::Typed {
            type_tag: "DateTime".into(),
            display: "2024-01-01 00:00".into(),
        };
        assert_eq!(normalize(&object_type), json!("analog-input"));
        assert_eq!(normalize(&address), json!("10.0.0.5:47808"));
        assert_eq!(normalize(&unknown), json!("2024-01-01 00:00"));
        assert_eq!(TypeFamily::of("IPv4Address"), TypeFamily::Address);
        assert_eq!(TypeFamily::of("ObjectType"), TypeFamily::ObjectType);
    }

    #[test]
    fn test_nested_structures_recurse() {
        let value = ProtocolValue::Map(vec![
            (
                "object-identifier".into(),
                ProtocolValue::Array(vec![
                    ProtocolValue::Enumerated {
                        name: "device".into(),
                        value: 8,
                    },
                    ProtocolValue::Number(1001.into()),
                ]),
            ),
            ("object-name".into(), ProtocolValue::Bytes(b"RTU-1".to_vec())),
        ]);
        assert_eq!(
            normalize(&value),
            json!({"object-identifier": ["device", 1001], "object-name": "RTU-1"})
        );
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let samples = vec![
            ProtocolValue::String("plain".into()),
            ProtocolValue::Number(Number::from_f64(3.5).unwrap()),
            ProtocolValue::Bytes(b"bytes".to_vec()),
            ProtocolValue::Array(vec![
                ProtocolValue::String("analog-value".into()),
                ProtocolValue::Number(3.into()),
            ]),
            ProtocolValue::from(json!({
                "units": {"name": "degrees-fahrenheit", "value": 64},
                "present-value": {"_value": 70.2},
                "flags": [false, false, {"_value": true}, false],
            })),
            // Hand-built maps spelling the tagged shapes
            ProtocolValue::Map(vec![
                ("name".into(), ProtocolValue::String("AHU-1".into())),
                ("value".into(), ProtocolValue::Number(3.into())),
            ]),
            ProtocolValue::Map(vec![("_value".into(), ProtocolValue::String("on".into()))]),
            ProtocolValue::Map(vec![(
                "_bytes".into(),
                ProtocolValue::Array(vec![ProtocolValue::Number(79.into()), ProtocolValue::Number(75.into())]),
            )]),
            ProtocolValue::Map(vec![
                ("_type".into(), ProtocolValue::String("ObjectType".into())),
                ("_display".into(), ProtocolValue::String("binary-output".into())),
            ]),
            ProtocolValue::Array(vec![ProtocolValue::Map(vec![
                ("name".into(), ProtocolValue::Enumerated { name: "active".into(), value: 1 }),
                ("value".into(), ProtocolValue::Number(1.into())),
            ])]),
        ];

        for sample in &samples {
            let (once, again) = twice(sample);
            assert_eq!(once, again, "not idempotent for {:?}", sample);
        }
        assert_eq!(normalize(&samples[5]), json!("AHU-1"));
        assert_eq!(normalize(&samples[7]), json!("OK"));
    }

    #[test]
    fn test_engine_json_surfaces_error_envelope() {
        let err = engine_json(br#"{"status": "error", "error": "device unreachable"}"#).unwrap_err();
        assert!(matches!(err, Error::Engine(ref m) if m == "device unreachable"));

        let err = engine_json(b"<html>502</html>").unwrap_err();
        assert!(matches!(err, Error::Decode { ref excerpt, .. } if excerpt == "<html>502</html>"));

        assert_eq!(engine_json(b" {\"value\": 1} ").unwrap(), json!({"value": 1}));
    }

    #[test]
    fn test_stringify_treats_null_as_absent() {
        assert_eq!(stringify(&Value::Null), None);
        assert_eq!(stringify(&json!("degC")), Some("degC".to_string()));
        assert_eq!(stringify(&json!(72.5)), Some("72.5".to_string()));
        assert_eq!(stringify(&json!(true)), Some("true".to_string()));
    }
}
