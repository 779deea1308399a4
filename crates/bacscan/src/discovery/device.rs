//! Device records from I-Am responses

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{Error, Result};
use crate::normalize::{engine_error, normalize_json, stringify};

/// A device that answered discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Canonical `"type,instance"` identity
    pub device_identifier: String,
    pub device_instance: Option<u32>,
    /// Bare IP address
    pub address: String,
    /// Source address as reported (may carry a port)
    pub source: String,
    pub max_apdu_length: Option<u32>,
    pub segmentation: Option<String>,
    pub vendor_id: Option<u32>,
}

const SOURCE_KEYS: &[&str] = &["pduSource", "source", "address", "ip_address"];
const IDENTIFIER_KEYS: &[&str] = &[
    "deviceIdentifier",
    "iAmDeviceIdentifier",
    "device_identifier",
    "objectIdentifier",
];
const APDU_KEYS: &[&str] = &["maxAPDULengthAccepted", "max_apdu_length", "maxApduLength"];
const SEGMENTATION_KEYS: &[&str] = &["segmentationSupported", "segmentation"];
const VENDOR_KEYS: &[&str] = &["vendorID", "vendor_id", "vendorId"];

fn first<'a>(entry: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| entry.get(*key)).filter(|v| !v.is_null())
}

impl DeviceRecord {
    /// Build a record from one engine device entry. `None` without an identity.
    pub fn from_engine(entry: &Value) -> Option<Self> {
        let entry = entry.as_object()?;
        let (device_identifier, device_instance) =
            first(entry, IDENTIFIER_KEYS).and_then(parse_identifier)?;

        let source = first(entry, SOURCE_KEYS)
            .map(|v| normalize_json(v.clone()))
            .and_then(|v| stringify(&v))
            .unwrap_or_default();

        Some(Self {
            device_identifier,
            device_instance,
            address: host_of(&source),
            source,
            max_apdu_length: first(entry, APDU_KEYS).and_then(as_u32),
            segmentation: first(entry, SEGMENTATION_KEYS)
                .map(|v| normalize_json(v.clone()))
                .and_then(|v| stringify(&v)),
            vendor_id: first(entry, VENDOR_KEYS).and_then(as_u32),
        })
    }
}

fn as_u32(value: &Value) -> Option<u32> {
    match normalize_json(value.clone()) {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Canonicalize an identity to `"type,instance"`.
///
/// Accepts `[type, instance]` pairs (type as name or number) and
/// `"type,instance"` / `"type:instance"` strings.
pub fn parse_identifier(value: &Value) -> Option<(String, Option<u32>)> {
    match normalize_json(value.clone()) {
        Value::Array(parts) if parts.len() == 2 => {
            let object_type = match &parts[0] {
                Value::String(s) => s.trim().to_string(),
                Value::Number(n) => n.to_string(),
                _ => return None,
            };
            let instance = parts[1].as_u64().and_then(|i| u32::try_from(i).ok());
            if object_type.is_empty() {
                return None;
            }
            let rendered = match instance {
                Some(instance) => instance.to_string(),
                None => stringify(&parts[1])?,
            };
            Some((format!("{},{}", object_type, rendered), instance))
        }
        Value::String(s) => {
            let (object_type, instance) = s.split_once(',').or_else(|| s.split_once(':'))?;
            let object_type = object_type.trim();
            let instance = instance.trim();
            if object_type.is_empty() || instance.is_empty() {
                return None;
            }
            Some((
                format!("{},{}", object_type, instance),
                instance.parse().ok(),
            ))
        }
        _ => None,
    }
}

/// Strip a port from a source address: `10.0.0.5:47808` → `10.0.0.5`
pub fn host_of(source: &str) -> String {
    let source = source.trim();
    if let Ok(addr) = source.parse::<SocketAddr>() {
        return addr.ip().to_string();
    }
    if let Ok(ip) = source.parse::<IpAddr>() {
        return ip.to_string();
    }
    match source.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => {
            host.to_string()
        }
        _ => source.to_string(),
    }
}

/// Records from an engine device list, deduplicated by identity (first wins)
pub fn devices_from(entries: &[Value]) -> Vec<DeviceRecord> {
    let mut seen = HashSet::new();
    let mut devices = Vec::with_capacity(entries.len());
    for entry in entries {
        match DeviceRecord::from_engine(entry) {
            Some(device) => {
                if seen.insert(device.device_identifier.clone()) {
                    devices.push(device);
                } else {
                    debug!(device = %device.device_identifier, "Duplicate I-Am dropped");
                }
            }
            None => debug!(?entry, "Device entry without identity skipped"),
        }
    }
    devices
}

/// Parse a `SCAN_SUBNET` / `WHO_IS` reply into devices
pub fn parse_device_list(raw: &[u8]) -> Result<Vec<DeviceRecord>> {
    let text = String::from_utf8_lossy(raw);
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed == "null" || trimmed == "None" {
        return Err(Error::ScanTimeout("proxy returned no data".into()));
    }

    let value: Value = serde_json::from_str(trimmed)
        .map_err(|e| Error::decode(format!("not JSON: {}", e), raw))?;

    match &value {
        Value::Array(entries) => Ok(devices_from(entries)),
        Value::Object(object) => {
            if object.get("status").and_then(Value::as_str) == Some("timeout") {
                let message = object
                    .get("error")
                    .or_else(|| object.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("proxy reported a scan timeout");
                return Err(Error::ScanTimeout(message.to_string()));
            }
            if let Some(message) = engine_error(&value) {
                return Err(Error::Engine(message));
            }
            match object.get("devices") {
                Some(Value::Array(entries)) => Ok(devices_from(entries)),
                None | Some(Value::Null) => Ok(Vec::new()),
                Some(_) => Err(Error::decode("devices is not a list", raw)),
            }
        }
        Value::Null => Err(Error::ScanTimeout("proxy returned no data".into())),
        _ => Err(Error::decode("unexpected response shape", raw)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pair_identifier_is_canonicalized() {
        let device = DeviceRecord::from_engine(&json!({
            "pduSource": "192.168.1.10:47808",
            "deviceIdentifier": ["device", 1001],
            "maxAPDULengthAccepted": 1476,
            "segmentationSupported": {"name": "segmented-both", "value": 0},
            "vendorID": 5,
            "unrelated": "ignored",
        }))
        .unwrap();

        assert_eq!(device.device_identifier, "device,1001");
        assert_eq!(device.device_instance, Some(1001));
        assert_eq!(device.address, "192.168.1.10");
        assert_eq!(device.source, "192.168.1.10:47808");
        assert_eq!(device.max_apdu_length, Some(1476));
        assert_eq!(device.segmentation.as_deref(), Some("segmented-both"));
        assert_eq!(device.vendor_id, Some(5));
    }

    #[test]
    fn test_string_identifiers() {
        assert_eq!(
            parse_identifier(&json!("device:42")),
            Some(("device,42".to_string(), Some(42)))
        );
        assert_eq!(
            parse_identifier(&json!("device, 7")),
            Some(("device,7".to_string(), Some(7)))
        );
        assert_eq!(parse_identifier(&json!("device")), None);
        assert_eq!(
            parse_identifier(&json!([8, 12])),
            Some(("8,12".to_string(), Some(12)))
        );
    }

    #[test]
    fn test_host_of_variants() {
        assert_eq!(host_of("10.0.0.5:47808"), "10.0.0.5");
        assert_eq!(host_of("10.0.0.5"), "10.0.0.5");
        assert_eq!(host_of("[fe80::1]:47808"), "fe80::1");
        assert_eq!(host_of("fe80::1"), "fe80::1");
        assert_eq!(host_of("router.local:47808"), "router.local");
        assert_eq!(host_of("0x0a000005"), "0x0a000005");
    }

    #[test]
    fn test_duplicates_and_anonymous_entries_dropped() {
        let devices = devices_from(&[
            json!({"pduSource": "10.0.0.1", "deviceIdentifier": ["device", 1]}),
            json!({"pduSource": "10.0.0.9", "deviceIdentifier": "device,1"}),
            json!({"pduSource": "10.0.0.2"}),
            json!({"source": "10.0.0.3", "device_identifier": ["device", 3]}),
        ]);
        let ids: Vec<_> = devices.iter().map(|d| d.device_identifier.as_str()).collect();
        assert_eq!(ids, vec!["device,1", "device,3"]);
        assert_eq!(devices[0].address, "10.0.0.1");
    }

    #[test]
    fn test_placeholders_mean_timeout() {
        for raw in [&b""[..], b"   ", b"null", b"None"] {
            assert!(matches!(parse_device_list(raw), Err(Error::ScanTimeout(_))));
        }
    }

    #[test]
    fn test_status_envelopes() {
        let timeout = parse_device_list(br#"{"status": "timeout", "devices": []}"#);
        assert!(matches!(timeout, Err(Error::ScanTimeout(_))));

        let failed = parse_device_list(br#"{"status": "error", "error": "bind failed"}"#);
        assert!(matches!(failed, Err(Error::Engine(ref m)) if m == "bind failed"));

        let done = parse_device_list(
            br#"{"status": "done", "devices": [{"pduSource": "10.0.0.4", "deviceIdentifier": ["device", 4]}]}"#,
        )
        .unwrap();
        assert_eq!(done.len(), 1);
    }

    #[test]
    fn test_non_json_is_decode_error_with_excerpt() {
        let raw = format!("Traceback: {}", "x".repeat(500));
        match parse_device_list(raw.as_bytes()) {
            Err(Error::Decode { excerpt, .. }) => {
                assert!(excerpt.starts_with("Traceback"));
                assert!(excerpt.chars().count() <= crate::error::EXCERPT_LEN + 3);
            }
            other => panic!("expected decode error, got {:?}", other),
        }
    }
}
