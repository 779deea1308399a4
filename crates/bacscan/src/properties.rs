//! Single-property reads and writes and whole-device reads

use std::time::Duration;

use serde::Serialize;
use serde_json::{Value, json};
use tracing::info;

use crate::correlator::Correlator;
use crate::error::{Error, Result};
use crate::normalize::{engine_json, normalize_json};
use crate::proxy::{ProxyManager, methods};

/// Property to read or write
#[derive(Debug, Clone, Serialize)]
pub struct PropertyRef {
    pub device_address: String,
    pub object_identifier: String,
    pub property_identifier: String,
    pub array_index: Option<u32>,
}

impl PropertyRef {
    pub fn new(device_address: &str, object_identifier: &str, property_identifier: &str) -> Self {
        Self {
            device_address: device_address.trim().to_string(),
            object_identifier: object_identifier.trim().to_string(),
            property_identifier: property_identifier.trim().to_string(),
            array_index: None,
        }
    }

    pub fn with_index(mut self, array_index: Option<u32>) -> Self {
        self.array_index = array_index;
        self
    }

    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("device_address", &self.device_address),
            ("object_identifier", &self.object_identifier),
            ("property_identifier", &self.property_identifier),
        ] {
            if value.is_empty() {
                return Err(Error::Validation(format!("{} must not be empty", name)));
            }
        }
        Ok(())
    }
}

/// A normalized property value
#[derive(Debug, Clone, Serialize)]
pub struct PropertyValue {
    #[serde(flatten)]
    pub property: PropertyRef,
    pub value: Value,
}

/// Acknowledged write
#[derive(Debug, Clone, Serialize)]
pub struct WriteAck {
    #[serde(flatten)]
    pub property: PropertyRef,
    pub value: Value,
    pub priority: Option<u8>,
}

/// Normalized property map of one device
#[derive(Debug, Clone, Serialize)]
pub struct DeviceProperties {
    pub device_address: String,
    pub device_identifier: String,
    pub properties: Value,
}

/// Lowest and highest BACnet command priority
pub const PRIORITY_RANGE: std::ops::RangeInclusive<u8> = 1..=16;

/// Property-level access through the active proxy
pub struct PropertyAccess {
    correlator: Correlator,
    timeout: Duration,
}

impl PropertyAccess {
    pub fn new(correlator: Correlator, timeout: Duration) -> Self {
        Self {
            correlator,
            timeout,
        }
    }

    pub async fn read_property(&self, proxy: &ProxyManager, property: PropertyRef) -> Result<PropertyValue> {
        property.validate()?;
        let peer = proxy.require_peer()?;
        let raw = self
            .correlator
            .request(&peer, methods::READ_PROPERTY, &property, self.timeout)
            .await?;
        let value = unwrap_value(engine_json(&raw)?);
        Ok(PropertyValue { property, value })
    }

    pub async fn write_property(
        &self,
        proxy: &ProxyManager,
        property: PropertyRef,
        value: Value,
        priority: Option<u8>,
    ) -> Result<WriteAck> {
        property.validate()?;
        if let Some(priority) = priority {
            if !PRIORITY_RANGE.contains(&priority) {
                return Err(Error::Validation(format!(
                    "priority must be between 1 and 16, got {}",
                    priority
                )));
            }
        }
        let peer = proxy.require_peer()?;
        info!(
            address = %property.device_address,
            object = %property.object_identifier,
            property = %property.property_identifier,
            ?priority,
            "Writing property"
        );
        let body = json!({
            "device_address": property.device_address,
            "object_identifier": property.object_identifier,
            "property_identifier": property.property_identifier,
            "array_index": property.array_index,
            "value": value,
            "priority": priority,
        });
        let raw = self
            .correlator
            .request(&peer, methods::WRITE_PROPERTY, &body, self.timeout)
            .await?;
        // Any non-error reply is an acknowledgement
        if !String::from_utf8_lossy(&raw).trim().is_empty() {
            engine_json(&raw)?;
        }
        Ok(WriteAck {
            property,
            value,
            priority,
        })
    }

    pub async fn read_device_all(
        &self,
        proxy: &ProxyManager,
        device_address: &str,
        device_identifier: &str,
    ) -> Result<DeviceProperties> {
        let device_address = device_address.trim();
        let device_identifier = device_identifier.trim();
        if device_address.is_empty() || device_identifier.is_empty() {
            return Err(Error::Validation(
                "device_address and device_identifier must not be empty".into(),
            ));
        }
        let peer = proxy.require_peer()?;
        let body = json!({
            "device_address": device_address,
            "device_identifier": device_identifier,
        });
        let raw = self
            .correlator
            .request(&peer, methods::READ_DEVICE_ALL, &body, self.timeout)
            .await?;
        let value = engine_json(&raw)?;
        let properties = match value {
            Value::Object(mut object) if object.contains_key("properties") => {
                object.remove("properties").unwrap_or(Value::Null)
            }
            other => other,
        };
        Ok(DeviceProperties {
            device_address: device_address.to_string(),
            device_identifier: device_identifier.to_string(),
            properties: normalize_json(properties),
        })
    }
}

/// Take `value` out of a `{"value": ...}` reply and normalize it.
/// `{"name", "value"}` is an enumeration, not a wrapper.
fn unwrap_value(reply: Value) -> Value {
    match reply {
        Value::Object(mut object) if object.contains_key("value") && !object.contains_key("name") => {
            normalize_json(object.remove("value").unwrap_or(Value::Null))
        }
        other => normalize_json(other),
    }
}
