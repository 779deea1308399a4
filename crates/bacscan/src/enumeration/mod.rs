//! Paginated object-list enumeration backed by the cache

mod pagination;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

pub use pagination::{MAX_PAGE_SIZE, Pagination, validate_page};

use crate::cache::{CacheEntry, CacheStore, ObjectCacheKey, ObjectRecord};
use crate::correlator::Correlator;
use crate::discovery::parse_identifier;
use crate::error::{Error, Result};
use crate::normalize::{engine_json, normalize_json, stringify};
use crate::proxy::{ProxyManager, methods};

/// One page of a device's object list
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PagedResult {
    pub device_address: String,
    pub device_identifier: String,
    pub objects: Vec<ObjectRecord>,
    pub pagination: Pagination,
    pub from_cache: bool,
    pub refreshed_at: DateTime<Utc>,
}

impl PagedResult {
    fn from_entry(entry: CacheEntry, from_cache: bool) -> Self {
        Self {
            device_address: entry.device_address,
            device_identifier: entry.device_identifier,
            objects: entry.objects,
            pagination: entry.pagination,
            from_cache,
            refreshed_at: entry.refreshed_at,
        }
    }
}

/// Reads object names through the proxy, caching each fresh page
pub struct ObjectEnumerator {
    correlator: Correlator,
    cache: CacheStore,
    timeout: Duration,
}

impl ObjectEnumerator {
    pub fn new(correlator: Correlator, cache: CacheStore, timeout: Duration) -> Self {
        Self {
            correlator,
            cache,
            timeout,
        }
    }

    pub async fn read_object_names(
        &self,
        proxy: &ProxyManager,
        device_address: &str,
        device_identifier: &str,
        page: u32,
        page_size: u32,
        force_fresh: bool,
    ) -> Result<PagedResult> {
        validate_page(page, page_size)?;
        let device_address = non_empty("device_address", device_address)?;
        let device_identifier = non_empty("device_identifier", device_identifier)?;
        let key = ObjectCacheKey::new(device_address, device_identifier, page, page_size);

        if !force_fresh {
            if let Some(hit) = self.cached(&key) {
                return Ok(hit);
            }
        }

        let _refreshing = self.cache.lock_key(&key).await;
        // Another caller may have filled the entry while we waited
        if !force_fresh {
            if let Some(hit) = self.cached(&key) {
                return Ok(hit);
            }
        }

        let peer = proxy.require_peer()?;
        info!(
            device = device_identifier,
            address = device_address,
            page,
            page_size,
            force_fresh,
            "Reading object list"
        );
        let body = json!({
            "device_address": device_address,
            "device_identifier": device_identifier,
            "page": page,
            "page_size": page_size,
            "force_fresh_read": force_fresh,
        });
        let raw = self
            .correlator
            .request(&peer, methods::READ_OBJECT_LIST_NAMES, &body, self.timeout)
            .await?;

        let (objects, pagination) = parse_object_list(&raw, page, page_size)?;
        let entry = CacheEntry {
            device_address: device_address.to_string(),
            device_identifier: device_identifier.to_string(),
            page,
            page_size,
            pagination,
            objects,
            refreshed_at: Utc::now(),
        };
        if let Err(e) = self.cache.store_objects(entry.clone()).await {
            warn!(device = device_identifier, error = %e, "Failed to persist object cache");
        }
        Ok(PagedResult::from_entry(entry, false))
    }

    fn cached(&self, key: &ObjectCacheKey) -> Option<PagedResult> {
        let entry = self.cache.object_entry(key)?;
        debug!(
            device = %key.device_identifier,
            page = key.page,
            page_size = key.page_size,
            "Object list cache hit"
        );
        Some(PagedResult::from_entry(entry, true))
    }
}

fn non_empty<'a>(name: &str, value: &'a str) -> Result<&'a str> {
    let value = value.trim();
    if value.is_empty() {
        return Err(Error::Validation(format!("{} must not be empty", name)));
    }
    Ok(value)
}

/// Parse a `READ_OBJECT_LIST_NAMES` reply.
///
/// `results` is either a map from object identifier to its properties or a
/// list of objects carrying their own identifier.
pub fn parse_object_list(raw: &[u8], page: u32, page_size: u32) -> Result<(Vec<ObjectRecord>, Pagination)> {
    let value = engine_json(raw)?;
    let objects = match value.get("results") {
        Some(Value::Object(results)) => results
            .iter()
            .map(|(identifier, properties)| object_record(identifier.clone(), properties))
            .collect(),
        Some(Value::Array(results)) => results
            .iter()
            .filter_map(|properties| {
                let raw_identifier = first(
                    properties.as_object()?,
                    &["object_identifier", "object-identifier", "objectIdentifier"],
                )?;
                let identifier = parse_identifier(raw_identifier)
                    .map(|(identifier, _)| identifier)
                    .or_else(|| stringify(&normalize_json(raw_identifier.clone())))?;
                Some(object_record(identifier, properties))
            })
            .collect(),
        None | Some(Value::Null) => Vec::new(),
        Some(_) => return Err(Error::decode("results is neither a map nor a list", raw)),
    };

    let pagination = Pagination::from_engine(value.get("pagination"), page, page_size, objects.len());
    Ok((objects, pagination))
}

fn first<'a>(object: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| object.get(*key))
}

fn object_record(object_identifier: String, properties: &Value) -> ObjectRecord {
    let text = |keys: &[&str]| {
        properties
            .as_object()
            .and_then(|object| first(object, keys))
            .and_then(|v| stringify(&normalize_json(v.clone())))
    };
    ObjectRecord {
        object_identifier,
        object_name: text(&["object-name", "object_name", "objectName"]),
        units: text(&["units"]),
        present_value: text(&["present-value", "present_value", "presentValue"]),
    }
}
