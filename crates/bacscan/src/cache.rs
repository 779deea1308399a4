//! On-disk cache for discovered devices and enumerated objects
//!
//! Both caches are held in memory and mirrored to flat JSON arrays under the
//! cache directory. Writes go to a temporary sibling that is renamed into
//! place, so readers never see a half-written file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::discovery::DeviceRecord;
use crate::enumeration::Pagination;
use crate::error::{Error, Result};

pub const DEVICES_FILE: &str = "discovered_devices.json";
pub const OBJECTS_FILE: &str = "object_properties.json";

/// One object from a device's object list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub object_identifier: String,
    pub object_name: Option<String>,
    pub units: Option<String>,
    pub present_value: Option<String>,
}

/// Cached page of a device's object list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub device_address: String,
    pub device_identifier: String,
    pub page: u32,
    pub page_size: u32,
    pub pagination: Pagination,
    pub objects: Vec<ObjectRecord>,
    pub refreshed_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn key(&self) -> ObjectCacheKey {
        ObjectCacheKey::new(
            &self.device_address,
            &self.device_identifier,
            self.page,
            self.page_size,
        )
    }
}

/// One page of one device's object list
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectCacheKey {
    pub device_address: String,
    pub device_identifier: String,
    pub page: u32,
    pub page_size: u32,
}

impl ObjectCacheKey {
    pub fn new(device_address: &str, device_identifier: &str, page: u32, page_size: u32) -> Self {
        Self {
            device_address: device_address.to_string(),
            device_identifier: device_identifier.to_string(),
            page,
            page_size,
        }
    }
}

/// A discovered device with the last time it answered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedDevice {
    #[serde(flatten)]
    pub device: DeviceRecord,
    pub last_seen: DateTime<Utc>,
}

/// Device and object caches backed by a directory
#[derive(Clone)]
pub struct CacheStore {
    inner: Arc<Inner>,
}

struct Inner {
    dir: PathBuf,
    objects: RwLock<HashMap<ObjectCacheKey, CacheEntry>>,
    devices: RwLock<Vec<CachedDevice>>,
    key_locks: DashMap<ObjectCacheKey, Arc<Mutex<()>>>,
    /// Serializes file writes
    writer: Mutex<()>,
}

impl CacheStore {
    /// `<user cache dir>/bacscan`, or under the temp dir when the platform has none
    pub fn default_dir() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("bacscan")
    }

    /// Open the cache in `dir`, loading whatever is on disk
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let devices: Vec<CachedDevice> = load_array(&dir.join(DEVICES_FILE)).await?;
        let entries: Vec<CacheEntry> = load_array(&dir.join(OBJECTS_FILE)).await?;

        let objects: HashMap<_, _> = entries
            .into_iter()
            .map(|entry| (entry.key(), entry))
            .collect();

        info!(
            dir = %dir.display(),
            devices = devices.len(),
            object_entries = objects.len(),
            "Cache loaded"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                dir,
                objects: RwLock::new(objects),
                devices: RwLock::new(devices),
                key_locks: DashMap::new(),
                writer: Mutex::new(()),
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    pub fn object_entry(&self, key: &ObjectCacheKey) -> Option<CacheEntry> {
        self.inner.objects.read().get(key).cloned()
    }

    /// Exclusive per-key lock held while refreshing an entry
    pub async fn lock_key(&self, key: &ObjectCacheKey) -> KeyLock {
        let lock = self
            .inner
            .key_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        KeyLock {
            inner: self.inner.clone(),
            key: key.clone(),
            _guard: lock.lock_owned().await,
        }
    }

    /// Replace the entry for this page and persist
    pub async fn store_objects(&self, entry: CacheEntry) -> Result<()> {
        debug!(
            device = %entry.device_identifier,
            address = %entry.device_address,
            objects = entry.objects.len(),
            "Caching object list"
        );
        self.inner.objects.write().insert(entry.key(), entry);

        let _writing = self.inner.writer.lock().await;
        let snapshot: Vec<CacheEntry> = self.inner.objects.read().values().cloned().collect();
        write_array(&self.inner.dir.join(OBJECTS_FILE), &snapshot).await
    }

    pub fn devices(&self) -> Vec<CachedDevice> {
        self.inner.devices.read().clone()
    }

    /// Upsert devices by identifier, stamping `last_seen`, and persist
    pub async fn store_devices(&self, found: &[DeviceRecord]) -> Result<()> {
        if found.is_empty() {
            return Ok(());
        }
        let now = Utc::now();
        {
            let mut devices = self.inner.devices.write();
            for device in found {
                let cached = CachedDevice {
                    device: device.clone(),
                    last_seen: now,
                };
                match devices
                    .iter_mut()
                    .find(|d| d.device.device_identifier == device.device_identifier)
                {
                    Some(existing) => *existing = cached,
                    None => devices.push(cached),
                }
            }
        }

        let _writing = self.inner.writer.lock().await;
        let snapshot = self.devices();
        write_array(&self.inner.dir.join(DEVICES_FILE), &snapshot).await
    }
}

/// Held while one cache key is being refreshed.
///
/// The last holder removes the key's mutex from the lock table.
pub struct KeyLock {
    inner: Arc<Inner>,
    key: ObjectCacheKey,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for KeyLock {
    fn drop(&mut self) {
        // Table + our guard; anything above that is a waiter
        self.inner
            .key_locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) <= 2);
    }
}

async fn load_array<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let contents = match tokio::fs::read(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    match serde_json::from_slice(&contents) {
        Ok(items) => Ok(items),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ignoring unreadable cache file");
            Ok(Vec::new())
        }
    }
}

async fn write_array<T: Serialize>(path: &Path, items: &[T]) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(items)
        .map_err(|e| Error::Io(format!("failed to encode {}: {}", path.display(), e)))?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
