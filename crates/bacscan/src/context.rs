//! Orchestration context
//!
//! Owns the proxy manager, correlator, cache and the operations built on
//! them. Every operation returns a structured response carrying
//! `status: done|error`; errors are reported, never raised.

use std::net::IpAddr;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::cache::{CacheStore, CachedDevice};
use crate::config::BacscanConfig;
use crate::correlator::{Correlator, ResponseRouter};
use crate::discovery::{DeviceRecord, ScanParams, ScanResult, SubnetScanner};
use crate::enumeration::{ObjectEnumerator, PagedResult};
use crate::error::Result;
use crate::properties::{DeviceProperties, PropertyAccess, PropertyRef, PropertyValue, WriteAck};
use crate::proxy::{LifecycleState, PeerInfo, ProcessLauncher, ProxyLauncher, ProxyManager};

/// Outcome marker on every response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Done,
    Error,
}

/// Structured response: status, optional error, and the operation's data
#[derive(Debug, Clone, Serialize)]
pub struct Response<T> {
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub data: Option<T>,
}

impl<T> Response<T> {
    pub fn is_done(&self) -> bool {
        self.status == Status::Done
    }

    fn from_result(operation: &str, result: Result<T>) -> Self {
        match result {
            Ok(data) => Self {
                status: Status::Done,
                error: None,
                data: Some(data),
            },
            Err(e) => {
                warn!(operation, error = %e, "Operation failed");
                Self {
                    status: Status::Error,
                    error: Some(e.to_string()),
                    data: None,
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProxyStatus {
    pub state: LifecycleState,
    pub peer: Option<PeerInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceList {
    pub devices: Vec<DeviceRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CachedDeviceList {
    pub devices: Vec<CachedDevice>,
}

pub struct OrchestrationContext {
    config: BacscanConfig,
    proxy: ProxyManager,
    cache: CacheStore,
    scanner: SubnetScanner,
    objects: ObjectEnumerator,
    properties: PropertyAccess,
}

impl OrchestrationContext {
    /// Context launching the configured engine program
    pub async fn new(config: BacscanConfig) -> Result<Self> {
        let cache = CacheStore::open(config.cache.resolved_dir()).await?;
        let launcher = Arc::new(ProcessLauncher::new(config.proxy.clone()));
        Ok(Self::with_launcher(config, launcher, cache))
    }

    pub fn with_launcher(config: BacscanConfig, launcher: Arc<dyn ProxyLauncher>, cache: CacheStore) -> Self {
        let router = ResponseRouter::new();
        let correlator = Correlator::new(router.clone());
        let requests = &config.requests;

        Self {
            proxy: ProxyManager::new(launcher, router, config.proxy.clone()),
            scanner: SubnetScanner::new(
                correlator.clone(),
                cache.clone(),
                config.scan.clone(),
                requests.who_is_timeout(),
            ),
            objects: ObjectEnumerator::new(correlator.clone(), cache.clone(), requests.object_list_timeout()),
            properties: PropertyAccess::new(correlator, requests.default_timeout()),
            cache,
            config,
        }
    }

    pub fn config(&self) -> &BacscanConfig {
        &self.config
    }

    pub fn proxy(&self) -> &ProxyManager {
        &self.proxy
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub async fn start_proxy(&self, local_address: Option<IpAddr>) -> Response<ProxyStatus> {
        let result = self.proxy.start(local_address).await.map(|_| self.proxy_status());
        Response::from_result("start_proxy", result)
    }

    pub async fn stop_proxy(&self) -> Response<ProxyStatus> {
        self.proxy.stop().await;
        Response::from_result("stop_proxy", Ok(self.proxy_status()))
    }

    pub fn proxy_status(&self) -> ProxyStatus {
        ProxyStatus {
            state: self.proxy.status(),
            peer: self.proxy.active_peer().map(|peer| peer.info()),
        }
    }

    pub async fn scan_subnet(&self, network: &str, params: ScanParams) -> ScanResult {
        self.scanner.scan(&self.proxy, network, &params).await
    }

    pub async fn who_is(
        &self,
        low: Option<u32>,
        high: Option<u32>,
        destination: Option<&str>,
    ) -> Response<DeviceList> {
        let result = self
            .scanner
            .who_is(&self.proxy, low, high, destination)
            .await
            .map(|devices| DeviceList { devices });
        Response::from_result("who_is", result)
    }

    pub async fn read_object_names(
        &self,
        device_address: &str,
        device_identifier: &str,
        page: u32,
        page_size: u32,
        force_fresh: bool,
    ) -> Response<PagedResult> {
        let result = self
            .objects
            .read_object_names(&self.proxy, device_address, device_identifier, page, page_size, force_fresh)
            .await;
        Response::from_result("read_object_names", result)
    }

    pub async fn read_property(&self, property: PropertyRef) -> Response<PropertyValue> {
        let result = self.properties.read_property(&self.proxy, property).await;
        Response::from_result("read_property", result)
    }

    pub async fn write_property(
        &self,
        property: PropertyRef,
        value: Value,
        priority: Option<u8>,
    ) -> Response<WriteAck> {
        let result = self
            .properties
            .write_property(&self.proxy, property, value, priority)
            .await;
        Response::from_result("write_property", result)
    }

    pub async fn read_device_all(&self, device_address: &str, device_identifier: &str) -> Response<DeviceProperties> {
        let result = self
            .properties
            .read_device_all(&self.proxy, device_address, device_identifier)
            .await;
        Response::from_result("read_device_all", result)
    }

    pub fn cached_devices(&self) -> Response<CachedDeviceList> {
        Response::from_result(
            "cached_devices",
            Ok(CachedDeviceList {
                devices: self.cache.devices(),
            }),
        )
    }
}
