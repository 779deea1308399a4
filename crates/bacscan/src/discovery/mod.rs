//! Subnet discovery
//!
//! A scan is one `SCAN_SUBNET` request: the engine does the Who-Is
//! broadcast and the per-address sweep itself, bounded by the forwarded
//! concurrency and duration limits. This side validates, correlates,
//! normalizes the device list, and records what was found.

mod device;
mod params;

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

pub use device::{DeviceRecord, devices_from, host_of, parse_device_list, parse_identifier};
pub use params::{EffectiveScanParams, ScanJob, ScanParams, count_addresses};

use crate::cache::CacheStore;
use crate::config::ScanDefaults;
use crate::context::Status;
use crate::correlator::Correlator;
use crate::error::{Error, Result};
use crate::proxy::{ProxyManager, methods};

/// Highest BACnet device instance
pub const MAX_DEVICE_INSTANCE: u32 = 4_194_303;

/// Outcome of one subnet scan
#[derive(Debug, Clone, Serialize)]
pub struct ScanResult {
    pub status: Status,
    pub network: String,
    pub ips_scanned: u64,
    pub devices: Vec<DeviceRecord>,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl ScanResult {
    fn done(network: &str, ips_scanned: u64, devices: Vec<DeviceRecord>, started: Instant) -> Self {
        Self {
            status: Status::Done,
            network: network.to_string(),
            ips_scanned,
            devices,
            error: None,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }

    fn failed(network: &str, ips_scanned: u64, error: &Error, started: Instant) -> Self {
        Self {
            status: Status::Error,
            network: network.to_string(),
            ips_scanned,
            devices: Vec::new(),
            error: Some(error.to_string()),
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// Runs scans and Who-Is requests against the active proxy
pub struct SubnetScanner {
    correlator: Correlator,
    cache: CacheStore,
    defaults: ScanDefaults,
    who_is_timeout: Duration,
    running: Mutex<Vec<(Uuid, ScanJob)>>,
}

impl SubnetScanner {
    pub fn new(
        correlator: Correlator,
        cache: CacheStore,
        defaults: ScanDefaults,
        who_is_timeout: Duration,
    ) -> Self {
        Self {
            correlator,
            cache,
            defaults,
            who_is_timeout,
            running: Mutex::new(Vec::new()),
        }
    }

    /// Scan `network`. Failures are reported in the result, never raised.
    pub async fn scan(&self, proxy: &ProxyManager, network: &str, params: &ScanParams) -> ScanResult {
        let started = Instant::now();
        let job = match ScanJob::new(network, params, &self.defaults) {
            Ok(job) => job,
            Err(e) => {
                warn!(network, error = %e, "Rejected scan request");
                return ScanResult::failed(network.trim(), 0, &e, started);
            }
        };

        let ips_scanned = job.ips_scanned();
        info!(network = %job.network, ips_scanned, "Starting subnet scan");
        match self.run(proxy, &job).await {
            Ok(devices) => {
                info!(
                    network = %job.network,
                    devices = devices.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Subnet scan finished"
                );
                ScanResult::done(&job.network, ips_scanned, devices, started)
            }
            Err(e) => {
                warn!(network = %job.network, error = %e, "Subnet scan failed");
                ScanResult::failed(&job.network, ips_scanned, &e, started)
            }
        }
    }

    async fn run(&self, proxy: &ProxyManager, job: &ScanJob) -> Result<Vec<DeviceRecord>> {
        let _claim = self.claim(job)?;
        let peer = proxy.require_peer()?;
        let limit = job.params.max_duration();

        let raw = self
            .correlator
            .request(&peer, methods::SCAN_SUBNET, &job.payload(), limit)
            .await
            .map_err(|e| match e {
                Error::RequestTimeout { timeout, .. } => Error::ScanTimeout(format!(
                    "scan of {} did not finish within {:?}",
                    job.network, timeout
                )),
                other => other,
            })?;

        let devices = parse_device_list(&raw)?;
        self.remember(&devices).await;
        Ok(devices)
    }

    fn claim(&self, job: &ScanJob) -> Result<ScanClaim<'_>> {
        let mut running = self.running.lock();
        if let Some((_, other)) = running.iter().find(|(_, other)| other.overlaps(job)) {
            return Err(Error::Validation(format!(
                "a scan of {} is already running and overlaps {}",
                other.network, job.network
            )));
        }
        let id = Uuid::new_v4();
        running.push((id, job.clone()));
        Ok(ScanClaim {
            running: &self.running,
            id,
        })
    }

    /// Broadcast a Who-Is for `low..=high` (whole range when unset).
    ///
    /// A Who-Is window that closes without answers yields no devices.
    pub async fn who_is(
        &self,
        proxy: &ProxyManager,
        low: Option<u32>,
        high: Option<u32>,
        destination: Option<&str>,
    ) -> Result<Vec<DeviceRecord>> {
        let low = low.unwrap_or(0);
        let high = high.unwrap_or(MAX_DEVICE_INSTANCE);
        if low > high || high > MAX_DEVICE_INSTANCE {
            return Err(Error::Validation(format!(
                "instance range {}..={} must lie within 0..={}",
                low, high, MAX_DEVICE_INSTANCE
            )));
        }

        let peer = proxy.require_peer()?;
        let body = json!({
            "low_limit": low,
            "high_limit": high,
            "destination": destination,
        });
        let raw = self
            .correlator
            .request(&peer, methods::WHO_IS, &body, self.who_is_timeout)
            .await?;

        let devices = match parse_device_list(&raw) {
            Ok(devices) => devices,
            Err(Error::ScanTimeout(_)) => Vec::new(),
            Err(e) => return Err(e),
        };
        info!(low, high, destination, devices = devices.len(), "Who-Is finished");
        self.remember(&devices).await;
        Ok(devices)
    }

    async fn remember(&self, devices: &[DeviceRecord]) {
        if let Err(e) = self.cache.store_devices(devices).await {
            warn!(error = %e, "Failed to cache discovered devices");
        }
    }
}

struct ScanClaim<'a> {
    running: &'a Mutex<Vec<(Uuid, ScanJob)>>,
    id: Uuid,
}

impl Drop for ScanClaim<'_> {
    fn drop(&mut self) {
        self.running.lock().retain(|(id, _)| *id != self.id);
    }
}
