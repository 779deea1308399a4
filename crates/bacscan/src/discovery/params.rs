//! Scan parameters and jobs

use std::time::Duration;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::MAX_DEVICE_INSTANCE;
use crate::config::{ScanDefaults, checked_secs};
use crate::error::{Error, Result};

/// Caller-supplied scan options; unset fields take the configured defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanParams {
    pub whois_timeout: Option<f64>,
    pub port: Option<u16>,
    pub low_limit: Option<u32>,
    pub high_limit: Option<u32>,
    pub enable_brute_force: Option<bool>,
    pub semaphore_limit: Option<usize>,
    pub max_duration: Option<f64>,
    #[serde(default)]
    pub force_fresh: bool,
}

/// Fully resolved scan options
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EffectiveScanParams {
    pub whois_timeout: f64,
    pub port: u16,
    pub low_limit: u32,
    pub high_limit: u32,
    pub enable_brute_force: bool,
    pub semaphore_limit: usize,
    pub max_duration: f64,
    pub force_fresh: bool,
}

impl ScanParams {
    pub fn resolve(&self, defaults: &ScanDefaults) -> Result<EffectiveScanParams> {
        let params = EffectiveScanParams {
            whois_timeout: self.whois_timeout.unwrap_or(defaults.whois_timeout_secs),
            port: self.port.unwrap_or(defaults.port),
            low_limit: self.low_limit.unwrap_or(defaults.low_limit),
            high_limit: self.high_limit.unwrap_or(defaults.high_limit),
            enable_brute_force: self.enable_brute_force.unwrap_or(defaults.enable_brute_force),
            semaphore_limit: self.semaphore_limit.unwrap_or(defaults.semaphore_limit),
            max_duration: self.max_duration.unwrap_or(defaults.max_duration_secs),
            force_fresh: self.force_fresh,
        };
        params.validate()?;
        Ok(params)
    }
}

impl EffectiveScanParams {
    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("whois_timeout", self.whois_timeout),
            ("max_duration", self.max_duration),
        ] {
            if checked_secs(value).is_none() {
                return Err(Error::Validation(format!(
                    "{} must be a positive, representable number of seconds, got {}",
                    name, value
                )));
            }
        }
        if self.semaphore_limit < 1 {
            return Err(Error::Validation("semaphore_limit must be at least 1".into()));
        }
        if self.low_limit > self.high_limit || self.high_limit > MAX_DEVICE_INSTANCE {
            return Err(Error::Validation(format!(
                "instance range {}..={} must lie within 0..={}",
                self.low_limit, self.high_limit, MAX_DEVICE_INSTANCE
            )));
        }
        Ok(())
    }

    pub fn max_duration(&self) -> Duration {
        checked_secs(self.max_duration).unwrap_or(Duration::MAX)
    }
}

/// One subnet scan, ready to send
#[derive(Debug, Clone)]
pub struct ScanJob {
    /// Network as given by the caller
    pub network: String,
    /// Parsed form, when the string is a valid CIDR
    pub parsed: Option<IpNetwork>,
    pub params: EffectiveScanParams,
}

impl ScanJob {
    pub fn new(network: &str, params: &ScanParams, defaults: &ScanDefaults) -> Result<Self> {
        let network = network.trim();
        if network.is_empty() {
            return Err(Error::Validation("network must not be empty".into()));
        }
        let parsed = network.parse::<IpNetwork>().ok();
        if parsed.is_none() {
            tracing::warn!(network, "Network is not a valid CIDR, forwarding as given");
        }
        Ok(Self {
            network: network.to_string(),
            parsed,
            params: params.resolve(defaults)?,
        })
    }

    /// Usable host count; 0 when the network did not parse
    pub fn ips_scanned(&self) -> u64 {
        self.parsed.as_ref().map(count_addresses).unwrap_or(0)
    }

    /// `SCAN_SUBNET` request body
    pub fn payload(&self) -> Value {
        let p = &self.params;
        json!({
            "network": self.network,
            "whois_timeout": p.whois_timeout,
            "port": p.port,
            "low_limit": p.low_limit,
            "high_limit": p.high_limit,
            "enable_brute_force": p.enable_brute_force,
            "semaphore_limit": p.semaphore_limit,
            "max_duration": p.max_duration,
            "force_fresh_read": p.force_fresh,
        })
    }

    /// Whether this job's network intersects `other`'s
    pub fn overlaps(&self, other: &ScanJob) -> bool {
        match (&self.parsed, &other.parsed) {
            (Some(a), Some(b)) => a.contains(b.network()) || b.contains(a.network()),
            _ => self.network == other.network,
        }
    }
}

/// Addresses in `network` minus network and broadcast when there are more than two
pub fn count_addresses(network: &IpNetwork) -> u64 {
    let host_bits = match network {
        IpNetwork::V4(n) => 32 - u32::from(n.prefix()),
        IpNetwork::V6(n) => 128 - u32::from(n.prefix()),
    };
    let total: u128 = 1u128.checked_shl(host_bits).unwrap_or(u128::MAX);
    let usable = if total > 2 { total - 2 } else { total };
    u64::try_from(usable).unwrap_or(u64::MAX)
}
