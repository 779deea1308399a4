//! bacscan - BACnet discovery and enumeration through a proxy engine
//!
//! This crate drives an external BACnet protocol engine (the proxy) and provides:
//! - Proxy lifecycle management and request/response correlation
//! - Subnet discovery and Who-Is
//! - Paginated object-list enumeration with an on-disk cache
//! - Normalization of the engine's loosely-typed values

pub mod error;
pub use error::{Error, Result};

// Configuration (TOML + env)
pub mod config;

// Value normalization
pub mod normalize;

// Proxy engine lifecycle and transport
pub mod proxy;

// Request correlation
pub mod correlator;

// Device and object caches
pub mod cache;

// Subnet scans and Who-Is
pub mod discovery;

// Object-list enumeration
pub mod enumeration;

// Property reads and writes
pub mod properties;

// Orchestration entry points
pub mod context;
pub use context::{OrchestrationContext, Response, Status};

#[cfg(test)]
pub(crate) mod testing;
