//! Proxy engine lifecycle and transport
//!
//! A proxy is an external protocol engine bound to one local address. It
//! speaks length-prefixed frames (see `bacscan_ipc`) and must announce its
//! endpoint before it is usable.

mod channel;
mod detect;
mod launcher;
mod manager;
mod peer;

pub use channel::{ChannelMessage, FramedChannel, MessageChannel};
pub use detect::{PROBE_TARGET, detect_local_address, detect_via};
pub use launcher::{
    InboundDispatch, LaunchContext, LaunchedProxy, ProcessLauncher, ProxyLauncher, PumpExit,
    peer_lost, pump,
};
pub use manager::ProxyManager;
pub use peer::{LifecycleState, PeerId, PeerInfo, PeerState, ProxyPeer, SharedPeerState};

/// Method names understood by the proxy engine
pub mod methods {
    pub const SCAN_SUBNET: &str = "SCAN_SUBNET";
    pub const READ_OBJECT_LIST_NAMES: &str = "READ_OBJECT_LIST_NAMES";
    pub const READ_PROPERTY: &str = "READ_PROPERTY";
    pub const WRITE_PROPERTY: &str = "WRITE_PROPERTY";
    pub const READ_DEVICE_ALL: &str = "READ_DEVICE_ALL";
    pub const WHO_IS: &str = "WHO_IS";
}
