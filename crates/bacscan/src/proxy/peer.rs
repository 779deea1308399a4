//! Proxy peer identity and state

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use bacscan_ipc::Endpoint;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::channel::MessageChannel;

/// Identity of one proxy instance: the address it is bound to plus a
/// per-manager slot number that increases on every start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct PeerId {
    pub local_address: IpAddr,
    pub slot: u32,
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.local_address, self.slot)
    }
}

/// Registration state of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum PeerState {
    Unregistered = 0,
    Pending = 1,
    Registered = 2,
    Failed = 3,
}

impl PeerState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Unregistered,
            1 => Self::Pending,
            2 => Self::Registered,
            _ => Self::Failed,
        }
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerState::Unregistered => write!(f, "unregistered"),
            PeerState::Pending => write!(f, "pending"),
            PeerState::Registered => write!(f, "registered"),
            PeerState::Failed => write!(f, "failed"),
        }
    }
}

/// Peer state shared between the manager, the peer and its supervising task
#[derive(Debug, Clone)]
pub struct SharedPeerState(Arc<AtomicU8>);

impl SharedPeerState {
    pub fn new(state: PeerState) -> Self {
        Self(Arc::new(AtomicU8::new(state as u8)))
    }

    pub fn get(&self) -> PeerState {
        PeerState::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub fn set(&self, state: PeerState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    /// Move `Pending` to `Registered`. False when the peer already failed
    /// or was torn down in the meantime.
    pub fn promote(&self) -> bool {
        self.0
            .compare_exchange(
                PeerState::Pending as u8,
                PeerState::Registered as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Move to `Failed` unless the peer was already torn down
    pub fn mark_failed(&self) -> bool {
        self.0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                match PeerState::from_u8(current) {
                    PeerState::Pending | PeerState::Registered => Some(PeerState::Failed as u8),
                    _ => None,
                }
            })
            .is_ok()
    }
}

/// Lifecycle of the proxy slot owned by a [`super::ProxyManager`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum LifecycleState {
    Stopped = 0,
    Starting = 1,
    Registered = 2,
    Failed = 3,
}

impl LifecycleState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Stopped,
            1 => Self::Starting,
            2 => Self::Registered,
            _ => Self::Failed,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Stopped => write!(f, "stopped"),
            LifecycleState::Starting => write!(f, "starting"),
            LifecycleState::Registered => write!(f, "registered"),
            LifecycleState::Failed => write!(f, "failed"),
        }
    }
}

/// A running proxy engine reachable through its message channel
pub struct ProxyPeer {
    id: PeerId,
    endpoint: Endpoint,
    created_at: DateTime<Utc>,
    state: SharedPeerState,
    channel: Arc<dyn MessageChannel>,
}

impl ProxyPeer {
    pub fn new(
        id: PeerId,
        endpoint: Endpoint,
        state: SharedPeerState,
        channel: Arc<dyn MessageChannel>,
    ) -> Self {
        Self {
            id,
            endpoint,
            created_at: Utc::now(),
            state,
            channel,
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> PeerState {
        self.state.get()
    }

    pub fn is_registered(&self) -> bool {
        self.state() == PeerState::Registered
    }

    pub(crate) fn shared_state(&self) -> &SharedPeerState {
        &self.state
    }

    pub(crate) fn channel(&self) -> &dyn MessageChannel {
        self.channel.as_ref()
    }

    /// Serializable snapshot for status responses
    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            local_address: self.id.local_address,
            slot: self.id.slot,
            state: self.state(),
            endpoint: self.endpoint.to_string(),
            created_at: self.created_at,
        }
    }
}

impl fmt::Debug for ProxyPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyPeer")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Peer details as reported to callers
#[derive(Debug, Clone, Serialize)]
pub struct PeerInfo {
    pub local_address: IpAddr,
    pub slot: u32,
    pub state: PeerState,
    pub endpoint: String,
    pub created_at: DateTime<Utc>,
}
