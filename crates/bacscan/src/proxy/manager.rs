//! Proxy lifecycle management
//!
//! At most one proxy is active per manager. Starting a new proxy always
//! stops the previous one first, and the manager only hands out a peer after
//! the engine has announced its endpoint.

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use std::time::Duration;

use bacscan_ipc::Endpoint;
use parking_lot::RwLock;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::detect::detect_local_address;
use super::launcher::{LaunchContext, LaunchedProxy, ProxyLauncher};
use super::peer::{LifecycleState, PeerId, PeerState, ProxyPeer, SharedPeerState};
use crate::config::ProxyConfig;
use crate::correlator::ResponseRouter;
use crate::error::{Error, Result};

/// Extra time beyond the stop grace before a supervisor task is aborted
const JOIN_MARGIN: Duration = Duration::from_millis(250);

struct ActiveProxy {
    peer: Arc<ProxyPeer>,
    cancel: CancellationToken,
    supervisor: JoinHandle<()>,
}

/// Owns the proxy slot: start, stop, and access to the active peer
pub struct ProxyManager {
    launcher: Arc<dyn ProxyLauncher>,
    router: ResponseRouter,
    config: ProxyConfig,
    /// Serializes start/stop
    lifecycle: Mutex<Option<ActiveProxy>>,
    active: RwLock<Option<Arc<ProxyPeer>>>,
    state: AtomicU8,
    next_slot: AtomicU32,
}

impl ProxyManager {
    pub fn new(launcher: Arc<dyn ProxyLauncher>, router: ResponseRouter, config: ProxyConfig) -> Self {
        Self {
            launcher,
            router,
            config,
            lifecycle: Mutex::new(None),
            active: RwLock::new(None),
            state: AtomicU8::new(LifecycleState::Stopped as u8),
            next_slot: AtomicU32::new(1),
        }
    }

    /// Start a proxy bound to `local_address`, or to the configured or
    /// auto-detected address when `None`. Any running proxy is stopped first.
    pub async fn start(&self, local_address: Option<IpAddr>) -> Result<Arc<ProxyPeer>> {
        let mut slot = self.lifecycle.lock().await;
        if let Some(previous) = slot.take() {
            info!(peer = %previous.peer.id(), "Stopping previous proxy before restart");
            self.teardown(previous).await;
        }
        self.set_state(LifecycleState::Starting);

        match self.launch(local_address).await {
            Ok(active) => {
                let peer = active.peer.clone();
                *self.active.write() = Some(peer.clone());
                *slot = Some(active);
                self.set_state(LifecycleState::Registered);
                info!(peer = %peer.id(), endpoint = %peer.endpoint(), "Proxy registered");
                Ok(peer)
            }
            Err(e) => {
                error!(error = %e, "Failed to start proxy");
                self.set_state(LifecycleState::Failed);
                Err(e)
            }
        }
    }

    async fn launch(&self, local_address: Option<IpAddr>) -> Result<ActiveProxy> {
        let address = match local_address.or(self.config.local_address) {
            Some(address) => address,
            None => detect_local_address().await?,
        };

        let id = PeerId {
            local_address: address,
            slot: self.next_slot.fetch_add(1, Ordering::SeqCst),
        };
        let state = SharedPeerState::new(PeerState::Pending);
        let cancel = CancellationToken::new();

        let LaunchedProxy {
            channel,
            mut endpoint,
            supervisor,
        } = self
            .launcher
            .launch(LaunchContext {
                peer: id,
                state: state.clone(),
                router: self.router.clone(),
                cancel: cancel.clone(),
                grace: self.config.stop_grace(),
            })
            .await?;

        let timeout = self.config.registration_timeout();
        let announced = tokio::time::timeout(timeout, wait_for_endpoint(&mut endpoint))
            .await
            .ok()
            .flatten();

        let Some(endpoint) = announced else {
            warn!(peer = %id, ?timeout, "Proxy did not announce an endpoint");
            state.set(PeerState::Failed);
            cancel.cancel();
            self.join(id, supervisor).await;
            return Err(Error::RegistrationTimeout { address, timeout });
        };

        if !state.promote() {
            warn!(peer = %id, state = %state.get(), "Proxy went away right after announcing");
            cancel.cancel();
            self.join(id, supervisor).await;
            return Err(Error::Transport(format!(
                "proxy {} exited before registration completed",
                id
            )));
        }
        Ok(ActiveProxy {
            peer: Arc::new(ProxyPeer::new(id, endpoint, state, channel)),
            cancel,
            supervisor,
        })
    }

    /// Stop the active proxy. Idempotent.
    pub async fn stop(&self) {
        let mut slot = self.lifecycle.lock().await;
        match slot.take() {
            Some(active) => {
                self.teardown(active).await;
                info!("Proxy stopped");
            }
            None => tracing::debug!("Stop requested with no active proxy"),
        }
        self.set_state(LifecycleState::Stopped);
    }

    async fn teardown(&self, active: ActiveProxy) {
        let id = active.peer.id();
        active.peer.shared_state().set(PeerState::Unregistered);
        *self.active.write() = None;

        active.cancel.cancel();
        self.join(id, active.supervisor).await;

        let failed = self
            .router
            .fail_peer(&id, Error::Transport(format!("proxy {} was stopped", id)));
        if failed > 0 {
            info!(peer = %id, failed, "Failed requests pending on stopped proxy");
        }
    }

    async fn join(&self, id: PeerId, supervisor: JoinHandle<()>) {
        let abort = supervisor.abort_handle();
        match tokio::time::timeout(self.config.stop_grace() + JOIN_MARGIN, supervisor).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_cancelled() => {}
            Ok(Err(e)) => error!(peer = %id, error = %e, "Proxy supervisor panicked"),
            Err(_) => {
                warn!(peer = %id, "Proxy supervisor did not finish, aborting");
                abort.abort();
            }
        }
    }

    /// The registered peer, if any
    pub fn active_peer(&self) -> Option<Arc<ProxyPeer>> {
        self.active.read().clone()
    }

    /// The registered peer, or `PeerNotRegistered`
    pub fn require_peer(&self) -> Result<Arc<ProxyPeer>> {
        match self.active_peer() {
            Some(peer) if peer.is_registered() => Ok(peer),
            _ => Err(Error::PeerNotRegistered),
        }
    }

    /// Current lifecycle state. A registered proxy whose engine died reports `Failed`.
    pub fn status(&self) -> LifecycleState {
        let state = LifecycleState::from_u8(self.state.load(Ordering::SeqCst));
        if state == LifecycleState::Registered {
            if let Some(peer) = self.active_peer() {
                if peer.state() == PeerState::Failed {
                    return LifecycleState::Failed;
                }
            }
        }
        state
    }

    fn set_state(&self, state: LifecycleState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }
}

async fn wait_for_endpoint(rx: &mut watch::Receiver<Option<Endpoint>>) -> Option<Endpoint> {
    match rx.wait_for(Option::is_some).await {
        Ok(endpoint) => (*endpoint).clone(),
        // Launcher went away before announcing
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeEngine, LoopbackLauncher};

    fn config() -> ProxyConfig {
        ProxyConfig {
            local_address: Some("127.0.0.1".parse().unwrap()),
            registration_timeout_secs: 0.5,
            stop_grace_ms: 50,
            ..ProxyConfig::default()
        }
    }

    #[tokio::test]
    async fn test_start_registers_peer() {
        let launcher = Arc::new(LoopbackLauncher::new(FakeEngine::default()));
        let manager = ProxyManager::new(launcher.clone(), ResponseRouter::new(), config());

        let peer = manager.start(None).await.unwrap();

        assert!(peer.is_registered());
        assert_eq!(manager.status(), LifecycleState::Registered);
        assert_eq!(peer.id().local_address, "127.0.0.1".parse::<IpAddr>().unwrap());
        assert!(manager.active_peer().is_some());
    }

    /// Announces, then loses its engine before the manager registers it
    struct DiesAfterAnnounce;

    struct Unused;

    #[async_trait::async_trait]
    impl crate::proxy::MessageChannel for Unused {
        async fn transmit(&self, _message: crate::proxy::ChannelMessage) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl ProxyLauncher for DiesAfterAnnounce {
        async fn launch(&self, ctx: LaunchContext) -> Result<LaunchedProxy> {
            let (announce, endpoint) = watch::channel(Some(Endpoint {
                address: "127.0.0.1".into(),
                port: 47808,
            }));
            ctx.state.mark_failed();
            Ok(LaunchedProxy {
                channel: Arc::new(Unused),
                endpoint,
                supervisor: tokio::spawn(async move {
                    ctx.cancel.cancelled().await;
                    drop(announce);
                }),
            })
        }
    }

    #[tokio::test]
    async fn test_failed_peer_is_not_reported_registered() {
        let manager = ProxyManager::new(Arc::new(DiesAfterAnnounce), ResponseRouter::new(), config());

        let err = manager.start(None).await.unwrap_err();

        assert!(matches!(err, Error::Transport(_)));
        assert_eq!(manager.status(), LifecycleState::Failed);
        assert!(manager.active_peer().is_none());
    }

    #[tokio::test]
    async fn test_explicit_address_overrides_config() {
        let launcher = Arc::new(LoopbackLauncher::new(FakeEngine::default()));
        let manager = ProxyManager::new(launcher, ResponseRouter::new(), config());

        let peer = manager.start(Some("127.0.0.2".parse().unwrap())).await.unwrap();
        assert_eq!(peer.id().local_address.to_string(), "127.0.0.2");
    }

    #[tokio::test]
    async fn test_silent_engine_times_out_registration() {
        let launcher = Arc::new(LoopbackLauncher::new(FakeEngine::default().never_announce()));
        let manager = ProxyManager::new(launcher, ResponseRouter::new(), config());

        let err = manager.start(None).await.unwrap_err();

        assert!(matches!(err, Error::RegistrationTimeout { .. }));
        assert_eq!(manager.status(), LifecycleState::Failed);
        assert!(manager.active_peer().is_none());

        manager.stop().await;
        assert_eq!(manager.status(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_restart_stops_previous_before_registering() {
        let launcher = Arc::new(LoopbackLauncher::new(FakeEngine::default()));
        let manager = ProxyManager::new(launcher.clone(), ResponseRouter::new(), config());

        let first = manager.start(None).await.unwrap();
        let second = manager.start(None).await.unwrap();

        assert_eq!(first.state(), PeerState::Unregistered);
        assert!(second.is_registered());
        assert_ne!(first.id(), second.id());
        // First engine saw its stop before the second was launched
        assert_eq!(launcher.events(), vec!["launch 1", "stop 1", "launch 2"]);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let launcher = Arc::new(LoopbackLauncher::new(FakeEngine::default()));
        let manager = ProxyManager::new(launcher, ResponseRouter::new(), config());

        manager.stop().await;
        let peer = manager.start(None).await.unwrap();
        manager.stop().await;
        manager.stop().await;

        assert_eq!(peer.state(), PeerState::Unregistered);
        assert_eq!(manager.status(), LifecycleState::Stopped);
        assert!(matches!(manager.require_peer(), Err(Error::PeerNotRegistered)));
    }

    #[tokio::test]
    async fn test_engine_exit_reports_failed() {
        let launcher = Arc::new(LoopbackLauncher::new(FakeEngine::default()));
        let manager = ProxyManager::new(launcher.clone(), ResponseRouter::new(), config());

        let peer = manager.start(None).await.unwrap();
        launcher.crash(peer.id().slot);

        for _ in 0..100 {
            if manager.status() == LifecycleState::Failed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(manager.status(), LifecycleState::Failed);
        assert_eq!(peer.state(), PeerState::Failed);
    }
}
