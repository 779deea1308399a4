//! Request/response correlation over a proxy's message channel
//!
//! Every request that expects an answer gets a fresh token and a pending
//! entry holding a oneshot sender. The launcher's inbound task resolves
//! entries as response frames arrive; callers wait with a deadline. Entries
//! are removed on every exit path, so an abandoned waiter never leaks.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::proxy::{ChannelMessage, MessageChannel, PeerId, ProxyPeer};

type Reply = oneshot::Sender<Result<Vec<u8>>>;

/// A request waiting for its response frame
struct PendingRequest {
    peer: PeerId,
    method: String,
    payload_len: usize,
    created_at: Instant,
    reply: Reply,
}

/// Routes inbound responses to waiting callers by token
#[derive(Clone, Default)]
pub struct ResponseRouter {
    pending: Arc<DashMap<Uuid, PendingRequest>>,
}

impl ResponseRouter {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(
        &self,
        peer: PeerId,
        method: &str,
        payload_len: usize,
    ) -> (Uuid, oneshot::Receiver<Result<Vec<u8>>>) {
        let (reply, rx) = oneshot::channel();
        let request = PendingRequest {
            peer,
            method: method.to_string(),
            payload_len,
            created_at: Instant::now(),
            reply,
        };

        loop {
            let token = Uuid::new_v4();
            if let Entry::Vacant(slot) = self.pending.entry(token) {
                slot.insert(request);
                return (token, rx);
            }
        }
    }

    /// Deliver an outcome to the waiter for `token`.
    ///
    /// Returns false when nothing is waiting (late or unknown response); the
    /// outcome is dropped.
    pub fn resolve(&self, token: Uuid, outcome: Result<Vec<u8>>) -> bool {
        match self.pending.remove(&token) {
            Some((_, request)) => {
                debug!(
                    %token,
                    method = %request.method,
                    peer = %request.peer,
                    request_bytes = request.payload_len,
                    elapsed_ms = request.created_at.elapsed().as_millis() as u64,
                    "Response correlated"
                );
                // Receiver may have given up in the meantime
                let _ = request.reply.send(outcome);
                true
            }
            None => {
                warn!(%token, "Dropping response with no pending request");
                false
            }
        }
    }

    /// Fail every request pending on `peer`. Returns how many were failed.
    pub fn fail_peer(&self, peer: &PeerId, error: Error) -> usize {
        let tokens: Vec<Uuid> = self
            .pending
            .iter()
            .filter(|entry| entry.peer == *peer)
            .map(|entry| *entry.key())
            .collect();

        let mut failed = 0;
        for token in tokens {
            if let Some((_, request)) = self.pending.remove(&token) {
                let _ = request.reply.send(Err(error.clone()));
                failed += 1;
            }
        }
        if failed > 0 {
            debug!(%peer, failed, "Failed pending requests");
        }
        failed
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// Removes a pending entry when the waiting future completes or is dropped
struct PendingGuard<'a> {
    router: &'a ResponseRouter,
    token: Uuid,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.router.pending.remove(&self.token);
    }
}

/// Sends requests to a proxy peer and waits for correlated responses
#[derive(Clone)]
pub struct Correlator {
    router: ResponseRouter,
}

impl Correlator {
    pub fn new(router: ResponseRouter) -> Self {
        Self { router }
    }

    /// Send one message to `peer`.
    ///
    /// Without `expect_response` this returns `Ok(None)` once transmitted.
    /// Otherwise it waits at most `timeout` (transmission included) for the
    /// matching response.
    pub async fn send(
        &self,
        peer: &ProxyPeer,
        method: &str,
        payload: Vec<u8>,
        expect_response: bool,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>> {
        if !peer.is_registered() {
            return Err(Error::PeerNotRegistered);
        }

        if !expect_response {
            peer.channel()
                .transmit(ChannelMessage {
                    token: None,
                    method_name: method.to_string(),
                    payload,
                })
                .await?;
            debug!(method, peer = %peer.id(), "Sent without response");
            return Ok(None);
        }

        let (token, reply) = self
            .router
            .register(peer.id(), method, payload.len());
        let _guard = PendingGuard {
            router: &self.router,
            token,
        };
        let message = ChannelMessage {
            token: Some(token),
            method_name: method.to_string(),
            payload,
        };

        debug!(%token, method, peer = %peer.id(), ?timeout, "Sending request");
        match tokio::time::timeout(timeout, exchange(peer.channel(), message, reply)).await {
            Ok(outcome) => outcome.map(Some),
            Err(_) => {
                warn!(%token, method, ?timeout, "Request timed out");
                Err(Error::RequestTimeout {
                    method: method.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Send a JSON body and wait for the raw response
    pub async fn request<T: Serialize + ?Sized>(
        &self,
        peer: &ProxyPeer,
        method: &str,
        body: &T,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let payload = serde_json::to_vec(body)?;
        self.send(peer, method, payload, true, timeout)
            .await?
            .ok_or_else(|| Error::Transport(format!("{} produced no response", method)))
    }
}

async fn exchange(
    channel: &dyn MessageChannel,
    message: ChannelMessage,
    reply: oneshot::Receiver<Result<Vec<u8>>>,
) -> Result<Vec<u8>> {
    channel.transmit(message).await?;
    match reply.await {
        Ok(outcome) => outcome,
        Err(_) => Err(Error::Transport("response channel closed".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::{PeerState, SharedPeerState};
    use async_trait::async_trait;
    use bacscan_ipc::Endpoint;
    use parking_lot::Mutex;

    /// Records transmitted messages and optionally answers them
    struct RecordingChannel {
        sent: Mutex<Vec<ChannelMessage>>,
        answer: Option<(ResponseRouter, Vec<u8>)>,
    }

    #[async_trait]
    impl MessageChannel for RecordingChannel {
        async fn transmit(&self, message: ChannelMessage) -> Result<()> {
            if let (Some(token), Some((router, body))) = (message.token, &self.answer) {
                let router = router.clone();
                let body = body.clone();
                tokio::spawn(async move {
                    router.resolve(token, Ok(body));
                });
            }
            self.sent.lock().push(message);
            Ok(())
        }
    }

    fn peer(channel: Arc<RecordingChannel>, state: PeerState) -> ProxyPeer {
        ProxyPeer::new(
            PeerId {
                local_address: "127.0.0.1".parse().unwrap(),
                slot: 1,
            },
            Endpoint {
                address: "127.0.0.1".into(),
                port: 47808,
            },
            SharedPeerState::new(state),
            channel,
        )
    }

    fn silent() -> Arc<RecordingChannel> {
        Arc::new(RecordingChannel {
            sent: Mutex::new(Vec::new()),
            answer: None,
        })
    }

    #[tokio::test]
    async fn test_unregistered_peer_rejected_before_transmit() {
        let channel = silent();
        let peer = peer(channel.clone(), PeerState::Pending);
        let correlator = Correlator::new(ResponseRouter::new());

        let err = correlator
            .send(&peer, "WHO_IS", vec![], true, Duration::from_secs(1))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::PeerNotRegistered));
        assert!(channel.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_response_is_correlated_by_token() {
        let router = ResponseRouter::new();
        let channel = Arc::new(RecordingChannel {
            sent: Mutex::new(Vec::new()),
            answer: Some((router.clone(), b"{\"ok\":true}".to_vec())),
        });
        let peer = peer(channel.clone(), PeerState::Registered);
        let correlator = Correlator::new(router.clone());

        let body = correlator
            .request(&peer, "READ_PROPERTY", &serde_json::json!({}), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(body, b"{\"ok\":true}");
        assert_eq!(router.pending_count(), 0);
        assert!(channel.sent.lock()[0].response_expected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_times_out_and_cleans_up() {
        let router = ResponseRouter::new();
        let peer = peer(silent(), PeerState::Registered);
        let correlator = Correlator::new(router.clone());

        let err = correlator
            .send(&peer, "SCAN_SUBNET", vec![], true, Duration::from_millis(200))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::RequestTimeout { .. }));
        assert_eq!(router.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_fire_and_forget_returns_none() {
        let router = ResponseRouter::new();
        let channel = silent();
        let peer = peer(channel.clone(), PeerState::Registered);
        let correlator = Correlator::new(router.clone());

        let out = correlator
            .send(&peer, "WRITE_PROPERTY", vec![1], false, Duration::from_secs(1))
            .await
            .unwrap();

        assert!(out.is_none());
        assert_eq!(router.pending_count(), 0);
        assert!(!channel.sent.lock()[0].response_expected());
    }

    #[tokio::test]
    async fn test_unknown_token_is_ignored() {
        let router = ResponseRouter::new();
        assert!(!router.resolve(Uuid::new_v4(), Ok(vec![1, 2, 3])));
        assert_eq!(router.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_token_leaves_pending_request_alone() {
        let router = ResponseRouter::new();
        let channel = silent();
        let peer = Arc::new(peer(channel.clone(), PeerState::Registered));
        let correlator = Correlator::new(router.clone());

        let waiter = {
            let peer = peer.clone();
            tokio::spawn(async move {
                correlator
                    .send(&peer, "READ_PROPERTY", vec![], true, Duration::from_secs(5))
                    .await
            })
        };
        while channel.sent.lock().is_empty() {
            tokio::task::yield_now().await;
        }
        let token = channel.sent.lock()[0].token.unwrap();

        assert!(!router.resolve(Uuid::new_v4(), Ok(b"stray".to_vec())));
        tokio::task::yield_now().await;
        assert_eq!(router.pending_count(), 1);
        assert!(!waiter.is_finished());

        assert!(router.resolve(token, Ok(b"72.5".to_vec())));
        let body = waiter.await.unwrap().unwrap();
        assert_eq!(body.as_deref(), Some(&b"72.5"[..]));
        assert_eq!(router.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_fail_peer_wakes_waiters() {
        let router = ResponseRouter::new();
        let peer = peer(silent(), PeerState::Registered);
        let correlator = Correlator::new(router.clone());

        let waiter = {
            let router = router.clone();
            let peer_id = peer.id();
            tokio::spawn(async move {
                while router.pending_count() == 0 {
                    tokio::task::yield_now().await;
                }
                router.fail_peer(&peer_id, Error::Transport("proxy stopped".into()))
            })
        };

        let err = correlator
            .send(&peer, "WHO_IS", vec![], true, Duration::from_secs(30))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Transport(_)));
        assert_eq!(waiter.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_requests_get_distinct_tokens() {
        let router = ResponseRouter::new();
        let channel = Arc::new(RecordingChannel {
            sent: Mutex::new(Vec::new()),
            answer: Some((router.clone(), b"[]".to_vec())),
        });
        let peer = Arc::new(peer(channel.clone(), PeerState::Registered));
        let correlator = Correlator::new(router.clone());

        let calls = (0..16).map(|_| {
            let correlator = correlator.clone();
            let peer = peer.clone();
            async move {
                correlator
                    .send(&peer, "WHO_IS", vec![], true, Duration::from_secs(5))
                    .await
            }
        });
        let results = futures::future::join_all(calls).await;

        assert!(results.iter().all(|r| r.is_ok()));
        let mut tokens: Vec<Uuid> = channel
            .sent
            .lock()
            .iter()
            .filter_map(|m| m.token)
            .collect();
        tokens.sort();
        tokens.dedup();
        assert_eq!(tokens.len(), 16);
    }
}
