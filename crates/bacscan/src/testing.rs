//! In-process proxy engine for tests
//!
//! [`LoopbackLauncher`] wires a scripted [`FakeEngine`] to the orchestrator
//! over `tokio::io::duplex` pipes using the real frame protocol.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bacscan_ipc::{Endpoint, Frame, FrameReader, FrameWriter};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{DuplexStream, duplex};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::proxy::{
    FramedChannel, InboundDispatch, LaunchContext, LaunchedProxy, MessageChannel, ProxyLauncher,
    peer_lost, pump,
};

const PIPE_CAPACITY: usize = 256 * 1024;

type Responder = Arc<dyn Fn(&Value) -> Reply + Send + Sync>;

/// How the fake engine answers one method
#[derive(Clone)]
pub enum Reply {
    Json(Value),
    Raw(Vec<u8>),
    Failure(String),
    Silence,
    After(Duration, Box<Reply>),
    /// Computed from the request payload
    With(Responder),
}

impl Reply {
    pub fn with(f: impl Fn(&Value) -> Reply + Send + Sync + 'static) -> Self {
        Reply::With(Arc::new(f))
    }
}

/// A request the fake engine received
#[derive(Debug, Clone)]
pub struct Received {
    pub slot: u32,
    pub method: String,
    pub payload: Value,
    pub response_expected: bool,
}

/// Scripted engine behaviour
#[derive(Clone)]
pub struct FakeEngine {
    announce: bool,
    replies: HashMap<String, Reply>,
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self {
            announce: true,
            replies: HashMap::new(),
        }
    }
}

impl FakeEngine {
    pub fn never_announce(mut self) -> Self {
        self.announce = false;
        self
    }

    pub fn reply(mut self, method: &str, reply: Reply) -> Self {
        self.replies.insert(method.to_string(), reply);
        self
    }

    pub fn reply_json(self, method: &str, body: Value) -> Self {
        self.reply(method, Reply::Json(body))
    }
}

/// Launches [`FakeEngine`]s in-process
pub struct LoopbackLauncher {
    engine: FakeEngine,
    received: Arc<Mutex<Vec<Received>>>,
    events: Arc<Mutex<Vec<String>>>,
    crash: Mutex<HashMap<u32, CancellationToken>>,
}

impl LoopbackLauncher {
    pub fn new(engine: FakeEngine) -> Self {
        Self {
            engine,
            received: Arc::new(Mutex::new(Vec::new())),
            events: Arc::new(Mutex::new(Vec::new())),
            crash: Mutex::new(HashMap::new()),
        }
    }

    /// All requests received so far, across engines
    pub fn received(&self) -> Vec<Received> {
        self.received.lock().clone()
    }

    /// Number of requests received for `method`
    pub fn count(&self, method: &str) -> usize {
        self.received
            .lock()
            .iter()
            .filter(|r| r.method == method)
            .count()
    }

    /// Launch/stop events in order, e.g. `["launch 1", "stop 1"]`
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    /// Make the engine in `slot` vanish without a stop request
    pub fn crash(&self, slot: u32) {
        if let Some(token) = self.crash.lock().get(&slot) {
            token.cancel();
        }
    }
}

#[async_trait]
impl ProxyLauncher for LoopbackLauncher {
    async fn launch(&self, ctx: LaunchContext) -> Result<LaunchedProxy> {
        let slot = ctx.peer.slot;
        self.events.lock().push(format!("launch {}", slot));

        let (to_engine, engine_in) = duplex(PIPE_CAPACITY);
        let (engine_out, from_engine) = duplex(PIPE_CAPACITY);

        let crash = CancellationToken::new();
        self.crash.lock().insert(slot, crash.clone());
        tokio::spawn(run_engine(
            self.engine.clone(),
            slot,
            engine_in,
            engine_out,
            self.received.clone(),
            self.events.clone(),
            crash,
        ));

        let channel = Arc::new(FramedChannel::new(to_engine));
        let (dispatch, endpoint) = InboundDispatch::new(ctx.peer, ctx.router.clone());
        let stopper = channel.clone();
        let supervisor = tokio::spawn(async move {
            let mut reader = FrameReader::new(from_engine);
            let exit = tokio::select! {
                _ = ctx.cancel.cancelled() => None,
                exit = pump(&mut reader, &dispatch) => Some(exit),
            };
            match exit {
                None => {
                    let _ = stopper.shutdown().await;
                    // Wait for the engine to close its end
                    let _ = tokio::time::timeout(ctx.grace, pump(&mut reader, &dispatch)).await;
                }
                Some(exit) => peer_lost(&ctx, &exit.to_string()),
            }
        });

        Ok(LaunchedProxy {
            channel,
            endpoint,
            supervisor,
        })
    }
}

async fn run_engine(
    engine: FakeEngine,
    slot: u32,
    input: DuplexStream,
    output: DuplexStream,
    received: Arc<Mutex<Vec<Received>>>,
    events: Arc<Mutex<Vec<String>>>,
    crash: CancellationToken,
) {
    let mut reader = FrameReader::new(input);
    let writer = Arc::new(tokio::sync::Mutex::new(FrameWriter::new(output)));

    if engine.announce {
        let announce = Frame::Announce(Endpoint {
            address: "127.0.0.1".into(),
            port: 47808,
        });
        if writer.lock().await.send(&announce).await.is_err() {
            return;
        }
    }

    loop {
        let frame = tokio::select! {
            _ = crash.cancelled() => return,
            frame = reader.recv() => frame,
        };
        match frame {
            Ok(Some(Frame::Request {
                token,
                method,
                payload,
            })) => {
                let payload = serde_json::from_slice(&payload).unwrap_or(Value::Null);
                received.lock().push(Received {
                    slot,
                    method: method.clone(),
                    payload: payload.clone(),
                    response_expected: token.is_some(),
                });
                let (Some(token), Some(reply)) = (token, engine.replies.get(&method).cloned())
                else {
                    continue;
                };
                let writer = writer.clone();
                tokio::spawn(async move {
                    if let Some(frame) = answer(token, reply, &payload).await {
                        let _ = writer.lock().await.send(&frame).await;
                    }
                });
            }
            Ok(Some(Frame::Stop)) => {
                events.lock().push(format!("stop {}", slot));
                return;
            }
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => return,
        }
    }
}

async fn answer(token: uuid::Uuid, mut reply: Reply, request: &Value) -> Option<Frame> {
    loop {
        reply = match reply {
            Reply::Json(body) => {
                return Some(Frame::Response {
                    token,
                    payload: serde_json::to_vec(&body).unwrap_or_default(),
                });
            }
            Reply::Raw(payload) => return Some(Frame::Response { token, payload }),
            Reply::Failure(message) => return Some(Frame::Failure { token, message }),
            Reply::Silence => return None,
            Reply::After(delay, next) => {
                tokio::time::sleep(delay).await;
                *next
            }
            Reply::With(f) => f(request),
        };
    }
}
