//! Launching proxy engines and routing their inbound frames

use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bacscan_ipc::{Endpoint, Frame, FrameReader, IpcError, LogRecord};
use tokio::io::AsyncRead;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::channel::{FramedChannel, MessageChannel};
use super::peer::{PeerId, SharedPeerState};
use crate::config::ProxyConfig;
use crate::correlator::ResponseRouter;
use crate::error::{Error, Result};

/// Everything a launcher needs to wire a new engine into the orchestrator
pub struct LaunchContext {
    pub peer: PeerId,
    pub state: SharedPeerState,
    pub router: ResponseRouter,
    /// Cancelled by the manager to stop the engine
    pub cancel: CancellationToken,
    /// How long the engine gets to exit after a stop request
    pub grace: Duration,
}

/// A freshly launched engine
pub struct LaunchedProxy {
    pub channel: Arc<dyn MessageChannel>,
    /// Receives the endpoint once the engine announces it
    pub endpoint: watch::Receiver<Option<Endpoint>>,
    /// Task owning the engine; finishes once the engine is gone
    pub supervisor: JoinHandle<()>,
}

/// Starts proxy engines
#[async_trait]
pub trait ProxyLauncher: Send + Sync + 'static {
    async fn launch(&self, ctx: LaunchContext) -> Result<LaunchedProxy>;
}

/// Routes frames from one engine to the right place
pub struct InboundDispatch {
    peer: PeerId,
    router: ResponseRouter,
    endpoint: watch::Sender<Option<Endpoint>>,
}

impl InboundDispatch {
    pub fn new(
        peer: PeerId,
        router: ResponseRouter,
    ) -> (Self, watch::Receiver<Option<Endpoint>>) {
        let (endpoint, rx) = watch::channel(None);
        (
            Self {
                peer,
                router,
                endpoint,
            },
            rx,
        )
    }

    pub fn dispatch(&self, frame: Frame) {
        match frame {
            Frame::Announce(endpoint) => {
                info!(peer = %self.peer, %endpoint, "Proxy announced endpoint");
                self.endpoint.send_replace(Some(endpoint));
            }
            Frame::Log(record) => forward_log(&self.peer, &record),
            Frame::Response { token, payload } => {
                self.router.resolve(token, Ok(payload));
            }
            Frame::Failure { token, message } => {
                self.router.resolve(token, Err(Error::Engine(message)));
            }
            other => {
                warn!(peer = %self.peer, kind = ?other.kind(), "Unexpected frame from proxy");
            }
        }
    }
}

/// Re-emit an engine log line under the `proxy` target
fn forward_log(peer: &PeerId, record: &LogRecord) {
    match record.level.as_str() {
        "trace" => tracing::trace!(target: "proxy", "[{}] {}", peer, record.message),
        "debug" => tracing::debug!(target: "proxy", "[{}] {}", peer, record.message),
        "info" => tracing::info!(target: "proxy", "[{}] {}", peer, record.message),
        "warn" | "warning" => tracing::warn!(target: "proxy", "[{}] {}", peer, record.message),
        "error" | "critical" => tracing::error!(target: "proxy", "[{}] {}", peer, record.message),
        _ => tracing::info!(target: "proxy", "[{}] {}", peer, record.message),
    }
}

/// Why an inbound stream ended
#[derive(Debug)]
pub enum PumpExit {
    Closed,
    Failed(IpcError),
}

impl fmt::Display for PumpExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PumpExit::Closed => write!(f, "output closed"),
            PumpExit::Failed(e) => write!(f, "read failed: {}", e),
        }
    }
}

/// Read and dispatch frames until the stream ends
pub async fn pump<R: AsyncRead + Unpin>(
    reader: &mut FrameReader<R>,
    dispatch: &InboundDispatch,
) -> PumpExit {
    loop {
        match reader.recv().await {
            Ok(Some(frame)) => dispatch.dispatch(frame),
            Ok(None) => return PumpExit::Closed,
            Err(e) => return PumpExit::Failed(e),
        }
    }
}

/// Mark a peer failed after its engine went away on its own
pub fn peer_lost(ctx: &LaunchContext, reason: &str) {
    if ctx.state.mark_failed() {
        warn!(peer = %ctx.peer, reason, "Proxy stopped unexpectedly");
    }
    ctx.router.fail_peer(
        &ctx.peer,
        Error::Transport(format!("proxy {} stopped: {}", ctx.peer, reason)),
    );
}

/// Launches the engine as a child process speaking frames over stdio
pub struct ProcessLauncher {
    config: ProxyConfig,
}

impl ProcessLauncher {
    pub fn new(config: ProxyConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ProxyLauncher for ProcessLauncher {
    async fn launch(&self, ctx: LaunchContext) -> Result<LaunchedProxy> {
        let args = self.config.args_for(ctx.peer.local_address);
        info!(
            program = %self.config.program.display(),
            ?args,
            peer = %ctx.peer,
            "Spawning proxy engine"
        );

        let mut child = Command::new(&self.config.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::Transport(format!(
                    "failed to spawn {}: {}",
                    self.config.program.display(),
                    e
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Transport("proxy stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Transport("proxy stdout unavailable".into()))?;

        let channel = Arc::new(FramedChannel::new(stdin));
        let (dispatch, endpoint) = InboundDispatch::new(ctx.peer, ctx.router.clone());
        let supervisor = tokio::spawn(supervise_process(
            child,
            FrameReader::new(stdout),
            channel.clone(),
            dispatch,
            ctx,
        ));

        Ok(LaunchedProxy {
            channel,
            endpoint,
            supervisor,
        })
    }
}

async fn supervise_process(
    mut child: Child,
    mut reader: FrameReader<ChildStdout>,
    channel: Arc<FramedChannel<ChildStdin>>,
    dispatch: InboundDispatch,
    ctx: LaunchContext,
) {
    let lost = tokio::select! {
        _ = ctx.cancel.cancelled() => None,
        exit = pump(&mut reader, &dispatch) => Some(exit.to_string()),
        status = child.wait() => Some(match status {
            Ok(status) => format!("process exited with {}", status),
            Err(e) => format!("wait failed: {}", e),
        }),
    };

    match lost {
        None => {
            debug!(peer = %ctx.peer, "Stopping proxy engine");
            if let Err(e) = channel.shutdown().await {
                debug!(peer = %ctx.peer, error = %e, "Stop frame not delivered");
            }
            match tokio::time::timeout(ctx.grace, child.wait()).await {
                Ok(Ok(status)) => info!(peer = %ctx.peer, %status, "Proxy engine exited"),
                Ok(Err(e)) => error!(peer = %ctx.peer, error = %e, "Failed to wait for proxy engine"),
                Err(_) => {
                    warn!(peer = %ctx.peer, "Proxy engine did not exit in time, killing");
                    if let Err(e) = child.kill().await {
                        error!(peer = %ctx.peer, error = %e, "Failed to kill proxy engine");
                    }
                }
            }
        }
        Some(reason) => {
            peer_lost(&ctx, &reason);
            // stdout may close before the process exits
            let _ = child.kill().await;
        }
    }
}
