//! Message channel to a proxy engine

use async_trait::async_trait;
use bacscan_ipc::{Frame, FrameWriter};
use tokio::io::AsyncWrite;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::Result;

/// One outbound message. A response is expected iff `token` is set.
#[derive(Debug, Clone)]
pub struct ChannelMessage {
    pub token: Option<Uuid>,
    pub method_name: String,
    pub payload: Vec<u8>,
}

impl ChannelMessage {
    pub fn response_expected(&self) -> bool {
        self.token.is_some()
    }
}

/// Outbound half of the duplex transport to a proxy.
///
/// Inbound frames are routed by the launcher's supervising task, so a channel
/// only needs to know how to transmit.
#[async_trait]
pub trait MessageChannel: Send + Sync + 'static {
    async fn transmit(&self, message: ChannelMessage) -> Result<()>;

    /// Ask the engine to shut down. Best effort.
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// Channel writing [`Frame`]s to an async writer (the engine's stdin)
pub struct FramedChannel<W> {
    writer: Mutex<FrameWriter<W>>,
}

impl<W: AsyncWrite + Unpin + Send + 'static> FramedChannel<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(FrameWriter::new(writer)),
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> MessageChannel for FramedChannel<W> {
    async fn transmit(&self, message: ChannelMessage) -> Result<()> {
        let frame = Frame::Request {
            token: message.token,
            method: message.method_name,
            payload: message.payload,
        };
        self.writer.lock().await.send(&frame).await?;
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.writer.lock().await.send(&Frame::Stop).await?;
        Ok(())
    }
}
