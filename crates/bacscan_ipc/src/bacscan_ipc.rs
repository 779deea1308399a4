//! IPC protocol for communicating with a BACnet proxy engine process
//!
//! The proxy is driven over its stdin/stdout. Every frame is a big-endian
//! `u32` length (covering everything after it), a one-byte [`FrameKind`],
//! and a kind-specific body. Request and response payloads are opaque bytes.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

/// Upper bound on a single frame, kind byte included.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const TOKEN_LEN: usize = 16;

/// Errors produced while encoding or decoding frames
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown frame kind: {0}")]
    UnknownKind(u8),

    #[error("Empty frame")]
    Empty,

    #[error("Frame too large: {0} bytes")]
    TooLarge(usize),

    #[error("Truncated {0:?} frame")]
    Truncated(FrameKind),

    #[error("Method name too long: {0} bytes")]
    MethodTooLong(usize),

    #[error("Invalid UTF-8 in {0:?} frame")]
    InvalidUtf8(FrameKind),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Frame kinds on the wire
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    // Orchestrator → Proxy
    Request = 1,
    Stop = 2,

    // Proxy → Orchestrator
    Announce = 10,
    Log = 11,

    // Proxy → Orchestrator (replies)
    Response = 30,
    Failure = 31,
}

impl TryFrom<u8> for FrameKind {
    type Error = IpcError;

    fn try_from(value: u8) -> Result<Self, IpcError> {
        match value {
            1 => Ok(FrameKind::Request),
            2 => Ok(FrameKind::Stop),
            10 => Ok(FrameKind::Announce),
            11 => Ok(FrameKind::Log),
            30 => Ok(FrameKind::Response),
            31 => Ok(FrameKind::Failure),
            _ => Err(IpcError::UnknownKind(value)),
        }
    }
}

/// Transport endpoint announced by the engine once it is reachable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Log line forwarded by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: String,
    pub message: String,
}

/// A decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Invoke `method` on the engine. `token` is present iff a response is expected.
    Request {
        token: Option<Uuid>,
        method: String,
        payload: Vec<u8>,
    },
    /// Ask the engine to shut down
    Stop,
    Announce(Endpoint),
    Log(LogRecord),
    Response {
        token: Uuid,
        payload: Vec<u8>,
    },
    /// The engine could not serve the request carrying `token`
    Failure {
        token: Uuid,
        message: String,
    },
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Request { .. } => FrameKind::Request,
            Frame::Stop => FrameKind::Stop,
            Frame::Announce(_) => FrameKind::Announce,
            Frame::Log(_) => FrameKind::Log,
            Frame::Response { .. } => FrameKind::Response,
            Frame::Failure { .. } => FrameKind::Failure,
        }
    }

    /// Encode into wire bytes, length prefix included
    pub fn encode(&self) -> Result<Vec<u8>, IpcError> {
        let mut body = vec![self.kind() as u8];

        match self {
            Frame::Request {
                token,
                method,
                payload,
            } => {
                let method_len = u16::try_from(method.len())
                    .map_err(|_| IpcError::MethodTooLong(method.len()))?;
                body.push(u8::from(token.is_some()));
                body.extend_from_slice(token.unwrap_or_else(Uuid::nil).as_bytes());
                body.extend_from_slice(&method_len.to_be_bytes());
                body.extend_from_slice(method.as_bytes());
                body.extend_from_slice(payload);
            }
            Frame::Stop => {}
            Frame::Announce(endpoint) => body.extend(serde_json::to_vec(endpoint)?),
            Frame::Log(record) => body.extend(serde_json::to_vec(record)?),
            Frame::Response { token, payload } => {
                body.extend_from_slice(token.as_bytes());
                body.extend_from_slice(payload);
            }
            Frame::Failure { token, message } => {
                body.extend_from_slice(token.as_bytes());
                body.extend_from_slice(message.as_bytes());
            }
        }

        if body.len() > MAX_FRAME_LEN {
            return Err(IpcError::TooLarge(body.len()));
        }

        let mut out = Vec::with_capacity(4 + body.len());
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend(body);
        Ok(out)
    }

    /// Decode a frame body (everything after the kind byte)
    pub fn decode(kind: FrameKind, body: &[u8]) -> Result<Self, IpcError> {
        let mut rest = body;

        match kind {
            FrameKind::Request => {
                let flag = take(&mut rest, 1, kind)?[0];
                let token = read_token(&mut rest, kind)?;
                let len_bytes = take(&mut rest, 2, kind)?;
                let method_len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
                let method = std::str::from_utf8(take(&mut rest, method_len, kind)?)
                    .map_err(|_| IpcError::InvalidUtf8(kind))?
                    .to_string();
                Ok(Frame::Request {
                    token: (flag != 0).then_some(token),
                    method,
                    payload: rest.to_vec(),
                })
            }
            FrameKind::Stop => Ok(Frame::Stop),
            FrameKind::Announce => Ok(Frame::Announce(serde_json::from_slice(rest)?)),
            FrameKind::Log => Ok(Frame::Log(serde_json::from_slice(rest)?)),
            FrameKind::Response => {
                let token = read_token(&mut rest, kind)?;
                Ok(Frame::Response {
                    token,
                    payload: rest.to_vec(),
                })
            }
            FrameKind::Failure => {
                let token = read_token(&mut rest, kind)?;
                let message = String::from_utf8(rest.to_vec())
                    .map_err(|_| IpcError::InvalidUtf8(kind))?;
                Ok(Frame::Failure { token, message })
            }
        }
    }
}

fn take<'a>(rest: &mut &'a [u8], n: usize, kind: FrameKind) -> Result<&'a [u8], IpcError> {
    if rest.len() < n {
        return Err(IpcError::Truncated(kind));
    }
    let (head, tail) = rest.split_at(n);
    *rest = tail;
    Ok(head)
}

fn read_token(rest: &mut &[u8], kind: FrameKind) -> Result<Uuid, IpcError> {
    let bytes: [u8; TOKEN_LEN] = take(rest, TOKEN_LEN, kind)?
        .try_into()
        .map_err(|_| IpcError::Truncated(kind))?;
    Ok(Uuid::from_bytes(bytes))
}

/// Writes frames to the engine's stdin (or any async writer)
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Send a frame and flush it
    pub async fn send(&mut self, frame: &Frame) -> Result<(), IpcError> {
        let bytes = frame.encode()?;
        self.inner.write_all(&bytes).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Send a frame with a JSON body built from `data`
    pub async fn send_json<T: Serialize>(
        &mut self,
        token: Option<Uuid>,
        method: &str,
        data: &T,
    ) -> Result<(), IpcError> {
        let payload = serde_json::to_vec(data)?;
        self.send(&Frame::Request {
            token,
            method: method.to_string(),
            payload,
        })
        .await
    }
}

/// Reads frames from the engine's stdout (or any async reader)
pub struct FrameReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Receive the next frame. `Ok(None)` means the peer closed the stream.
    pub async fn recv(&mut self) -> Result<Option<Frame>, IpcError> {
        // Read length (4 bytes, big-endian)
        let mut len_buf = [0u8; 4];
        match self.inner.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_be_bytes(len_buf) as usize;

        if len == 0 {
            return Err(IpcError::Empty);
        }
        if len > MAX_FRAME_LEN {
            return Err(IpcError::TooLarge(len));
        }

        let mut kind_buf = [0u8; 1];
        self.inner.read_exact(&mut kind_buf).await?;
        let kind = FrameKind::try_from(kind_buf[0])?;

        let mut body = vec![0u8; len - 1];
        if !body.is_empty() {
            self.inner.read_exact(&mut body).await?;
        }

        Frame::decode(kind, &body).map(Some)
    }
}
