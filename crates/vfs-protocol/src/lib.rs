//! Wire protocol for the client/daemon bridge.
//!
//! ## Wire format
//!
//! All messages are length-prefixed:
//!
//! ```text
//! ┌──────────────────┬──────────────────────────┐
//! │ 4 bytes BE u32    │  MessagePack payload      │
//! │ (payload length)  │  (Request | Response | …) │
//! └──────────────────┴──────────────────────────┘
//! ```
//!
//! Each frame is tagged with a `kind` field so the reader doesn't need to
//! sniff the map shape to tell messages apart.
//!
//! ## Message types
//!
//! - **Request** (client → daemon): start an op, identified by `id`.
//! - **Cancel** (client → daemon): ask the daemon to cancel the op
//!   previously started under `id`. A no-op if that op already completed.
//! - **Ack** (client → daemon): release a pending streaming `Notification`
//!   so the daemon produces the next chunk, the wire-level counterpart of
//!   [`vfs_core::job::Job::ack`].
//! - **Response** (daemon → client): the final, one-shot result of `id`.
//! - **Notification** (daemon → client): one chunk of a streamed op's
//!   output; `is_final` marks the last chunk (no `Response` follows a
//!   streamed op; the final `Notification` stands in for it).
//!
//! Binary data (file contents) uses MsgPack's native `bin` type, not
//! base64: `params`/`result`/`payload` are [`rmpv::Value`] end to end.

use rmpv::Value;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub mod payload;

/// Protocol-layer errors: framing, encoding, or a message that doesn't
/// belong to the peer reading it.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("msgpack encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("msgpack decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("protocol error: {0}")]
    Malformed(String),
    #[error("connection closed")]
    ConnectionClosed,
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Well-known error codes carried in [`ErrorData`], loosely mirroring the
/// [`vfs_core::Error`] taxonomy so a client can reconstruct an equivalent
/// error without sharing a wire-format-specific enum with the daemon.
pub mod error_code {
    pub const NOT_FOUND: i32 = -32000;
    pub const FILE_EXISTS: i32 = -32001;
    pub const IS_DIRECTORY: i32 = -32002;
    pub const NOT_A_DIRECTORY: i32 = -32003;
    pub const DIRECTORY_NOT_EMPTY: i32 = -32004;
    pub const ACCESS_DENIED: i32 = -32005;
    pub const READ_ONLY: i32 = -32006;
    pub const LOGIN_FAILED: i32 = -32007;
    pub const NAME_TOO_LONG: i32 = -32008;
    pub const NO_SPACE: i32 = -32009;
    pub const IO_ERROR: i32 = -32010;
    pub const EOF: i32 = -32011;
    pub const NOT_SUPPORTED: i32 = -32012;
    pub const NOT_SAME_FILESYSTEM: i32 = -32013;
    pub const CANCELLED: i32 = -32014;
    pub const SERVICE_NOT_AVAILABLE: i32 = -32015;
    pub const INVALID_HOSTNAME: i32 = -32016;
    pub const HOST_NOT_FOUND: i32 = -32017;
    pub const BAD_PARAMETERS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
}

/// Error payload inside a [`Response`]/[`Notification`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorData {
    pub code: i32,
    pub message: String,
}

impl From<&vfs_core::Error> for ErrorData {
    fn from(err: &vfs_core::Error) -> Self {
        use vfs_core::Error::*;
        let code = match err {
            NotFound => error_code::NOT_FOUND,
            FileExists => error_code::FILE_EXISTS,
            IsDirectory => error_code::IS_DIRECTORY,
            NotADirectory => error_code::NOT_A_DIRECTORY,
            DirectoryNotEmpty => error_code::DIRECTORY_NOT_EMPTY,
            AccessDenied => error_code::ACCESS_DENIED,
            ReadOnly => error_code::READ_ONLY,
            LoginFailed => error_code::LOGIN_FAILED,
            NameTooLong => error_code::NAME_TOO_LONG,
            NoSpace => error_code::NO_SPACE,
            Io(_) => error_code::IO_ERROR,
            Eof => error_code::EOF,
            NotSupported => error_code::NOT_SUPPORTED,
            NotSameFilesystem => error_code::NOT_SAME_FILESYSTEM,
            Cancelled => error_code::CANCELLED,
            ServiceNotAvailable => error_code::SERVICE_NOT_AVAILABLE,
            InvalidHostname => error_code::INVALID_HOSTNAME,
            HostNotFound => error_code::HOST_NOT_FOUND,
            BadParameters(_) => error_code::BAD_PARAMETERS,
            InvalidUri(_) | InvalidOpenMode | Loop | Interrupted | Internal(_) | Generic(_) => {
                error_code::INTERNAL_ERROR
            }
        };
        ErrorData {
            code,
            message: err.to_string(),
        }
    }
}

impl ErrorData {
    /// Reconstruct an approximate [`vfs_core::Error`] from a received
    /// error code. Lossy by construction: an unrecognised code collapses
    /// to [`vfs_core::Error::Internal`], never panics.
    pub fn to_vfs_error(&self) -> vfs_core::Error {
        use vfs_core::Error;
        match self.code {
            error_code::NOT_FOUND => Error::NotFound,
            error_code::FILE_EXISTS => Error::FileExists,
            error_code::IS_DIRECTORY => Error::IsDirectory,
            error_code::NOT_A_DIRECTORY => Error::NotADirectory,
            error_code::DIRECTORY_NOT_EMPTY => Error::DirectoryNotEmpty,
            error_code::ACCESS_DENIED => Error::AccessDenied,
            error_code::READ_ONLY => Error::ReadOnly,
            error_code::LOGIN_FAILED => Error::LoginFailed,
            error_code::NAME_TOO_LONG => Error::NameTooLong,
            error_code::NO_SPACE => Error::NoSpace,
            error_code::IO_ERROR => Error::Io(std::io::Error::other(self.message.clone())),
            error_code::EOF => Error::Eof,
            error_code::NOT_SUPPORTED => Error::NotSupported,
            error_code::NOT_SAME_FILESYSTEM => Error::NotSameFilesystem,
            error_code::CANCELLED => Error::Cancelled,
            error_code::SERVICE_NOT_AVAILABLE => Error::ServiceNotAvailable,
            error_code::INVALID_HOSTNAME => Error::InvalidHostname,
            error_code::HOST_NOT_FOUND => Error::HostNotFound,
            error_code::BAD_PARAMETERS => Error::BadParameters(self.message.clone()),
            _ => Error::Internal(self.message.clone()),
        }
    }
}

const PROTOCOL_VERSION: &str = "1.0";

/// Request (client → daemon): start an op under `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub version: String,
    pub id: u64,
    pub op: String,
    pub params: Value,
}

impl Request {
    pub fn new(id: u64, op: impl Into<String>, params: Value) -> Self {
        Self {
            version: PROTOCOL_VERSION.into(),
            id,
            op: op.into(),
            params,
        }
    }
}

/// Cancel (client → daemon): cancel the op started under `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cancel {
    pub version: String,
    pub id: u64,
}

impl Cancel {
    pub fn new(id: u64) -> Self {
        Self {
            version: PROTOCOL_VERSION.into(),
            id,
        }
    }
}

/// Ack (client → daemon): release a pending streaming chunk for `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    pub version: String,
    pub id: u64,
}

impl Ack {
    pub fn new(id: u64) -> Self {
        Self {
            version: PROTOCOL_VERSION.into(),
            id,
        }
    }
}

/// Response (daemon → client): the final result of a non-streamed `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub version: String,
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorData>,
}

impl Response {
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            version: PROTOCOL_VERSION.into(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, error: ErrorData) -> Self {
        Self {
            version: PROTOCOL_VERSION.into(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// Notification (daemon → client): one chunk of a streamed op.
///
/// `needs_ack` mirrors [`vfs_core::job::Notification::needs_ack`]: the
/// client must send an [`Ack`] for `id` before the next chunk is produced.
/// `is_final` marks the last chunk; no further `Notification` or
/// `Response` follows it for this `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub version: String,
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorData>,
    pub needs_ack: bool,
    pub is_final: bool,
}

impl Notification {
    pub fn chunk(id: u64, payload: Value, needs_ack: bool, is_final: bool) -> Self {
        Self {
            version: PROTOCOL_VERSION.into(),
            id,
            payload: Some(payload),
            error: None,
            needs_ack,
            is_final,
        }
    }

    pub fn failed(id: u64, error: ErrorData) -> Self {
        Self {
            version: PROTOCOL_VERSION.into(),
            id,
            payload: None,
            error: Some(error),
            needs_ack: false,
            is_final: true,
        }
    }
}

/// Everything the daemon can receive, tagged on the wire by `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ToDaemon {
    Request(Request),
    Cancel(Cancel),
    Ack(Ack),
}

/// Everything the client can receive, tagged on the wire by `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ToClient {
    Response(Response),
    Notification(Notification),
}

const MAX_PAYLOAD_SIZE: u32 = 64 * 1024 * 1024;

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> ProtocolResult<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(ProtocolError::ConnectionClosed);
        }
        Err(e) => return Err(ProtocolError::Io(e)),
    }
    let len = u32::from_be_bytes(len_buf);
    if len == 0 {
        return Err(ProtocolError::Malformed("zero-length payload".into()));
    }
    if len > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::Malformed(format!(
            "payload too large: {len} bytes (max {MAX_PAYLOAD_SIZE})"
        )));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Serialize `msg` with MsgPack, prepend a 4-byte BE length, and write it.
async fn write_frame<W: AsyncWrite + Unpin, T: Serialize>(
    writer: &mut W,
    msg: &T,
) -> ProtocolResult<()> {
    let payload = rmp_serde::to_vec_named(msg)?;
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one message a daemon would receive from a client connection.
pub async fn read_to_daemon<R: AsyncRead + Unpin>(reader: &mut R) -> ProtocolResult<ToDaemon> {
    let buf = read_frame(reader).await?;
    Ok(rmp_serde::from_slice(&buf)?)
}

/// Read one message a client would receive from the daemon.
pub async fn read_to_client<R: AsyncRead + Unpin>(reader: &mut R) -> ProtocolResult<ToClient> {
    let buf = read_frame(reader).await?;
    Ok(rmp_serde::from_slice(&buf)?)
}

pub async fn write_to_daemon<W: AsyncWrite + Unpin>(w: &mut W, msg: &ToDaemon) -> ProtocolResult<()> {
    write_frame(w, msg).await
}

pub async fn write_to_client<W: AsyncWrite + Unpin>(w: &mut W, msg: &ToClient) -> ProtocolResult<()> {
    write_frame(w, msg).await
}
