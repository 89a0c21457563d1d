//! Async connection to a running daemon: request/response correlation and
//! chunked directory-listing consumption, built directly on
//! `vfs-protocol`'s framed MsgPack messages.
//!
//! The reader and writer halves sit behind their own [`tokio::sync::Mutex`].
//! Callers are identified by call id: whoever holds the reader lock reads
//! frames off the wire, keeps those addressed to it, and stashes frames
//! for other ids so a concurrent caller (another job's worker thread, or
//! an in-progress directory stream) never loses a message to an unrelated
//! read loop.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rmpv::Value;
use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter};
use tokio::sync::Mutex;

use vfs_protocol::{
    Ack, Cancel, ErrorData, ProtocolError, ProtocolResult, Request, ToClient, ToDaemon,
    read_to_client, write_to_daemon,
};

/// Everything that can go wrong making a call through a [`DaemonConnection`]:
/// either the wire itself failed, or the daemon reported an operation
/// error (which carries enough information to reconstruct a
/// [`vfs_core::Error`]).
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("remote error: {}", .0.message)]
    Remote(ErrorData),
}

impl From<ClientError> for vfs_core::Error {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Remote(data) => data.to_vfs_error(),
            ClientError::Protocol(e) => {
                tracing::warn!(error = %e, "daemon protocol error");
                vfs_core::Error::Internal(e.to_string())
            }
        }
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Default timeout for establishing a connection to the daemon.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct DaemonConnection<R, W> {
    reader: Mutex<R>,
    writer: Mutex<W>,
    /// Frames read while waiting for a different id, keyed by the id they
    /// belong to. Whoever is waiting for that id drains them later.
    stash: Mutex<HashMap<u64, VecDeque<ToClient>>>,
    next_id: AtomicU64,
}

impl<R, W> DaemonConnection<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            stash: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    async fn take_stashed(&self, id: u64) -> Option<ToClient> {
        let mut stash = self.stash.lock().await;
        let queue = stash.get_mut(&id)?;
        let msg = queue.pop_front();
        if queue.is_empty() {
            stash.remove(&id);
        }
        msg
    }

    /// Return the next frame addressed to `id`, parking frames for other
    /// ids in the stash so concurrent callers on the same connection never
    /// lose each other's messages.
    async fn recv_for(&self, id: u64) -> ProtocolResult<ToClient> {
        if let Some(msg) = self.take_stashed(id).await {
            return Ok(msg);
        }
        let mut reader = self.reader.lock().await;
        // A caller that held the reader lock before us may have stashed
        // our frame while we waited for it.
        if let Some(msg) = self.take_stashed(id).await {
            return Ok(msg);
        }
        loop {
            let msg = read_to_client(&mut *reader).await?;
            let msg_id = match &msg {
                ToClient::Response(r) => r.id,
                ToClient::Notification(n) => n.id,
            };
            if msg_id == id {
                return Ok(msg);
            }
            self.stash.lock().await.entry(msg_id).or_default().push_back(msg);
        }
    }

    /// Allocate a fresh call id. Exposed so a caller can learn the id
    /// before the call is in flight; the cancellation path needs it.
    pub fn alloc_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Send a non-streaming request and wait for its matching response.
    /// Responses and notifications for other ids are stray leftovers from
    /// a cancelled stream and are skipped.
    pub async fn call(&self, op: &str, params: Value) -> ClientResult<Value> {
        let id = self.alloc_id();
        self.call_with_id(id, op, params).await
    }

    /// Like [`Self::call`], but under a caller-allocated id.
    pub async fn call_with_id(&self, id: u64, op: &str, params: Value) -> ClientResult<Value> {
        {
            let mut writer = self.writer.lock().await;
            write_to_daemon(&mut *writer, &ToDaemon::Request(Request::new(id, op, params))).await?;
        }

        loop {
            match self.recv_for(id).await? {
                ToClient::Response(resp) => {
                    return match resp.error {
                        Some(err) => Err(ClientError::Remote(err)),
                        None => Ok(resp.result.unwrap_or(Value::Nil)),
                    };
                }
                // A stray notification under our id is a leftover from a
                // cancelled stream that reused it; skip it.
                ToClient::Notification(_) => continue,
            }
        }
    }

    /// Start a streaming directory listing under a fresh id; the daemon
    /// begins producing [`vfs_protocol::Notification`] chunks for it.
    pub async fn start_listing(&self, uri_text: &str, options: Value) -> ClientResult<u64> {
        let id = self.alloc_id();
        let params = vfs_protocol::payload::make_params(vec![
            ("uri", vfs_protocol::payload::val_str(uri_text)),
            ("options", options),
        ]);
        let mut writer = self.writer.lock().await;
        write_to_daemon(
            &mut *writer,
            &ToDaemon::Request(Request::new(id, "list_directory", params)),
        )
        .await?;
        Ok(id)
    }

    /// Consume the next chunk of a listing started with [`Self::start_listing`].
    /// Pass `ack_previous = false` only for the very first chunk.
    pub async fn next_chunk(&self, id: u64, ack_previous: bool) -> ClientResult<(Vec<Value>, bool)> {
        if ack_previous {
            let mut writer = self.writer.lock().await;
            write_to_daemon(&mut *writer, &ToDaemon::Ack(Ack::new(id))).await?;
        }

        loop {
            match self.recv_for(id).await? {
                ToClient::Notification(n) => {
                    if let Some(err) = n.error {
                        return Err(ClientError::Remote(err));
                    }
                    let entries = match n.payload {
                        Some(Value::Array(items)) => items,
                        _ => Vec::new(),
                    };
                    return Ok((entries, n.is_final));
                }
                ToClient::Response(_) => continue,
            }
        }
    }

    /// Ask the daemon to cancel the op started under `id`. Fire-and-forget:
    /// a no-op on the daemon side if that op already finished. Any final
    /// notification the daemon still sends for `id` is skipped by the next
    /// `call`/`next_chunk` as a stray frame.
    pub async fn cancel(&self, id: u64) -> ProtocolResult<()> {
        let mut writer = self.writer.lock().await;
        write_to_daemon(&mut *writer, &ToDaemon::Cancel(Cancel::new(id))).await
    }
}

/// Buffered wrapper used by every constructor below.
pub type BufferedConnection<R, W> = DaemonConnection<BufReader<R>, BufWriter<W>>;

#[cfg(unix)]
pub type UnixConnection =
    BufferedConnection<tokio::net::unix::OwnedReadHalf, tokio::net::unix::OwnedWriteHalf>;

pub type TcpConnection =
    BufferedConnection<tokio::net::tcp::OwnedReadHalf, tokio::net::tcp::OwnedWriteHalf>;

/// Connect to a daemon listening on a Unix domain socket.
#[cfg(unix)]
pub async fn connect_unix(path: &str) -> std::io::Result<UnixConnection> {
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, tokio::net::UnixStream::connect(path))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))??;
    let (read_half, write_half) = stream.into_split();
    Ok(DaemonConnection::new(
        BufReader::new(read_half),
        BufWriter::new(write_half),
    ))
}

/// Connect to a daemon listening on a TCP address.
pub async fn connect_tcp(addr: std::net::SocketAddr) -> std::io::Result<TcpConnection> {
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, tokio::net::TcpStream::connect(addr))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))??;
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    Ok(DaemonConnection::new(
        BufReader::new(read_half),
        BufWriter::new(write_half),
    ))
}
