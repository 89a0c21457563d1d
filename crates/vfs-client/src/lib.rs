//! A [`vfs_core::Backend`] that forwards every call to a running daemon
//! over the wire protocol in [`vfs_protocol`].
//!
//! Every [`vfs_core::Backend`] method is synchronous, so [`ProxyBackend`]
//! keeps its own small Tokio runtime and blocks on it per call, the same
//! bridging pattern `vfs-backend-ssh` uses: the job engine already runs
//! each call on its own worker thread, so blocking here never stalls an
//! unrelated job. The runtime keeps one I/O thread of its own so that a
//! cancel issued from another thread can still reach the wire while a
//! call is blocked mid-round-trip.
//!
//! A remote file or directory handle is represented locally as a
//! [`ProxyHandle`] carrying the daemon's opaque handle id; directory
//! listings are pulled from the daemon in chunks (the wire's streaming
//! `Notification`s) and served out of a local buffer one [`FileInfo`] at a
//! time, matching [`vfs_core::Backend::read_directory`]'s one-entry
//! contract.

pub mod connection;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use rmpv::Value;
use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter};
use vfs_core::{
    Backend, Error, FileInfo, FileInfoPatch, FindDirectoryKind, Handle, InfoOptions, OpenMode,
    OperationContext, Result, SeekOrigin, SetInfoMask,
};
use vfs_protocol::payload::{
    file_info_from_value, file_info_patch_to_value, find_directory_kind_to_str, get_bool, get_str,
    get_u64, info_options_to_value, make_params, open_mode_to_str, seek_origin_to_str,
    set_info_mask_to_value, val_bin, val_bool, val_str, val_u64,
};
use vfs_uri::Uri;

use connection::DaemonConnection;

/// A remote handle: either a plain file/byte-stream handle, or a
/// directory listing with its own local read-ahead buffer.
enum ProxyHandle {
    File(u64),
    Directory {
        id: u64,
        buffer: SyncMutex<VecDeque<FileInfo>>,
        eof: AtomicBool,
    },
}

fn as_map(value: &Value) -> Result<&[(Value, Value)]> {
    value
        .as_map()
        .map(|v| v.as_slice())
        .ok_or_else(|| Error::Internal("expected a msgpack map in daemon response".into()))
}

/// A [`Backend`] that proxies every call through a [`DaemonConnection`].
///
/// Every call is armed for cancellation before it is sent: the op's
/// [`vfs_core::CancellationToken`] gets a callback that writes a wire-level
/// `Cancel` for the call's id, so a cancel issued on the job while the
/// worker thread is blocked in the remote round trip reaches the daemon
/// instead of only flipping a local flag. One call is outstanding per
/// worker thread at a time, which is what makes registering that callback
/// race-free.
pub struct ProxyBackend<R, W> {
    runtime: tokio::runtime::Runtime,
    conn: Arc<DaemonConnection<R, W>>,
}

fn client_runtime() -> Result<tokio::runtime::Runtime> {
    // One dedicated I/O thread: lets the cancel path make progress on the
    // shared connection while a worker thread is blocked in its own call.
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .map_err(|e| Error::Internal(format!("failed to start client runtime: {e}")))
}

pub type UnixProxyBackend =
    ProxyBackend<BufReader<tokio::net::unix::OwnedReadHalf>, BufWriter<tokio::net::unix::OwnedWriteHalf>>;
pub type TcpProxyBackend =
    ProxyBackend<BufReader<tokio::net::tcp::OwnedReadHalf>, BufWriter<tokio::net::tcp::OwnedWriteHalf>>;

impl UnixProxyBackend {
    /// Connect to a daemon listening on the Unix socket at `path`.
    pub fn connect(path: &str) -> Result<Self> {
        let runtime = client_runtime()?;
        let conn = runtime
            .block_on(connection::connect_unix(path))
            .map_err(|e| Error::Internal(format!("connecting to daemon at unix:{path} failed: {e}")))?;
        Ok(Self { runtime, conn: Arc::new(conn) })
    }
}

impl TcpProxyBackend {
    /// Connect to a daemon listening on `addr`.
    pub fn connect(addr: std::net::SocketAddr) -> Result<Self> {
        let runtime = client_runtime()?;
        let conn = runtime
            .block_on(connection::connect_tcp(addr))
            .map_err(|e| Error::Internal(format!("connecting to daemon at tcp:{addr} failed: {e}")))?;
        Ok(Self { runtime, conn: Arc::new(conn) })
    }
}

impl<R, W> ProxyBackend<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Build a proxy backend directly from an already-connected
    /// [`DaemonConnection`], used by tests and by callers with their own
    /// transport setup.
    pub fn from_connection(runtime: tokio::runtime::Runtime, conn: DaemonConnection<R, W>) -> Self {
        Self { runtime, conn: Arc::new(conn) }
    }

    /// Register a wire-level `Cancel` for `id` on the op's token, then
    /// bail out early if the token had already fired before registration.
    fn arm_cancel(&self, ctx: &OperationContext, id: u64) -> Result<()> {
        let conn = self.conn.clone();
        let handle = self.runtime.handle().clone();
        ctx.token().on_cancel(move || {
            let _ = handle.block_on(conn.cancel(id));
        });
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    fn call(&self, op: &str, params: Value, ctx: &OperationContext) -> Result<Value> {
        let id = self.conn.alloc_id();
        self.arm_cancel(ctx, id)?;
        self.runtime
            .block_on(self.conn.call_with_id(id, op, params))
            .map_err(Error::from)
    }

    /// Liveness probe. Also what keeps an otherwise idle connection inside
    /// the daemon's idle window; long-lived callers should send one every
    /// few minutes when no other traffic is flowing.
    pub fn ping(&self) -> Result<()> {
        self.runtime
            .block_on(self.conn.call("ping", Value::Map(Vec::new())))
            .map(|_| ())
            .map_err(Error::from)
    }

    fn handle_id(handle: &Handle) -> Result<u64> {
        match handle.downcast_ref::<ProxyHandle>() {
            Some(ProxyHandle::File(id)) => Ok(*id),
            Some(ProxyHandle::Directory { .. }) => {
                Err(Error::BadParameters("expected a file handle, got a directory handle".into()))
            }
            None => Err(Error::BadParameters("not a proxy handle".into())),
        }
    }

    fn fetch_chunk(&self, id: u64, ack_previous: bool) -> Result<(Vec<FileInfo>, bool)> {
        let (raw, eof) = self
            .runtime
            .block_on(self.conn.next_chunk(id, ack_previous))
            .map_err(Error::from)?;
        let entries = raw
            .iter()
            .map(file_info_from_value)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Internal(e.to_string()))?;
        Ok((entries, eof))
    }
}

impl<R, W> Backend for ProxyBackend<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    fn open(&self, uri: &Uri, mode: OpenMode, ctx: &OperationContext) -> Result<Handle> {
        let params = make_params(vec![
            ("uri", val_str(&uri.to_string())),
            ("mode", val_str(open_mode_to_str(mode))),
        ]);
        let result = self.call("open", params, ctx)?;
        let map = as_map(&result)?;
        let id = get_u64(map, "handle")
            .ok_or_else(|| Error::Internal("open: missing 'handle' field".into()))?;
        Ok(Handle::new(ProxyHandle::File(id)))
    }

    fn create(
        &self,
        uri: &Uri,
        mode: OpenMode,
        exclusive: bool,
        permissions: u32,
        ctx: &OperationContext,
    ) -> Result<Handle> {
        let params = make_params(vec![
            ("uri", val_str(&uri.to_string())),
            ("mode", val_str(open_mode_to_str(mode))),
            ("exclusive", val_bool(exclusive)),
            ("permissions", val_u64(permissions as u64)),
        ]);
        let result = self.call("create", params, ctx)?;
        let map = as_map(&result)?;
        let id = get_u64(map, "handle")
            .ok_or_else(|| Error::Internal("create: missing 'handle' field".into()))?;
        Ok(Handle::new(ProxyHandle::File(id)))
    }

    fn close(&self, handle: &Handle, ctx: &OperationContext) -> Result<()> {
        let id = Self::handle_id(handle)?;
        self.call("close", make_params(vec![("handle", val_u64(id))]), ctx)?;
        Ok(())
    }

    fn read(&self, handle: &Handle, buf: &mut [u8], ctx: &OperationContext) -> Result<usize> {
        let id = Self::handle_id(handle)?;
        let params = make_params(vec![("handle", val_u64(id)), ("len", val_u64(buf.len() as u64))]);
        let result = self.call("read", params, ctx)?;
        let map = as_map(&result)?;
        let data = vfs_protocol::payload::get_bin(map, "data")
            .ok_or_else(|| Error::Internal("read: missing 'data' field".into()))?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    fn write(&self, handle: &Handle, buf: &[u8], ctx: &OperationContext) -> Result<usize> {
        let id = Self::handle_id(handle)?;
        let params = make_params(vec![("handle", val_u64(id)), ("data", val_bin(buf))]);
        let result = self.call("write", params, ctx)?;
        let map = as_map(&result)?;
        get_u64(map, "written")
            .map(|n| n as usize)
            .ok_or_else(|| Error::Internal("write: missing 'written' field".into()))
    }

    fn seek(&self, handle: &Handle, origin: SeekOrigin, offset: i64, ctx: &OperationContext) -> Result<()> {
        let id = Self::handle_id(handle)?;
        let params = make_params(vec![
            ("handle", val_u64(id)),
            ("origin", val_str(seek_origin_to_str(origin))),
            ("offset", Value::Integer(offset.into())),
        ]);
        self.call("seek", params, ctx)?;
        Ok(())
    }

    fn tell(&self, handle: &Handle, ctx: &OperationContext) -> Result<u64> {
        let id = Self::handle_id(handle)?;
        let result = self.call("tell", make_params(vec![("handle", val_u64(id))]), ctx)?;
        let map = as_map(&result)?;
        get_u64(map, "offset").ok_or_else(|| Error::Internal("tell: missing 'offset' field".into()))
    }

    fn truncate_handle(&self, handle: &Handle, size: u64, ctx: &OperationContext) -> Result<()> {
        let id = Self::handle_id(handle)?;
        let params = make_params(vec![("handle", val_u64(id)), ("size", val_u64(size))]);
        self.call("truncate_handle", params, ctx)?;
        Ok(())
    }

    fn truncate_uri(&self, uri: &Uri, size: u64, ctx: &OperationContext) -> Result<()> {
        let params = make_params(vec![("uri", val_str(&uri.to_string())), ("size", val_u64(size))]);
        self.call("truncate_uri", params, ctx)?;
        Ok(())
    }

    fn open_directory(&self, uri: &Uri, options: InfoOptions, ctx: &OperationContext) -> Result<Handle> {
        let id = self
            .runtime
            .block_on(self.conn.start_listing(&uri.to_string(), info_options_to_value(options)))
            .map_err(Error::from)?;
        self.arm_cancel(ctx, id)?;
        let (entries, eof) = self.fetch_chunk(id, false)?;
        Ok(Handle::new(ProxyHandle::Directory {
            id,
            buffer: SyncMutex::new(entries.into()),
            eof: AtomicBool::new(eof),
        }))
    }

    fn close_directory(&self, handle: &Handle, _ctx: &OperationContext) -> Result<()> {
        if let Some(ProxyHandle::Directory { id, eof, .. }) = handle.downcast_ref::<ProxyHandle>() {
            if !eof.load(Ordering::SeqCst) {
                let _ = self.runtime.block_on(self.conn.cancel(*id));
            }
        }
        Ok(())
    }

    fn read_directory(&self, handle: &Handle, ctx: &OperationContext) -> Result<FileInfo> {
        let Some(ProxyHandle::Directory { id, buffer, eof }) = handle.downcast_ref::<ProxyHandle>() else {
            return Err(Error::BadParameters("not a proxy directory handle".into()));
        };

        if let Some(info) = buffer.lock().pop_front() {
            return Ok(info);
        }
        if eof.load(Ordering::SeqCst) {
            return Err(Error::Eof);
        }
        if ctx.is_cancelled() {
            let _ = self.runtime.block_on(self.conn.cancel(*id));
            return Err(Error::Cancelled);
        }

        self.arm_cancel(ctx, *id)?;
        let (mut entries, hit_eof) = self.fetch_chunk(*id, true)?;
        eof.store(hit_eof, Ordering::SeqCst);
        if entries.is_empty() {
            return Err(Error::Eof);
        }
        let first = entries.remove(0);
        buffer.lock().extend(entries);
        Ok(first)
    }

    fn get_file_info(&self, uri: &Uri, options: InfoOptions, ctx: &OperationContext) -> Result<FileInfo> {
        let params = make_params(vec![
            ("uri", val_str(&uri.to_string())),
            ("options", info_options_to_value(options)),
        ]);
        let result = self.call("get_file_info", params, ctx)?;
        file_info_from_value(&result).map_err(|e| Error::Internal(e.to_string()))
    }

    fn get_file_info_from_handle(&self, handle: &Handle, options: InfoOptions, ctx: &OperationContext) -> Result<FileInfo> {
        let id = Self::handle_id(handle)?;
        let params = make_params(vec![("handle", val_u64(id)), ("options", info_options_to_value(options))]);
        let result = self.call("get_file_info_from_handle", params, ctx)?;
        file_info_from_value(&result).map_err(|e| Error::Internal(e.to_string()))
    }

    fn make_directory(&self, uri: &Uri, permissions: u32, ctx: &OperationContext) -> Result<()> {
        let params = make_params(vec![
            ("uri", val_str(&uri.to_string())),
            ("permissions", val_u64(permissions as u64)),
        ]);
        self.call("make_directory", params, ctx)?;
        Ok(())
    }

    fn remove_directory(&self, uri: &Uri, ctx: &OperationContext) -> Result<()> {
        self.call("remove_directory", make_params(vec![("uri", val_str(&uri.to_string()))]), ctx)?;
        Ok(())
    }

    fn move_(&self, src: &Uri, dst: &Uri, force_replace: bool, ctx: &OperationContext) -> Result<()> {
        let params = make_params(vec![
            ("src", val_str(&src.to_string())),
            ("dst", val_str(&dst.to_string())),
            ("force_replace", val_bool(force_replace)),
        ]);
        self.call("move", params, ctx)?;
        Ok(())
    }

    fn unlink(&self, uri: &Uri, ctx: &OperationContext) -> Result<()> {
        self.call("unlink", make_params(vec![("uri", val_str(&uri.to_string()))]), ctx)?;
        Ok(())
    }

    fn check_same_fs(&self, a: &Uri, b: &Uri, ctx: &OperationContext) -> Result<bool> {
        let params = make_params(vec![("a", val_str(&a.to_string())), ("b", val_str(&b.to_string()))]);
        let result = self.call("check_same_fs", params, ctx)?;
        let map = as_map(&result)?;
        Ok(get_bool(map, "same").unwrap_or(false))
    }

    fn set_file_info(&self, uri: &Uri, patch: &FileInfoPatch, mask: SetInfoMask, ctx: &OperationContext) -> Result<()> {
        let params = make_params(vec![
            ("uri", val_str(&uri.to_string())),
            ("patch", file_info_patch_to_value(patch)),
            ("mask", set_info_mask_to_value(mask)),
        ]);
        self.call("set_file_info", params, ctx)?;
        Ok(())
    }

    fn find_directory(
        &self,
        near: &Uri,
        kind: FindDirectoryKind,
        create_if_missing: bool,
        find_if_missing: bool,
        permissions: u32,
        ctx: &OperationContext,
    ) -> Result<Uri> {
        let params = make_params(vec![
            ("near", val_str(&near.to_string())),
            ("kind", val_str(find_directory_kind_to_str(kind))),
            ("create_if_missing", val_bool(create_if_missing)),
            ("find_if_missing", val_bool(find_if_missing)),
            ("permissions", val_u64(permissions as u64)),
        ]);
        let result = self.call("find_directory", params, ctx)?;
        let map = as_map(&result)?;
        let uri_text = get_str(map, "uri")
            .ok_or_else(|| Error::Internal("find_directory: missing 'uri' field".into()))?;
        Uri::parse(uri_text).map_err(Error::from)
    }

    fn create_symlink(&self, uri: &Uri, target: &str, ctx: &OperationContext) -> Result<()> {
        let params = make_params(vec![("uri", val_str(&uri.to_string())), ("target", val_str(target))]);
        self.call("create_symlink", params, ctx)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vfs_core::FileKind;
    use vfs_protocol::{Notification, Response, ToClient, write_to_client};

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap()
    }

    fn ctx() -> OperationContext {
        OperationContext::new(vfs_core::CancellationToken::new())
    }

    fn backend_with_scripted_replies(
        messages: Vec<ToClient>,
    ) -> ProxyBackend<std::io::Cursor<Vec<u8>>, Vec<u8>> {
        let rt = runtime();
        let mut bytes = Vec::new();
        rt.block_on(async {
            for msg in &messages {
                write_to_client(&mut bytes, msg).await.unwrap();
            }
        });
        let conn = DaemonConnection::new(std::io::Cursor::new(bytes), Vec::new());
        ProxyBackend::from_connection(rt, conn)
    }

    #[test]
    fn open_decodes_handle_id() {
        let backend = backend_with_scripted_replies(vec![ToClient::Response(Response::ok(
            1,
            make_params(vec![("handle", val_u64(7))]),
        ))]);
        let handle = backend
            .open(&Uri::parse("ftp://host/a.txt").unwrap(), OpenMode::Read, &ctx())
            .unwrap();
        assert_eq!(ProxyBackend::<std::io::Cursor<Vec<u8>>, Vec<u8>>::handle_id(&handle).unwrap(), 7);
    }

    #[test]
    fn get_file_info_decodes_result() {
        let info = FileInfo::bare("a.txt", FileKind::Regular);
        let value = vfs_protocol::payload::file_info_to_value(&info);
        let backend = backend_with_scripted_replies(vec![ToClient::Response(Response::ok(1, value))]);
        let result = backend
            .get_file_info(&Uri::parse("ftp://host/a.txt").unwrap(), InfoOptions::default(), &ctx())
            .unwrap();
        assert_eq!(result.name, "a.txt");
    }

    #[test]
    fn remote_not_found_maps_to_vfs_error() {
        let backend = backend_with_scripted_replies(vec![ToClient::Response(Response::err(
            1,
            vfs_protocol::ErrorData::from(&Error::NotFound),
        ))]);
        let err = backend
            .get_file_info(&Uri::parse("ftp://host/missing").unwrap(), InfoOptions::default(), &ctx())
            .unwrap_err();
        assert!(matches!(err, Error::NotFound));
    }

    #[test]
    fn directory_listing_drains_across_chunks() {
        let chunk1 = ToClient::Notification(Notification::chunk(
            1,
            Value::Array(vec![vfs_protocol::payload::file_info_to_value(&FileInfo::bare(
                "a",
                FileKind::Regular,
            ))]),
            true,
            false,
        ));
        let chunk2 = ToClient::Notification(Notification::chunk(
            1,
            Value::Array(vec![vfs_protocol::payload::file_info_to_value(&FileInfo::bare(
                "b",
                FileKind::Regular,
            ))]),
            false,
            true,
        ));
        let backend = backend_with_scripted_replies(vec![chunk1, chunk2]);
        let handle = backend
            .open_directory(&Uri::parse("ftp://host/dir").unwrap(), InfoOptions::default(), &ctx())
            .unwrap();
        let first = backend.read_directory(&handle, &ctx()).unwrap();
        let second = backend.read_directory(&handle, &ctx()).unwrap();
        let eof = backend.read_directory(&handle, &ctx()).unwrap_err();
        assert_eq!(first.name, "a");
        assert_eq!(second.name, "b");
        assert!(matches!(eof, Error::Eof));
    }

    #[test]
    fn wrong_handle_kind_is_bad_parameters() {
        let backend = backend_with_scripted_replies(vec![]);
        let dir_handle = Handle::new(ProxyHandle::Directory {
            id: 1,
            buffer: SyncMutex::new(VecDeque::new()),
            eof: AtomicBool::new(true),
        });
        let err = backend.close(&dir_handle, &ctx()).unwrap_err();
        assert!(matches!(err, Error::BadParameters(_)));
    }
}
