//! Translates a wire [`vfs_protocol::Request`] into a [`vfs_core::job::OpRequest`]
//! against a [`ClientSession`], and the resulting [`vfs_core::job::OpResponse`]
//! back into a wire [`Value`].
//!
//! One match arm per op, structured as a flat method dispatch table keyed
//! on the op name. `list_directory` is handled separately by
//! [`decode_listing_request`]/[`encode_listing_chunk`] since it streams
//! rather than returning a single result.

use rmpv::Value;
use vfs_core::job::{OpRequest, OpResponse};
use vfs_core::{Error, Result};
use vfs_protocol::payload::{
    file_info_patch_from_value, file_info_to_value, find_directory_kind_from_str,
    get_bin, get_bool, get_i64, get_str, get_u64, info_options_from_value, make_params, open_mode_from_str,
    seek_origin_from_str, set_info_mask_from_value, val_bin, val_bool, val_str, val_u64,
};
use vfs_uri::Uri;

use crate::session::ClientSession;

fn as_map(value: &Value) -> Result<&[(Value, Value)]> {
    value
        .as_map()
        .map(|v| v.as_slice())
        .ok_or_else(|| Error::BadParameters("expected a msgpack map".into()))
}

fn required_str<'a>(map: &'a [(Value, Value)], key: &str) -> Result<&'a str> {
    get_str(map, key).ok_or_else(|| Error::BadParameters(format!("missing field '{key}'")))
}

fn required_u64(map: &[(Value, Value)], key: &str) -> Result<u64> {
    get_u64(map, key).ok_or_else(|| Error::BadParameters(format!("missing field '{key}'")))
}

fn required_uri(map: &[(Value, Value)], key: &str) -> Result<Uri> {
    Uri::parse(required_str(map, key)?).map_err(Error::from)
}

fn wire_err(e: vfs_protocol::ProtocolError) -> Error {
    Error::BadParameters(e.to_string())
}

/// Dispatch every op except `list_directory`, which streams and is handled
/// by [`crate::handle_listing`] instead.
pub async fn dispatch_call(session: &ClientSession, wire_id: u64, op: &str, params: &Value) -> Result<Value> {
    let map = as_map(params)?;

    match op {
        "ping" => Ok(make_params(vec![
            ("status", val_str("ok")),
            ("pid", val_u64(std::process::id() as u64)),
        ])),

        "open" => {
            let uri = required_uri(map, "uri")?;
            let mode = open_mode_from_str(required_str(map, "mode")?).map_err(wire_err)?;
            let scheme = session.scheme_of(&uri);
            let response = session.call(wire_id, &scheme, OpRequest::Open { uri, mode }).await?;
            let OpResponse::Opened(handle) = response else {
                unreachable!("Open always yields OpResponse::Opened on success")
            };
            let id = session.store_handle(&scheme, handle).await;
            Ok(make_params(vec![("handle", val_u64(id))]))
        }

        "create" => {
            let uri = required_uri(map, "uri")?;
            let mode = open_mode_from_str(required_str(map, "mode")?).map_err(wire_err)?;
            let exclusive = get_bool(map, "exclusive").unwrap_or(false);
            let permissions = required_u64(map, "permissions")? as u32;
            let scheme = session.scheme_of(&uri);
            let response = session
                .call(wire_id, &scheme, OpRequest::Create { uri, mode, exclusive, permissions })
                .await?;
            let OpResponse::Opened(handle) = response else {
                unreachable!("Create always yields OpResponse::Opened on success")
            };
            let id = session.store_handle(&scheme, handle).await;
            Ok(make_params(vec![("handle", val_u64(id))]))
        }

        "close" => {
            let id = required_u64(map, "handle")?;
            let (scheme, handle) = session.handle(id).await?;
            session.call(wire_id, &scheme, OpRequest::Close { handle }).await?;
            session.forget_handle(id).await;
            Ok(Value::Nil)
        }

        "read" => {
            let id = required_u64(map, "handle")?;
            let len = required_u64(map, "len")? as usize;
            let (scheme, handle) = session.handle(id).await?;
            let response = session.call(wire_id, &scheme, OpRequest::Read { handle, len }).await?;
            let OpResponse::Read(data) = response else {
                unreachable!("Read always yields OpResponse::Read on success")
            };
            Ok(make_params(vec![("data", val_bin(&data))]))
        }

        "write" => {
            let id = required_u64(map, "handle")?;
            let data = get_bin(map, "data")
                .ok_or_else(|| Error::BadParameters("missing field 'data'".into()))?
                .to_vec();
            let (scheme, handle) = session.handle(id).await?;
            let response = session.call(wire_id, &scheme, OpRequest::Write { handle, data }).await?;
            let OpResponse::Written(n) = response else {
                unreachable!("Write always yields OpResponse::Written on success")
            };
            Ok(make_params(vec![("written", val_u64(n as u64))]))
        }

        "seek" => {
            let id = required_u64(map, "handle")?;
            let origin = seek_origin_from_str(required_str(map, "origin")?).map_err(wire_err)?;
            let offset = get_i64(map, "offset").unwrap_or(0);
            let (scheme, handle) = session.handle(id).await?;
            session
                .call(wire_id, &scheme, OpRequest::Seek { handle, origin, offset })
                .await?;
            Ok(Value::Nil)
        }

        "tell" => {
            let id = required_u64(map, "handle")?;
            let (scheme, handle) = session.handle(id).await?;
            let response = session.call(wire_id, &scheme, OpRequest::Tell { handle }).await?;
            let OpResponse::Told(offset) = response else {
                unreachable!("Tell always yields OpResponse::Told on success")
            };
            Ok(make_params(vec![("offset", val_u64(offset))]))
        }

        "truncate_handle" => {
            let id = required_u64(map, "handle")?;
            let size = required_u64(map, "size")?;
            let (scheme, handle) = session.handle(id).await?;
            session
                .call(wire_id, &scheme, OpRequest::TruncateHandle { handle, size })
                .await?;
            Ok(Value::Nil)
        }

        "truncate_uri" => {
            let uri = required_uri(map, "uri")?;
            let size = required_u64(map, "size")?;
            let scheme = session.scheme_of(&uri);
            session
                .call(wire_id, &scheme, OpRequest::TruncateUri { uri, size })
                .await?;
            Ok(Value::Nil)
        }

        "get_file_info" => {
            let uri = required_uri(map, "uri")?;
            let options = info_options_from_value(
                map.iter()
                    .find(|(k, _)| k.as_str() == Some("options"))
                    .map(|(_, v)| v)
                    .unwrap_or(&Value::Nil),
            )
            .unwrap_or_default();
            let scheme = session.scheme_of(&uri);
            let response = session.call(wire_id, &scheme, OpRequest::GetFileInfo { uri, options }).await?;
            let OpResponse::FileInfo(info) = response else {
                unreachable!("GetFileInfo always yields OpResponse::FileInfo on success")
            };
            Ok(file_info_to_value(&info))
        }

        "get_file_info_from_handle" => {
            let id = required_u64(map, "handle")?;
            let options = info_options_from_value(
                map.iter()
                    .find(|(k, _)| k.as_str() == Some("options"))
                    .map(|(_, v)| v)
                    .unwrap_or(&Value::Nil),
            )
            .unwrap_or_default();
            let (scheme, handle) = session.handle(id).await?;
            let response = session
                .call(wire_id, &scheme, OpRequest::GetFileInfoFromHandle { handle, options })
                .await?;
            let OpResponse::FileInfo(info) = response else {
                unreachable!("GetFileInfoFromHandle always yields OpResponse::FileInfo on success")
            };
            Ok(file_info_to_value(&info))
        }

        "make_directory" => {
            let uri = required_uri(map, "uri")?;
            let permissions = required_u64(map, "permissions")? as u32;
            let scheme = session.scheme_of(&uri);
            session
                .call(wire_id, &scheme, OpRequest::MakeDirectory { uri, permissions })
                .await?;
            Ok(Value::Nil)
        }

        "remove_directory" => {
            let uri = required_uri(map, "uri")?;
            let scheme = session.scheme_of(&uri);
            session.call(wire_id, &scheme, OpRequest::RemoveDirectory { uri }).await?;
            Ok(Value::Nil)
        }

        "move" => {
            let src = required_uri(map, "src")?;
            let dst = required_uri(map, "dst")?;
            let force_replace = get_bool(map, "force_replace").unwrap_or(false);
            let scheme = session.scheme_of(&src);
            session
                .call(wire_id, &scheme, OpRequest::Move { src, dst, force_replace })
                .await?;
            Ok(Value::Nil)
        }

        "unlink" => {
            let uri = required_uri(map, "uri")?;
            let scheme = session.scheme_of(&uri);
            session.call(wire_id, &scheme, OpRequest::Unlink { uri }).await?;
            Ok(Value::Nil)
        }

        "check_same_fs" => {
            let a = required_uri(map, "a")?;
            let b = required_uri(map, "b")?;
            let scheme = session.scheme_of(&a);
            let response = session.call(wire_id, &scheme, OpRequest::CheckSameFs { a, b }).await?;
            let OpResponse::SameFilesystem(same) = response else {
                unreachable!("CheckSameFs always yields OpResponse::SameFilesystem on success")
            };
            Ok(make_params(vec![("same", val_bool(same))]))
        }

        "set_file_info" => {
            let uri = required_uri(map, "uri")?;
            let patch = file_info_patch_from_value(
                map.iter().find(|(k, _)| k.as_str() == Some("patch")).map(|(_, v)| v).unwrap_or(&Value::Nil),
            )
            .map_err(wire_err)?;
            let mask = set_info_mask_from_value(
                map.iter().find(|(k, _)| k.as_str() == Some("mask")).map(|(_, v)| v).unwrap_or(&Value::Nil),
            )
            .map_err(wire_err)?;
            let scheme = session.scheme_of(&uri);
            session
                .call(wire_id, &scheme, OpRequest::SetFileInfo { uri, patch, mask })
                .await?;
            Ok(Value::Nil)
        }

        "find_directory" => {
            let near = required_uri(map, "near")?;
            let kind = find_directory_kind_from_str(required_str(map, "kind")?).map_err(wire_err)?;
            let create_if_missing = get_bool(map, "create_if_missing").unwrap_or(false);
            let find_if_missing = get_bool(map, "find_if_missing").unwrap_or(false);
            let permissions = get_u64(map, "permissions").unwrap_or(0) as u32;
            let scheme = session.scheme_of(&near);
            let response = session
                .call(
                    wire_id,
                    &scheme,
                    OpRequest::FindDirectory { near, kind, create_if_missing, find_if_missing, permissions },
                )
                .await?;
            let OpResponse::FoundDirectory(uri) = response else {
                unreachable!("FindDirectory always yields OpResponse::FoundDirectory on success")
            };
            Ok(make_params(vec![("uri", val_str(&uri.to_string()))]))
        }

        "create_symlink" => {
            let uri = required_uri(map, "uri")?;
            let target = required_str(map, "target")?.to_string();
            let scheme = session.scheme_of(&uri);
            session
                .call(wire_id, &scheme, OpRequest::CreateSymlink { uri, target })
                .await?;
            Ok(Value::Nil)
        }

        other => Err(Error::BadParameters(format!("unknown op '{other}'"))),
    }
}

/// Decode a `list_directory` request's `uri`/`options` fields, ready for
/// [`ClientSession::start_listing`].
pub fn decode_listing_request(params: &Value) -> Result<(Uri, vfs_core::InfoOptions)> {
    let map = as_map(params)?;
    let uri = required_uri(map, "uri")?;
    let options = info_options_from_value(
        map.iter().find(|(k, _)| k.as_str() == Some("options")).map(|(_, v)| v).unwrap_or(&Value::Nil),
    )
    .unwrap_or_default();
    Ok((uri, options))
}

/// Encode one chunk of a directory listing (or its terminal error) as a
/// [`vfs_protocol::Notification`] payload.
pub fn encode_listing_chunk(notification: vfs_core::job::Notification) -> vfs_protocol::Notification {
    let id = notification.op_id;
    match notification.result {
        Some(Ok(OpResponse::DirectoryListing { entries, eof })) => {
            let payload = make_params(vec![
                ("entries", Value::Array(entries.iter().map(file_info_to_value).collect())),
                ("eof", val_bool(eof)),
            ]);
            vfs_protocol::Notification::chunk(id, payload, notification.needs_ack && !eof, eof)
        }
        Some(Ok(other)) => vfs_protocol::Notification::failed(
            id,
            vfs_protocol::ErrorData::from(&Error::Internal(format!("unexpected listing response: {other:?}"))),
        ),
        Some(Err(err)) => vfs_protocol::Notification::failed(id, vfs_protocol::ErrorData::from(&err)),
        None => vfs_protocol::Notification::failed(id, vfs_protocol::ErrorData::from(&Error::Internal("job shut down mid-listing".into()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vfs_core::{Backend, FileInfo, FileKind, Handle, InfoOptions, OpenMode, OperationContext};
    use vfs_protocol::payload::open_mode_to_str;

    struct MemoryBackend;

    impl Backend for MemoryBackend {
        fn open(&self, _uri: &Uri, _mode: OpenMode, _ctx: &OperationContext) -> Result<Handle> {
            Ok(Handle::new(0u64))
        }
        fn create(&self, uri: &Uri, mode: OpenMode, _exclusive: bool, _permissions: u32, ctx: &OperationContext) -> Result<Handle> {
            self.open(uri, mode, ctx)
        }
        fn close(&self, _handle: &Handle, _ctx: &OperationContext) -> Result<()> {
            Ok(())
        }
        fn read(&self, _handle: &Handle, buf: &mut [u8], _ctx: &OperationContext) -> Result<usize> {
            let data = b"hi";
            buf[..data.len()].copy_from_slice(data);
            Ok(data.len())
        }
        fn write(&self, _handle: &Handle, buf: &[u8], _ctx: &OperationContext) -> Result<usize> {
            Ok(buf.len())
        }
        fn open_directory(&self, _uri: &Uri, _options: InfoOptions, _ctx: &OperationContext) -> Result<Handle> {
            Ok(Handle::new(0u64))
        }
        fn close_directory(&self, _handle: &Handle, _ctx: &OperationContext) -> Result<()> {
            Ok(())
        }
        fn read_directory(&self, _handle: &Handle, _ctx: &OperationContext) -> Result<FileInfo> {
            Err(Error::Eof)
        }
        fn get_file_info(&self, uri: &Uri, _options: InfoOptions, _ctx: &OperationContext) -> Result<FileInfo> {
            Ok(FileInfo::bare(uri.basename(), FileKind::Regular))
        }
        fn make_directory(&self, _uri: &Uri, _permissions: u32, _ctx: &OperationContext) -> Result<()> {
            Ok(())
        }
        fn remove_directory(&self, _uri: &Uri, _ctx: &OperationContext) -> Result<()> {
            Ok(())
        }
        fn move_(&self, _src: &Uri, _dst: &Uri, _force_replace: bool, _ctx: &OperationContext) -> Result<()> {
            Ok(())
        }
        fn unlink(&self, _uri: &Uri, _ctx: &OperationContext) -> Result<()> {
            Ok(())
        }
    }

    fn session() -> std::sync::Arc<ClientSession> {
        let registry = vfs_core::MethodRegistry::new();
        registry.register_backend("mem", std::sync::Arc::new(MemoryBackend));
        ClientSession::new(std::sync::Arc::new(registry))
    }

    #[tokio::test]
    async fn ping_succeeds_without_a_scheme() {
        let session = session();
        let result = dispatch_call(&session, 1, "ping", &Value::Map(vec![])).await.unwrap();
        let map = result.as_map().unwrap();
        assert_eq!(get_str(map, "status"), Some("ok"));
    }

    #[tokio::test]
    async fn open_then_read_then_close_round_trips() {
        let session = session();
        let open_params = make_params(vec![
            ("uri", val_str("mem:///a.txt")),
            ("mode", val_str(open_mode_to_str(OpenMode::Read))),
        ]);
        let opened = dispatch_call(&session, 1, "open", &open_params).await.unwrap();
        let handle_id = get_u64(opened.as_map().unwrap(), "handle").unwrap();

        let read_params = make_params(vec![("handle", val_u64(handle_id)), ("len", val_u64(16))]);
        let read = dispatch_call(&session, 2, "read", &read_params).await.unwrap();
        let data = get_bin(read.as_map().unwrap(), "data").unwrap();
        assert_eq!(data, b"hi");

        let close_params = make_params(vec![("handle", val_u64(handle_id))]);
        dispatch_call(&session, 3, "close", &close_params).await.unwrap();
        assert!(session.handle(handle_id).await.is_err());
    }

    #[tokio::test]
    async fn unknown_op_is_bad_parameters() {
        let session = session();
        let err = dispatch_call(&session, 1, "bogus", &Value::Map(vec![])).await.unwrap_err();
        assert!(matches!(err, Error::BadParameters(_)));
    }

    #[tokio::test]
    async fn unknown_handle_surfaces_as_bad_parameters() {
        let session = session();
        let params = make_params(vec![("handle", val_u64(999)), ("len", val_u64(4))]);
        let err = dispatch_call(&session, 1, "read", &params).await.unwrap_err();
        assert!(matches!(err, Error::BadParameters(_)));
    }
}
