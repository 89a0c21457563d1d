//! Shared `rmpv::Value` encoding for the operation payloads that ride
//! inside a [`crate::Request`]'s `params` / a [`crate::Response`]'s
//! `result` / a [`crate::Notification`]'s `payload`.
//!
//! Framing (this crate's top level) only ever sees an opaque [`Value`];
//! both the client and the daemon need the *same* mapping from
//! [`vfs_core`] types to that `Value`, so it lives here rather than being
//! duplicated on each side.

use std::time::{Duration, UNIX_EPOCH};

use rmpv::Value;
use vfs_core::{
    FileInfo, FileInfoPatch, FileKind, FindDirectoryKind, InfoOptions, OpenMode, SeekOrigin,
    SetInfoMask,
};

use crate::ProtocolError;

// ---------------------------------------------------------------------------
// Generic map builders / extractors
// ---------------------------------------------------------------------------

pub fn make_params(entries: Vec<(&str, Value)>) -> Value {
    Value::Map(
        entries
            .into_iter()
            .map(|(k, v)| (Value::String(k.into()), v))
            .collect(),
    )
}

pub fn val_str(s: &str) -> Value {
    Value::String(s.into())
}

pub fn val_bin(data: &[u8]) -> Value {
    Value::Binary(data.to_vec())
}

pub fn val_bool(b: bool) -> Value {
    Value::Boolean(b)
}

pub fn val_u64(n: u64) -> Value {
    Value::Integer(n.into())
}

pub fn val_i64(n: i64) -> Value {
    Value::Integer(n.into())
}

fn as_map(value: &Value) -> Result<&[(Value, Value)], ProtocolError> {
    value
        .as_map()
        .map(|v| v.as_slice())
        .ok_or_else(|| ProtocolError::Malformed("expected a msgpack map".into()))
}

pub fn get_str<'a>(map: &'a [(Value, Value)], key: &str) -> Option<&'a str> {
    map.iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .and_then(|(_, v)| v.as_str())
}

pub fn get_u64(map: &[(Value, Value)], key: &str) -> Option<u64> {
    map.iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .and_then(|(_, v)| v.as_u64())
}

pub fn get_i64(map: &[(Value, Value)], key: &str) -> Option<i64> {
    map.iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .and_then(|(_, v)| v.as_i64())
}

pub fn get_bool(map: &[(Value, Value)], key: &str) -> Option<bool> {
    map.iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .and_then(|(_, v)| v.as_bool())
}

pub fn get_bin<'a>(map: &'a [(Value, Value)], key: &str) -> Option<&'a [u8]> {
    map.iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .and_then(|(_, v)| v.as_slice())
}

pub fn get_array<'a>(map: &'a [(Value, Value)], key: &str) -> Option<&'a [Value]> {
    map.iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .and_then(|(_, v)| v.as_array())
        .map(|a| a.as_slice())
}

fn required_str<'a>(map: &'a [(Value, Value)], key: &str) -> Result<&'a str, ProtocolError> {
    get_str(map, key).ok_or_else(|| ProtocolError::Malformed(format!("missing field '{key}'")))
}

fn required_u64(map: &[(Value, Value)], key: &str) -> Result<u64, ProtocolError> {
    get_u64(map, key).ok_or_else(|| ProtocolError::Malformed(format!("missing field '{key}'")))
}

// ---------------------------------------------------------------------------
// OpenMode / SeekOrigin / FileKind / FindDirectoryKind <-> wire tokens
// ---------------------------------------------------------------------------

pub fn open_mode_to_str(mode: OpenMode) -> &'static str {
    match mode {
        OpenMode::Read => "read",
        OpenMode::Write => "write",
        OpenMode::Random => "random",
    }
}

pub fn open_mode_from_str(s: &str) -> Result<OpenMode, ProtocolError> {
    match s {
        "read" => Ok(OpenMode::Read),
        "write" => Ok(OpenMode::Write),
        "random" => Ok(OpenMode::Random),
        other => Err(ProtocolError::Malformed(format!("unknown open mode '{other}'"))),
    }
}

pub fn seek_origin_to_str(origin: SeekOrigin) -> &'static str {
    match origin {
        SeekOrigin::Start => "start",
        SeekOrigin::Current => "current",
        SeekOrigin::End => "end",
    }
}

pub fn seek_origin_from_str(s: &str) -> Result<SeekOrigin, ProtocolError> {
    match s {
        "start" => Ok(SeekOrigin::Start),
        "current" => Ok(SeekOrigin::Current),
        "end" => Ok(SeekOrigin::End),
        other => Err(ProtocolError::Malformed(format!("unknown seek origin '{other}'"))),
    }
}

pub fn file_kind_to_str(kind: FileKind) -> &'static str {
    match kind {
        FileKind::Regular => "regular",
        FileKind::Directory => "directory",
        FileKind::Symlink => "symlink",
        FileKind::Other => "other",
    }
}

pub fn file_kind_from_str(s: &str) -> FileKind {
    match s {
        "directory" => FileKind::Directory,
        "symlink" => FileKind::Symlink,
        "other" => FileKind::Other,
        _ => FileKind::Regular,
    }
}

pub fn find_directory_kind_to_str(kind: FindDirectoryKind) -> &'static str {
    match kind {
        FindDirectoryKind::Trash => "trash",
        FindDirectoryKind::Desktop => "desktop",
    }
}

pub fn find_directory_kind_from_str(s: &str) -> Result<FindDirectoryKind, ProtocolError> {
    match s {
        "trash" => Ok(FindDirectoryKind::Trash),
        "desktop" => Ok(FindDirectoryKind::Desktop),
        other => Err(ProtocolError::Malformed(format!("unknown find-directory kind '{other}'"))),
    }
}

// ---------------------------------------------------------------------------
// InfoOptions
// ---------------------------------------------------------------------------

pub fn info_options_to_value(options: InfoOptions) -> Value {
    make_params(vec![
        ("follow_symlinks", val_bool(options.follow_symlinks)),
        ("want_mime_type", val_bool(options.want_mime_type)),
        ("want_access", val_bool(options.want_access)),
        ("force_fast_mime_type", val_bool(options.force_fast_mime_type)),
    ])
}

pub fn info_options_from_value(value: &Value) -> Result<InfoOptions, ProtocolError> {
    let map = as_map(value)?;
    Ok(InfoOptions {
        follow_symlinks: get_bool(map, "follow_symlinks").unwrap_or(false),
        want_mime_type: get_bool(map, "want_mime_type").unwrap_or(false),
        want_access: get_bool(map, "want_access").unwrap_or(false),
        force_fast_mime_type: get_bool(map, "force_fast_mime_type").unwrap_or(false),
    })
}

// ---------------------------------------------------------------------------
// FileInfo
// ---------------------------------------------------------------------------

pub fn file_info_to_value(info: &FileInfo) -> Value {
    let mut fields = vec![
        ("name", val_str(&info.name)),
        ("kind", val_str(file_kind_to_str(info.kind))),
        ("size", val_u64(info.size)),
        ("readable", val_bool(info.readable)),
        ("writable", val_bool(info.writable)),
    ];
    if let Some(modified) = info.modified {
        let secs = modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        fields.push(("modified", val_u64(secs)));
    }
    if let Some(permissions) = info.permissions {
        fields.push(("permissions", val_u64(permissions as u64)));
    }
    if let Some(mime_type) = &info.mime_type {
        fields.push(("mime_type", val_str(mime_type)));
    }
    if let Some(target) = &info.symlink_target {
        fields.push(("symlink_target", val_str(target)));
    }
    make_params(fields)
}

pub fn file_info_from_value(value: &Value) -> Result<FileInfo, ProtocolError> {
    let map = as_map(value)?;
    Ok(FileInfo {
        name: required_str(map, "name")?.to_string(),
        kind: file_kind_from_str(required_str(map, "kind")?),
        size: required_u64(map, "size")?,
        modified: get_u64(map, "modified").map(|secs| UNIX_EPOCH + Duration::from_secs(secs)),
        permissions: get_u64(map, "permissions").map(|p| p as u32),
        mime_type: get_str(map, "mime_type").map(str::to_string),
        symlink_target: get_str(map, "symlink_target").map(str::to_string),
        readable: get_bool(map, "readable").unwrap_or(false),
        writable: get_bool(map, "writable").unwrap_or(false),
    })
}

// ---------------------------------------------------------------------------
// FileInfoPatch / SetInfoMask
// ---------------------------------------------------------------------------

pub fn set_info_mask_to_value(mask: SetInfoMask) -> Value {
    make_params(vec![
        ("name", val_bool(mask.contains(SetInfoMask::NAME))),
        ("permissions", val_bool(mask.contains(SetInfoMask::PERMISSIONS))),
        ("owner", val_bool(mask.contains(SetInfoMask::OWNER))),
        ("times", val_bool(mask.contains(SetInfoMask::TIMES))),
    ])
}

pub fn set_info_mask_from_value(value: &Value) -> Result<SetInfoMask, ProtocolError> {
    let map = as_map(value)?;
    let mut mask = SetInfoMask::empty();
    if get_bool(map, "name").unwrap_or(false) {
        mask = mask | SetInfoMask::NAME;
    }
    if get_bool(map, "permissions").unwrap_or(false) {
        mask = mask | SetInfoMask::PERMISSIONS;
    }
    if get_bool(map, "owner").unwrap_or(false) {
        mask = mask | SetInfoMask::OWNER;
    }
    if get_bool(map, "times").unwrap_or(false) {
        mask = mask | SetInfoMask::TIMES;
    }
    Ok(mask)
}

pub fn file_info_patch_to_value(patch: &FileInfoPatch) -> Value {
    let mut fields = Vec::new();
    if let Some(name) = &patch.name {
        fields.push(("name", val_str(name)));
    }
    if let Some(permissions) = patch.permissions {
        fields.push(("permissions", val_u64(permissions as u64)));
    }
    if let Some(uid) = patch.uid {
        fields.push(("uid", val_u64(uid as u64)));
    }
    if let Some(gid) = patch.gid {
        fields.push(("gid", val_u64(gid as u64)));
    }
    if let Some(modified) = patch.modified {
        let secs = modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        fields.push(("modified", val_u64(secs)));
    }
    make_params(fields)
}

pub fn file_info_patch_from_value(value: &Value) -> Result<FileInfoPatch, ProtocolError> {
    let map = as_map(value)?;
    Ok(FileInfoPatch {
        name: get_str(map, "name").map(str::to_string),
        permissions: get_u64(map, "permissions").map(|p| p as u32),
        uid: get_u64(map, "uid").map(|u| u as u32),
        gid: get_u64(map, "gid").map(|g| g as u32),
        modified: get_u64(map, "modified").map(|secs| UNIX_EPOCH + Duration::from_secs(secs)),
    })
}
