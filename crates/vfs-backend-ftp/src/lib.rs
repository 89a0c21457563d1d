//! The FTP backend (`ftp://`).
//!
//! One connection is kept alive per `(host, port, user)` triple and reused
//! across calls; a dropped connection is silently reconnected on next use.
//! FTP has no notion of a random-access file handle shared between a
//! control-connection round trip and raw byte reads, so [`LocalLikeHandle`]
//! buffers: a read handle pulls the whole file over one data connection up
//! front, a write handle accumulates bytes in memory and uploads them in
//! one `STOR` on close. Directory listings are parsed from `LIST`'s
//! Unix-style text output, the same approach traditional FTP VFS
//! implementations use since `MLSD` isn't universally supported.

use std::collections::HashMap;
use std::io::Cursor;

use ftp::FtpError;
use parking_lot::Mutex;
use vfs_core::{
    Backend, Error, FileInfo, FileInfoPatch, FileKind, FindDirectoryKind, Handle, InfoOptions,
    OpenMode, OperationContext, Result, SeekOrigin, SetInfoMask,
};
use vfs_uri::Uri;

fn map_ftp_error(err: FtpError) -> Error {
    match err {
        FtpError::ConnectionError(io_err) => Error::Io(io_err),
        FtpError::InvalidResponse(msg) => {
            if msg.contains("550") || msg.to_ascii_lowercase().contains("no such file") {
                Error::NotFound
            } else if msg.contains("530") {
                Error::LoginFailed
            } else if msg.contains("553") {
                Error::AccessDenied
            } else {
                Error::Internal(msg)
            }
        }
        FtpError::SecureError(msg) => Error::Internal(msg),
        FtpError::InvalidAddress(err) => Error::Internal(err.to_string()),
    }
}

#[derive(Hash, Eq, PartialEq, Clone)]
struct ConnKey {
    host: String,
    port: u16,
    user: String,
}

impl ConnKey {
    fn from_uri(uri: &Uri) -> Result<Self> {
        let host = uri.host().ok_or(Error::InvalidHostname)?.to_string();
        let port = uri.port().unwrap_or(21);
        let user = uri.user().unwrap_or("anonymous").to_string();
        Ok(ConnKey { host, port, user })
    }
}

/// The `ftp://` backend. Holds one live control connection per distinct
/// `(host, port, user)` reached through it.
pub struct FtpBackend {
    connections: Mutex<HashMap<ConnKey, ftp::FtpStream>>,
}

impl Default for FtpBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FtpBackend {
    pub fn new() -> Self {
        FtpBackend {
            connections: Mutex::new(HashMap::new()),
        }
    }

    fn with_connection<T>(
        &self,
        uri: &Uri,
        f: impl FnOnce(&mut ftp::FtpStream) -> std::result::Result<T, FtpError>,
    ) -> Result<T> {
        let key = ConnKey::from_uri(uri)?;
        let mut connections = self.connections.lock();

        let stream = match connections.entry(key.clone()) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                tracing::debug!(host = %key.host, port = key.port, user = %key.user, "ftp connecting");
                let mut stream = ftp::FtpStream::connect((key.host.as_str(), key.port))
                    .map_err(map_ftp_error)?;
                let password = uri.password().unwrap_or("anonymous@");
                stream.login(&key.user, password).map_err(map_ftp_error)?;
                entry.insert(stream)
            }
        };
        match f(stream) {
            Ok(value) => Ok(value),
            Err(err) => {
                // A connection-level error likely means the control
                // connection is dead; drop it so the next call reconnects.
                if matches!(err, FtpError::ConnectionError(_)) {
                    connections.remove(&key);
                }
                Err(map_ftp_error(err))
            }
        }
    }
}

/// Parse one Unix-style `LIST` line into a [`FileInfo`]. Returns `None` for
/// lines this parser doesn't recognise (blank lines, `total N` headers)
/// rather than erroring the whole listing over one odd line.
fn parse_list_line(line: &str) -> Option<FileInfo> {
    let mut fields = line.split_whitespace();
    let perm_field = fields.next()?;
    if perm_field.len() < 10 || perm_field == "total" {
        return None;
    }
    let kind = match perm_field.as_bytes()[0] {
        b'd' => FileKind::Directory,
        b'l' => FileKind::Symlink,
        b'-' => FileKind::Regular,
        _ => FileKind::Other,
    };

    let _links = fields.next()?;
    let _owner = fields.next()?;
    let _group = fields.next()?;
    let size: u64 = fields.next()?.parse().ok()?;
    // Skip the three date/time fields (month, day, year-or-time).
    let _month = fields.next()?;
    let _day = fields.next()?;
    let _time = fields.next()?;
    let name: String = fields.collect::<Vec<_>>().join(" ");
    if name.is_empty() || name == "." || name == ".." {
        return None;
    }

    let readable = perm_field.as_bytes().get(1) == Some(&b'r');
    let writable = perm_field.as_bytes().get(2) == Some(&b'w');

    Some(FileInfo {
        name,
        kind,
        size,
        modified: None,
        permissions: None,
        mime_type: None,
        symlink_target: None,
        readable,
        writable,
    })
}

enum FileHandle {
    Read { buffer: Vec<u8>, pos: Mutex<usize> },
    Write { uri: Uri, buffer: Mutex<Vec<u8>> },
}

struct DirHandle {
    entries: Mutex<std::vec::IntoIter<FileInfo>>,
}

impl Backend for FtpBackend {
    fn open(&self, uri: &Uri, mode: OpenMode, _ctx: &OperationContext) -> Result<Handle> {
        match mode {
            OpenMode::Write => Ok(Handle::new(FileHandle::Write {
                uri: uri.clone(),
                buffer: Mutex::new(Vec::new()),
            })),
            OpenMode::Read | OpenMode::Random => {
                let path = uri.decoded_path();
                let cursor = self.with_connection(uri, |stream| stream.simple_retr(&path))?;
                Ok(Handle::new(FileHandle::Read {
                    buffer: cursor.into_inner(),
                    pos: Mutex::new(0),
                }))
            }
        }
    }

    fn create(
        &self,
        uri: &Uri,
        _mode: OpenMode,
        exclusive: bool,
        _permissions: u32,
        ctx: &OperationContext,
    ) -> Result<Handle> {
        if exclusive {
            let path = uri.decoded_path();
            if self.with_connection(uri, |s| s.simple_retr(&path)).is_ok() {
                return Err(Error::FileExists);
            }
        }
        self.open(uri, OpenMode::Write, ctx)
    }

    fn close(&self, handle: &Handle, _ctx: &OperationContext) -> Result<()> {
        if let Some(FileHandle::Write { uri, buffer }) = handle.downcast_ref::<FileHandle>() {
            let data = buffer.lock();
            let path = uri.decoded_path();
            let mut cursor = Cursor::new(data.clone());
            self.with_connection(uri, |stream| stream.put(&path, &mut cursor))?;
        }
        Ok(())
    }

    fn read(&self, handle: &Handle, buf: &mut [u8], _ctx: &OperationContext) -> Result<usize> {
        let fh = handle
            .downcast_ref::<FileHandle>()
            .ok_or(Error::BadParameters("not an ftp file handle".into()))?;
        match fh {
            FileHandle::Read { buffer, pos } => {
                let mut cursor = pos.lock();
                let remaining = &buffer[(*cursor).min(buffer.len())..];
                let n = remaining.len().min(buf.len());
                buf[..n].copy_from_slice(&remaining[..n]);
                *cursor += n;
                Ok(n)
            }
            FileHandle::Write { .. } => Err(Error::BadParameters("handle opened for writing".into())),
        }
    }

    fn write(&self, handle: &Handle, buf: &[u8], _ctx: &OperationContext) -> Result<usize> {
        let fh = handle
            .downcast_ref::<FileHandle>()
            .ok_or(Error::BadParameters("not an ftp file handle".into()))?;
        match fh {
            FileHandle::Write { buffer, .. } => {
                buffer.lock().extend_from_slice(buf);
                Ok(buf.len())
            }
            FileHandle::Read { .. } => Err(Error::BadParameters("handle opened for reading".into())),
        }
    }

    fn seek(&self, handle: &Handle, origin: SeekOrigin, offset: i64, _ctx: &OperationContext) -> Result<()> {
        let fh = handle
            .downcast_ref::<FileHandle>()
            .ok_or(Error::BadParameters("not an ftp file handle".into()))?;
        match fh {
            FileHandle::Read { buffer, pos } => {
                let mut cursor = pos.lock();
                let base = match origin {
                    SeekOrigin::Start => 0i64,
                    SeekOrigin::Current => *cursor as i64,
                    SeekOrigin::End => buffer.len() as i64,
                };
                let new_pos = (base + offset).clamp(0, buffer.len() as i64);
                *cursor = new_pos as usize;
                Ok(())
            }
            FileHandle::Write { .. } => Err(Error::NotSupported),
        }
    }

    fn tell(&self, handle: &Handle, _ctx: &OperationContext) -> Result<u64> {
        let fh = handle
            .downcast_ref::<FileHandle>()
            .ok_or(Error::BadParameters("not an ftp file handle".into()))?;
        match fh {
            FileHandle::Read { pos, .. } => Ok(*pos.lock() as u64),
            FileHandle::Write { buffer, .. } => Ok(buffer.lock().len() as u64),
        }
    }

    fn open_directory(&self, uri: &Uri, _options: InfoOptions, _ctx: &OperationContext) -> Result<Handle> {
        let path = uri.decoded_path();
        let lines = self.with_connection(uri, |stream| stream.list(Some(&path)))?;
        let entries: Vec<FileInfo> = lines.iter().filter_map(|l| parse_list_line(l)).collect();
        Ok(Handle::new(DirHandle {
            entries: Mutex::new(entries.into_iter()),
        }))
    }

    fn close_directory(&self, _handle: &Handle, _ctx: &OperationContext) -> Result<()> {
        Ok(())
    }

    fn read_directory(&self, handle: &Handle, _ctx: &OperationContext) -> Result<FileInfo> {
        let dh = handle
            .downcast_ref::<DirHandle>()
            .ok_or(Error::BadParameters("not an ftp directory handle".into()))?;
        dh.entries.lock().next().ok_or(Error::Eof)
    }

    fn get_file_info(&self, uri: &Uri, _options: InfoOptions, _ctx: &OperationContext) -> Result<FileInfo> {
        let path = uri.decoded_path();
        let name = uri.basename();
        match self.with_connection(uri, |stream| stream.size(&path)) {
            Ok(size) => Ok(FileInfo {
                size: size.unwrap_or(0) as u64,
                ..FileInfo::bare(name, FileKind::Regular)
            }),
            Err(Error::NotFound) => {
                // `SIZE` fails on directories for most servers; confirm by
                // listing the parent and looking for a `d` entry.
                let parent = uri.dirname().unwrap_or_else(|| uri.clone());
                let lines = self.with_connection(&parent, |s| s.list(Some(&parent.decoded_path())))?;
                lines
                    .iter()
                    .filter_map(|l| parse_list_line(l))
                    .find(|info| info.name == name)
                    .ok_or(Error::NotFound)
            }
            Err(other) => Err(other),
        }
    }

    fn make_directory(&self, uri: &Uri, _permissions: u32, _ctx: &OperationContext) -> Result<()> {
        let path = uri.decoded_path();
        self.with_connection(uri, |stream| stream.mkdir(&path))
    }

    fn remove_directory(&self, uri: &Uri, _ctx: &OperationContext) -> Result<()> {
        let path = uri.decoded_path();
        self.with_connection(uri, |stream| stream.rmdir(&path))
    }

    fn move_(&self, src: &Uri, dst: &Uri, _force_replace: bool, _ctx: &OperationContext) -> Result<()> {
        if src.scheme() != dst.scheme()
            || ConnKey::from_uri(src)? != ConnKey::from_uri(dst).map_err(|_| Error::NotSameFilesystem)?
        {
            return Err(Error::NotSameFilesystem);
        }
        let from = src.decoded_path();
        let to = dst.decoded_path();
        self.with_connection(src, |stream| stream.rename(&from, &to))
    }

    fn unlink(&self, uri: &Uri, _ctx: &OperationContext) -> Result<()> {
        let path = uri.decoded_path();
        self.with_connection(uri, |stream| stream.rm(&path))
    }

    fn check_same_fs(&self, a: &Uri, b: &Uri, _ctx: &OperationContext) -> Result<bool> {
        if a.scheme() != b.scheme() {
            return Ok(false);
        }
        match (ConnKey::from_uri(a), ConnKey::from_uri(b)) {
            (Ok(ka), Ok(kb)) => Ok(ka == kb),
            _ => Ok(false),
        }
    }

    fn set_file_info(
        &self,
        _uri: &Uri,
        _patch: &FileInfoPatch,
        _mask: SetInfoMask,
        _ctx: &OperationContext,
    ) -> Result<()> {
        Err(Error::NotSupported)
    }

    fn find_directory(
        &self,
        _near: &Uri,
        _kind: FindDirectoryKind,
        _create_if_missing: bool,
        _find_if_missing: bool,
        _permissions: u32,
        _ctx: &OperationContext,
    ) -> Result<Uri> {
        Err(Error::NotSupported)
    }

    fn is_local(&self, _uri: &Uri) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unix_style_directory_entry() {
        let line = "drwxr-xr-x 2 user group 4096 Jan 01 00:00 subdir";
        let info = parse_list_line(line).unwrap();
        assert_eq!(info.kind, FileKind::Directory);
        assert_eq!(info.name, "subdir");
        assert!(info.readable);
        assert!(info.writable);
    }

    #[test]
    fn parses_unix_style_file_entry_with_spaces_in_name() {
        let line = "-rw-r--r-- 1 user group 123 Jan 01 00:00 my file.txt";
        let info = parse_list_line(line).unwrap();
        assert_eq!(info.kind, FileKind::Regular);
        assert_eq!(info.name, "my file.txt");
        assert_eq!(info.size, 123);
    }

    #[test]
    fn skips_total_header_line() {
        assert!(parse_list_line("total 12").is_none());
    }

    #[test]
    fn skips_blank_line() {
        assert!(parse_list_line("").is_none());
    }

    #[test]
    fn read_only_entry_has_writable_false() {
        let line = "-r--r--r-- 1 user group 1 Jan 01 00:00 readonly.txt";
        let info = parse_list_line(line).unwrap();
        assert!(!info.writable);
    }

    #[test]
    fn conn_key_defaults_port_and_anonymous_user() {
        let uri = Uri::parse("ftp://example.invalid/pub").unwrap();
        let key = ConnKey::from_uri(&uri).unwrap();
        assert_eq!(key.port, 21);
        assert_eq!(key.user, "anonymous");
    }

    #[test]
    fn conn_key_uses_uri_user_and_port() {
        let uri = Uri::parse("ftp://alice@example.invalid:2121/pub").unwrap();
        let key = ConnKey::from_uri(&uri).unwrap();
        assert_eq!(key.port, 2121);
        assert_eq!(key.user, "alice");
    }
}
