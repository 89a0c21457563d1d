//! The local filesystem backend (`file://`).
//!
//! Every [`vfs_core::Backend`] method is a thin, synchronous wrapper over
//! `std::fs`/`std::os::unix::fs`; the job engine (in `vfs-core`) is what
//! gives callers asynchronous, cancellable semantics around these blocking
//! calls. Streaming directory listings read one entry per
//! [`vfs_core::Backend::read_directory`] call rather than collecting the
//! whole directory up front, so the job engine's chunk-and-ack loop
//! actually bounds memory use on large directories.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use parking_lot::Mutex;
use vfs_core::{
    Backend, Error, FileInfo, FileInfoPatch, FileKind, FindDirectoryKind, Handle, InfoOptions,
    OpenMode, OperationContext, Result, SeekOrigin, SetInfoMask,
};
use vfs_uri::Uri;

fn uri_to_path(uri: &Uri) -> PathBuf {
    PathBuf::from(uri.decoded_path())
}

const IO_CHUNK: usize = 64 * 1024;

fn map_io_error(err: std::io::Error) -> Error {
    match err.kind() {
        std::io::ErrorKind::NotFound => Error::NotFound,
        std::io::ErrorKind::AlreadyExists => Error::FileExists,
        std::io::ErrorKind::PermissionDenied => Error::AccessDenied,
        _ => match err.raw_os_error() {
            Some(libc::ENOTDIR) => Error::NotADirectory,
            Some(libc::EISDIR) => Error::IsDirectory,
            Some(libc::ENOTEMPTY) => Error::DirectoryNotEmpty,
            Some(libc::ELOOP) => Error::Loop,
            Some(libc::ENAMETOOLONG) => Error::NameTooLong,
            Some(libc::ENOSPC) => Error::NoSpace,
            Some(libc::EROFS) => Error::ReadOnly,
            Some(libc::EXDEV) => Error::NotSameFilesystem,
            _ => Error::Io(err),
        },
    }
}

/// A handful of extensions the local backend can guess a MIME type for
/// without shelling out to `file(1)` or pulling in a dedicated crate;
/// good enough for the common cases a file manager actually cares about.
fn guess_mime_type(path: &Path) -> Option<String> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    let mime = match ext.as_str() {
        "txt" => "text/plain",
        "md" => "text/markdown",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "text/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        "zip" => "application/zip",
        "tar" => "application/x-tar",
        "gz" => "application/gzip",
        "desktop" => "application/x-desktop",
        _ => return None,
    };
    Some(mime.to_string())
}

fn metadata_to_file_info(path: &Path, meta: &fs::Metadata, options: InfoOptions) -> FileInfo {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let kind = if meta.is_dir() {
        FileKind::Directory
    } else if meta.file_type().is_symlink() {
        FileKind::Symlink
    } else if meta.is_file() {
        FileKind::Regular
    } else {
        FileKind::Other
    };

    let symlink_target = if kind == FileKind::Symlink {
        fs::read_link(path)
            .ok()
            .map(|p| p.to_string_lossy().into_owned())
    } else {
        None
    };

    let mime_type = if options.want_mime_type && kind == FileKind::Regular {
        guess_mime_type(path)
    } else {
        None
    };

    let mode = meta.permissions().mode();
    let (readable, writable) = if options.want_access {
        (mode & 0o444 != 0, mode & 0o222 != 0)
    } else {
        (true, mode & 0o222 != 0)
    };

    FileInfo {
        name,
        kind,
        size: meta.len(),
        modified: meta.modified().ok(),
        permissions: Some(mode & 0o7777),
        mime_type,
        symlink_target,
        readable,
        writable,
    }
}

struct FileHandle {
    file: Mutex<File>,
    path: PathBuf,
}

struct DirHandle {
    entries: Mutex<std::vec::IntoIter<std::io::Result<fs::DirEntry>>>,
}

/// The `file://` backend. Stateless beyond the open handles it hands out,
/// safe to share behind an `Arc` across every [`vfs_core::job::Job`] that
/// addresses local paths.
#[derive(Default)]
pub struct LocalBackend;

impl LocalBackend {
    pub fn new() -> Self {
        LocalBackend
    }
}

impl Backend for LocalBackend {
    fn open(&self, uri: &Uri, mode: OpenMode, _ctx: &OperationContext) -> Result<Handle> {
        let path = uri_to_path(uri);
        let mut opts = fs::OpenOptions::new();
        match mode {
            OpenMode::Read => opts.read(true),
            OpenMode::Write => opts.write(true),
            OpenMode::Random => opts.read(true).write(true),
        };
        let file = opts.open(&path).map_err(map_io_error)?;
        Ok(Handle::new(FileHandle { file: Mutex::new(file), path }))
    }

    fn create(
        &self,
        uri: &Uri,
        mode: OpenMode,
        exclusive: bool,
        permissions: u32,
        _ctx: &OperationContext,
    ) -> Result<Handle> {
        let path = uri_to_path(uri);
        let mut opts = fs::OpenOptions::new();
        opts.write(true);
        if exclusive {
            opts.create_new(true);
        } else {
            opts.create(true).truncate(true);
        }
        if matches!(mode, OpenMode::Random) {
            opts.read(true);
        }
        opts.mode(permissions);
        let file = opts.open(&path).map_err(map_io_error)?;
        Ok(Handle::new(FileHandle { file: Mutex::new(file), path }))
    }

    fn close(&self, _handle: &Handle, _ctx: &OperationContext) -> Result<()> {
        Ok(())
    }

    fn read(&self, handle: &Handle, buf: &mut [u8], ctx: &OperationContext) -> Result<usize> {
        let fh = handle
            .downcast_ref::<FileHandle>()
            .ok_or(Error::BadParameters("not a file handle".into()))?;
        let mut file = fh.file.lock();
        let mut total = 0;
        // Large requests are served in slices with a cancellation poll
        // between each, so a cancel lands mid-transfer instead of after it.
        while total < buf.len() {
            if ctx.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let end = (total + IO_CHUNK).min(buf.len());
            match file.read(&mut buf[total..end]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(map_io_error(e)),
            }
        }
        Ok(total)
    }

    fn write(&self, handle: &Handle, buf: &[u8], ctx: &OperationContext) -> Result<usize> {
        let fh = handle
            .downcast_ref::<FileHandle>()
            .ok_or(Error::BadParameters("not a file handle".into()))?;
        let mut file = fh.file.lock();
        let mut total = 0;
        while total < buf.len() {
            if ctx.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let end = (total + IO_CHUNK).min(buf.len());
            match file.write(&buf[total..end]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(map_io_error(e)),
            }
        }
        Ok(total)
    }

    fn seek(
        &self,
        handle: &Handle,
        origin: SeekOrigin,
        offset: i64,
        _ctx: &OperationContext,
    ) -> Result<()> {
        let fh = handle
            .downcast_ref::<FileHandle>()
            .ok_or(Error::BadParameters("not a file handle".into()))?;
        let from = match origin {
            SeekOrigin::Start => SeekFrom::Start(offset.max(0) as u64),
            SeekOrigin::Current => SeekFrom::Current(offset),
            SeekOrigin::End => SeekFrom::End(offset),
        };
        fh.file.lock().seek(from).map_err(map_io_error)?;
        Ok(())
    }

    fn tell(&self, handle: &Handle, _ctx: &OperationContext) -> Result<u64> {
        let fh = handle
            .downcast_ref::<FileHandle>()
            .ok_or(Error::BadParameters("not a file handle".into()))?;
        fh.file.lock().stream_position().map_err(map_io_error)
    }

    fn truncate_handle(&self, handle: &Handle, size: u64, _ctx: &OperationContext) -> Result<()> {
        let fh = handle
            .downcast_ref::<FileHandle>()
            .ok_or(Error::BadParameters("not a file handle".into()))?;
        fh.file.lock().set_len(size).map_err(map_io_error)
    }

    fn truncate_uri(&self, uri: &Uri, size: u64, _ctx: &OperationContext) -> Result<()> {
        let path = uri_to_path(uri);
        let file = fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .map_err(map_io_error)?;
        file.set_len(size).map_err(map_io_error)
    }

    fn open_directory(
        &self,
        uri: &Uri,
        _options: InfoOptions,
        _ctx: &OperationContext,
    ) -> Result<Handle> {
        let path = uri_to_path(uri);
        let entries: Vec<_> = fs::read_dir(&path).map_err(map_io_error)?.collect();
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
            .ok_or(Error::BadParameters("not a directory handle".into()))?;
        loop {
            let next = dh.entries.lock().next();
            match next {
                None => return Err(Error::Eof),
                Some(Err(err)) => return Err(map_io_error(err)),
                Some(Ok(entry)) => {
                    let path = entry.path();
                    match entry.metadata() {
                        Ok(meta) => {
                            return Ok(metadata_to_file_info(&path, &meta, InfoOptions::default()));
                        }
                        // Entry vanished between readdir and stat; skip it
                        // rather than failing the whole listing.
                        Err(_) => continue,
                    }
                }
            }
        }
    }

    fn get_file_info(
        &self,
        uri: &Uri,
        options: InfoOptions,
        _ctx: &OperationContext,
    ) -> Result<FileInfo> {
        let path = uri_to_path(uri);
        let meta = if options.follow_symlinks {
            fs::metadata(&path)
        } else {
            fs::symlink_metadata(&path)
        }
        .map_err(map_io_error)?;
        Ok(metadata_to_file_info(&path, &meta, options))
    }

    fn get_file_info_from_handle(
        &self,
        handle: &Handle,
        options: InfoOptions,
        _ctx: &OperationContext,
    ) -> Result<FileInfo> {
        let fh = handle
            .downcast_ref::<FileHandle>()
            .ok_or(Error::BadParameters("not a file handle".into()))?;
        let meta = fh.file.lock().metadata().map_err(map_io_error)?;
        Ok(metadata_to_file_info(&fh.path, &meta, options))
    }

    fn make_directory(&self, uri: &Uri, permissions: u32, _ctx: &OperationContext) -> Result<()> {
        let path = uri_to_path(uri);
        fs::create_dir(&path).map_err(map_io_error)?;
        let mut perms = fs::metadata(&path).map_err(map_io_error)?.permissions();
        perms.set_mode(permissions);
        fs::set_permissions(&path, perms).map_err(map_io_error)
    }

    fn remove_directory(&self, uri: &Uri, _ctx: &OperationContext) -> Result<()> {
        fs::remove_dir(uri_to_path(uri)).map_err(map_io_error)
    }

    fn move_(
        &self,
        src: &Uri,
        dst: &Uri,
        force_replace: bool,
        _ctx: &OperationContext,
    ) -> Result<()> {
        if src.scheme() != dst.scheme() {
            return Err(Error::NotSameFilesystem);
        }
        let src_path = uri_to_path(src);
        let dst_path = uri_to_path(dst);
        if !force_replace && dst_path.exists() {
            return Err(Error::FileExists);
        }
        fs::rename(&src_path, &dst_path).map_err(map_io_error)
    }

    fn unlink(&self, uri: &Uri, _ctx: &OperationContext) -> Result<()> {
        fs::remove_file(uri_to_path(uri)).map_err(map_io_error)
    }

    fn check_same_fs(&self, a: &Uri, b: &Uri, _ctx: &OperationContext) -> Result<bool> {
        let meta_a = fs::metadata(uri_to_path(a)).map_err(map_io_error)?;
        let meta_b = fs::metadata(uri_to_path(b)).map_err(map_io_error)?;
        Ok(meta_a.dev() == meta_b.dev())
    }

    fn set_file_info(
        &self,
        uri: &Uri,
        patch: &FileInfoPatch,
        mask: SetInfoMask,
        _ctx: &OperationContext,
    ) -> Result<()> {
        let path = uri_to_path(uri);

        if mask.contains(SetInfoMask::PERMISSIONS) {
            if let Some(mode) = patch.permissions {
                let mut perms = fs::metadata(&path).map_err(map_io_error)?.permissions();
                perms.set_mode(mode);
                fs::set_permissions(&path, perms).map_err(map_io_error)?;
            }
        }

        if mask.contains(SetInfoMask::OWNER) {
            if let (Some(uid), Some(gid)) = (patch.uid, patch.gid) {
                let c_path = std::ffi::CString::new(path.as_os_str().as_encoded_bytes())
                    .map_err(|_| Error::BadParameters("path contains NUL byte".into()))?;
                // SAFETY: c_path is a valid, NUL-terminated C string for the
                // duration of this call.
                let rc = unsafe { libc::chown(c_path.as_ptr(), uid, gid) };
                if rc != 0 {
                    return Err(map_io_error(std::io::Error::last_os_error()));
                }
            }
        }

        if let Some(modified) = patch.modified.filter(|_| mask.contains(SetInfoMask::TIMES)) {
            let duration = modified
                .duration_since(SystemTime::UNIX_EPOCH)
                .map_err(|_| Error::BadParameters("modified time before epoch".into()))?;
            let times = [
                libc::timespec { tv_sec: 0, tv_nsec: libc::UTIME_OMIT },
                libc::timespec {
                    tv_sec: duration.as_secs() as libc::time_t,
                    tv_nsec: duration.subsec_nanos() as i64,
                },
            ];
            let c_path = std::ffi::CString::new(path.as_os_str().as_encoded_bytes())
                .map_err(|_| Error::BadParameters("path contains NUL byte".into()))?;
            // SAFETY: c_path and times are both valid for the duration of
            // this call; times has exactly the two entries utimensat expects.
            let rc = unsafe { libc::utimensat(libc::AT_FDCWD, c_path.as_ptr(), times.as_ptr(), 0) };
            if rc != 0 {
                return Err(map_io_error(std::io::Error::last_os_error()));
            }
        }

        if mask.contains(SetInfoMask::NAME) {
            if let Some(new_name) = &patch.name {
                let dst = path
                    .parent()
                    .map(|p| p.join(new_name))
                    .ok_or(Error::BadParameters("no parent directory".into()))?;
                fs::rename(&path, &dst).map_err(map_io_error)?;
            }
        }

        Ok(())
    }

    fn find_directory(
        &self,
        _near: &Uri,
        kind: FindDirectoryKind,
        create_if_missing: bool,
        find_if_missing: bool,
        permissions: u32,
        _ctx: &OperationContext,
    ) -> Result<Uri> {
        let path = match kind {
            FindDirectoryKind::Trash => dirs::data_local_dir()
                .map(|d| d.join("Trash").join("files"))
                .ok_or(Error::NotFound)?,
            FindDirectoryKind::Desktop => dirs::desktop_dir().ok_or(Error::NotFound)?,
        };

        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(&path).map_err(map_io_error)?;
                let mut perms = fs::metadata(&path).map_err(map_io_error)?.permissions();
                perms.set_mode(permissions);
                fs::set_permissions(&path, perms).map_err(map_io_error)?;
            } else if !find_if_missing {
                return Err(Error::NotFound);
            }
        }

        Uri::parse(&format!("file://{}", path.display())).map_err(Error::from)
    }

    fn create_symlink(&self, uri: &Uri, target: &str, _ctx: &OperationContext) -> Result<()> {
        std::os::unix::fs::symlink(target, uri_to_path(uri)).map_err(map_io_error)
    }

    fn is_local(&self, _uri: &Uri) -> bool {
        true
    }
}
