//! The uniform backend interface: every scheme implements this trait.
//! Every operation is synchronous and blocking; the job engine is what
//! turns these into asynchronous calls, by running them on a per-job
//! worker thread. Operations that have no meaningful
//! implementation for a given backend return [`Error::NotSupported`] by
//! default; a backend overrides only what it actually supports.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use vfs_uri::Uri;

use crate::context::OperationContext;
use crate::error::{Error, Result};

/// Mode an [`Backend::open`]/[`Backend::create`] call requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
    Random,
}

/// Origin for [`Backend::seek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekOrigin {
    Start,
    Current,
    End,
}

/// Opaque reference to an open file or directory handle inside a backend.
///
/// The payload is backend-specific; a backend stores whatever it needs
/// (an fd, a cursor, an SFTP file handle, …) behind `Any` and downcasts it
/// back in its own methods. A handle is not thread-safe for concurrent use
/// by callers; the job engine serialises calls per [`crate::job::Job`].
#[derive(Clone)]
pub struct Handle(Arc<dyn Any + Send + Sync>);

impl Handle {
    pub fn new<T: Any + Send + Sync>(inner: T) -> Self {
        Handle(Arc::new(inner))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle(..)")
    }
}

/// Which extra fields [`Backend::get_file_info`] should populate.
///
/// Computing MIME type or access bits can require extra I/O (reading file
/// contents, an extra stat call), so callers opt in explicitly.
#[derive(Debug, Clone, Copy, Default)]
pub struct InfoOptions {
    pub follow_symlinks: bool,
    pub want_mime_type: bool,
    pub want_access: bool,
    pub force_fast_mime_type: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    Other,
}

/// Stat-like metadata returned by [`Backend::get_file_info`] and streamed
/// by [`Backend::read_directory`].
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub name: String,
    pub kind: FileKind,
    pub size: u64,
    pub modified: Option<SystemTime>,
    pub permissions: Option<u32>,
    pub mime_type: Option<String>,
    pub symlink_target: Option<String>,
    pub readable: bool,
    pub writable: bool,
}

impl FileInfo {
    /// A minimal, mostly-unknown [`FileInfo`] for backends that can only
    /// cheaply determine a name and kind.
    pub fn bare(name: impl Into<String>, kind: FileKind) -> Self {
        Self {
            name: name.into(),
            kind,
            size: 0,
            modified: None,
            permissions: None,
            mime_type: None,
            symlink_target: None,
            readable: true,
            writable: false,
        }
    }
}

bitflags::bitflags! {
    /// Which fields of a [`FileInfoPatch`] [`Backend::set_file_info`]
    /// should actually apply.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SetInfoMask: u8 {
        const NAME = 0b0001;
        const PERMISSIONS = 0b0010;
        const OWNER = 0b0100;
        const TIMES = 0b1000;
    }
}

/// A partial [`FileInfo`] update; only fields selected by the accompanying
/// [`SetInfoMask`] are meaningful.
#[derive(Debug, Clone, Default)]
pub struct FileInfoPatch {
    pub name: Option<String>,
    pub permissions: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub modified: Option<SystemTime>,
}

/// Well-known directory kinds for [`Backend::find_directory`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindDirectoryKind {
    Trash,
    Desktop,
}

/// The uniform contract every backend implements. Inputs that mention a
/// [`Uri`] may assume the scheme matches the backend's own scheme; the
/// [`crate::registry::MethodRegistry`] is responsible for routing by
/// scheme before a backend ever sees a call.
pub trait Backend: Send + Sync {
    fn open(&self, uri: &Uri, mode: OpenMode, ctx: &OperationContext) -> Result<Handle>;

    fn create(
        &self,
        uri: &Uri,
        mode: OpenMode,
        exclusive: bool,
        permissions: u32,
        ctx: &OperationContext,
    ) -> Result<Handle>;

    fn close(&self, handle: &Handle, ctx: &OperationContext) -> Result<()>;

    fn read(&self, handle: &Handle, buf: &mut [u8], ctx: &OperationContext) -> Result<usize>;

    fn write(&self, handle: &Handle, buf: &[u8], ctx: &OperationContext) -> Result<usize>;

    fn seek(
        &self,
        _handle: &Handle,
        _origin: SeekOrigin,
        _offset: i64,
        _ctx: &OperationContext,
    ) -> Result<()> {
        Err(Error::NotSupported)
    }

    fn tell(&self, _handle: &Handle, _ctx: &OperationContext) -> Result<u64> {
        Err(Error::NotSupported)
    }

    fn truncate_handle(&self, _handle: &Handle, _size: u64, _ctx: &OperationContext) -> Result<()> {
        Err(Error::NotSupported)
    }

    fn truncate_uri(&self, _uri: &Uri, _size: u64, _ctx: &OperationContext) -> Result<()> {
        Err(Error::NotSupported)
    }

    fn open_directory(&self, uri: &Uri, options: InfoOptions, ctx: &OperationContext)
    -> Result<Handle>;

    fn close_directory(&self, handle: &Handle, ctx: &OperationContext) -> Result<()>;

    /// Return the next entry, or `Err(Error::Eof)` once exhausted.
    fn read_directory(&self, handle: &Handle, ctx: &OperationContext) -> Result<FileInfo>;

    fn get_file_info(
        &self,
        uri: &Uri,
        options: InfoOptions,
        ctx: &OperationContext,
    ) -> Result<FileInfo>;

    fn get_file_info_from_handle(
        &self,
        _handle: &Handle,
        _options: InfoOptions,
        _ctx: &OperationContext,
    ) -> Result<FileInfo> {
        Err(Error::NotSupported)
    }

    fn make_directory(&self, uri: &Uri, permissions: u32, ctx: &OperationContext) -> Result<()>;

    fn remove_directory(&self, uri: &Uri, ctx: &OperationContext) -> Result<()>;

    fn move_(&self, src: &Uri, dst: &Uri, force_replace: bool, ctx: &OperationContext)
    -> Result<()>;

    fn unlink(&self, uri: &Uri, ctx: &OperationContext) -> Result<()>;

    /// Default: conservative `false`. Only backends that can cheaply
    /// prove two paths share a filesystem (e.g. the local backend
    /// comparing device ids) should override this.
    fn check_same_fs(&self, _a: &Uri, _b: &Uri, _ctx: &OperationContext) -> Result<bool> {
        Ok(false)
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

    fn create_symlink(&self, _uri: &Uri, _target: &str, _ctx: &OperationContext) -> Result<()> {
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
    fn set_info_mask_combines_and_contains() {
        let mask = SetInfoMask::NAME | SetInfoMask::PERMISSIONS;
        assert!(mask.contains(SetInfoMask::NAME));
        assert!(mask.contains(SetInfoMask::PERMISSIONS));
        assert!(!mask.contains(SetInfoMask::OWNER));
    }

    #[test]
    fn empty_mask_contains_nothing() {
        let mask = SetInfoMask::empty();
        assert!(!mask.contains(SetInfoMask::NAME));
    }

    #[test]
    fn handle_roundtrips_through_downcast() {
        #[derive(PartialEq, Debug)]
        struct Payload(u32);
        let handle = Handle::new(Payload(42));
        assert_eq!(handle.downcast_ref::<Payload>(), Some(&Payload(42)));
        assert_eq!(handle.downcast_ref::<String>(), None);
    }

    #[test]
    fn bare_file_info_defaults() {
        let info = FileInfo::bare("a.txt", FileKind::Regular);
        assert_eq!(info.name, "a.txt");
        assert_eq!(info.size, 0);
        assert!(info.readable);
        assert!(!info.writable);
    }
}
