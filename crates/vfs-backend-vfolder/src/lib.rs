//! The vfolder backend (`vfolder://`): a composite, read/write virtual
//! filesystem over a pool of `.desktop`-style entries, organised into a
//! folder tree described by a configuration document. Physical file I/O
//! is delegated to [`vfs_backend_file::LocalBackend`] once a vfolder path
//! has been resolved to a real file on disk.

pub mod config;
pub mod folder;
pub mod pool;
pub mod query;

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use vfs_backend_file::LocalBackend;
use vfs_core::{
    Backend, Error, FileInfo, FileInfoPatch, FileKind, FindDirectoryKind, Handle, InfoOptions,
    OpenMode, OperationContext, Result, SeekOrigin, SetInfoMask,
};
use vfs_uri::Uri;

use config::{Document, FolderSpec};
use folder::{EntryRef, FolderId, FolderTree};
use pool::{FileEntry, Pool};

/// Build a `file://` URI addressing an absolute local path, the way a
/// vfolder entry's on-disk [`FileEntry::filename`] must be reached once
/// resolution hands off to [`LocalBackend`].
fn file_uri_for(path: &Path) -> Result<Uri> {
    let mut uri = Uri::parse("file:///").map_err(Error::from)?;
    for component in path.components() {
        if let std::path::Component::Normal(segment) = component {
            uri = uri.child(&segment.to_string_lossy());
        }
    }
    Ok(uri)
}

enum Resolved {
    Folder(FolderId),
    Entry { parent: FolderId, basename: String },
}

struct VfolderState {
    system_config_path: PathBuf,
    user_config_path: PathBuf,
    merge_dirs: Vec<PathBuf>,
    item_dirs: Vec<PathBuf>,
    user_item_dir: Option<PathBuf>,
    desktop_dir: Option<PathBuf>,
    user_desktop_dir: Option<PathBuf>,
    read_only: bool,
    environments: Vec<String>,
    config_mtime: Option<std::time::SystemTime>,
    pool: Pool,
    tree: FolderTree,
    root: FolderId,
    local: LocalBackend,
}

impl VfolderState {
    fn load(
        system_config_path: PathBuf,
        user_config_path: PathBuf,
        environments: Vec<String>,
    ) -> Result<Self> {
        let text = std::fs::read_to_string(&user_config_path)
            .or_else(|_| std::fs::read_to_string(&system_config_path))
            .map_err(Error::Io)?;
        let config_mtime = std::fs::metadata(&user_config_path)
            .or_else(|_| std::fs::metadata(&system_config_path))
            .and_then(|m| m.modified())
            .ok();
        let doc = config::parse_document(&text).map_err(|e| Error::Internal(e.to_string()))?;

        let pool = Pool::load(
            &doc.merge_dirs,
            &doc.item_dirs,
            doc.user_item_dir.as_deref(),
            &environments,
        );
        let linked_dir = doc
            .user_desktop_dir
            .clone()
            .or_else(|| doc.desktop_dir.clone());
        let (tree, root) = FolderTree::build(&doc.root, linked_dir.as_deref());

        Ok(VfolderState {
            system_config_path,
            user_config_path,
            merge_dirs: doc.merge_dirs,
            item_dirs: doc.item_dirs,
            user_item_dir: doc.user_item_dir,
            desktop_dir: doc.desktop_dir,
            user_desktop_dir: doc.user_desktop_dir,
            read_only: doc.read_only,
            environments,
            config_mtime,
            pool,
            tree,
            root,
            local: LocalBackend::new(),
        })
    }

    /// A concurrent external edit of the config document only surfaces on
    /// the next lookup miss: reload if the file on disk is newer than
    /// what this state was built from, then let the caller retry.
    fn reload_if_stale(&mut self) -> bool {
        let on_disk = std::fs::metadata(&self.user_config_path)
            .or_else(|_| std::fs::metadata(&self.system_config_path))
            .and_then(|m| m.modified())
            .ok();
        if on_disk == self.config_mtime {
            return false;
        }
        match VfolderState::load(
            self.system_config_path.clone(),
            self.user_config_path.clone(),
            self.environments.clone(),
        ) {
            Ok(fresh) => {
                tracing::debug!(path = %self.user_config_path.display(), "reloaded vfolder config");
                *self = fresh;
                true
            }
            Err(err) => {
                tracing::warn!(error = %err, "vfolder config reload failed, keeping in-memory state");
                false
            }
        }
    }

    fn persist(&mut self) -> Result<()> {
        let doc = Document {
            merge_dirs: self.merge_dirs.clone(),
            item_dirs: self.item_dirs.clone(),
            user_item_dir: self.user_item_dir.clone(),
            desktop_dir: self.desktop_dir.clone(),
            user_desktop_dir: self.user_desktop_dir.clone(),
            read_only: self.read_only,
            root: self.tree.export(self.root),
        };
        let text = config::write_document(&doc).map_err(|e| Error::Internal(e.to_string()))?;
        if let Some(parent) = self.user_config_path.parent() {
            std::fs::create_dir_all(parent).map_err(Error::Io)?;
        }
        let tmp = self.user_config_path.with_extension("tmp");
        std::fs::write(&tmp, text).map_err(Error::Io)?;
        std::fs::rename(&tmp, &self.user_config_path).map_err(Error::Io)?;
        self.config_mtime = std::fs::metadata(&self.user_config_path)
            .and_then(|m| m.modified())
            .ok();
        Ok(())
    }

    fn resolve(&mut self, uri: &Uri) -> Result<Resolved> {
        match self.resolve_walk(uri) {
            Err(Error::NotFound) if self.reload_if_stale() => self.resolve_walk(uri),
            other => other,
        }
    }

    fn resolve_walk(&mut self, uri: &Uri) -> Result<Resolved> {
        let segments: Vec<String> = uri
            .decoded_path()
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        let mut current = self.root;
        self.tree.ensure_folder(&self.pool, current);
        self.tree.ensure_folder_sort(current);

        for (i, segment) in segments.iter().enumerate() {
            let is_last = i == segments.len() - 1;
            match self.tree.subfolder_named(current, segment) {
                Some(id) => {
                    current = id;
                    self.tree.ensure_folder(&self.pool, current);
                    self.tree.ensure_folder_sort(current);
                }
                None if is_last => {
                    return Ok(Resolved::Entry {
                        parent: current,
                        basename: segment.clone(),
                    });
                }
                None => return Err(Error::NotFound),
            }
        }

        Ok(Resolved::Folder(current))
    }

    fn entry_in_folder(&self, parent: FolderId, basename: &str) -> bool {
        self.tree
            .node(parent)
            .entries
            .iter()
            .any(|e| matches!(e, EntryRef::File(n) if n == basename))
    }

    fn user_item_dir(&self) -> Result<&Path> {
        self.user_item_dir.as_deref().ok_or(Error::ReadOnly)
    }

    /// A document-level `ReadOnly` flag freezes the whole scheme.
    fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    /// Writes landing on a system entry first copy it into the user item
    /// directory, then keep editing the copy; the system file is never
    /// touched.
    fn materialise_for_write(&mut self, basename: &str) -> Result<PathBuf> {
        let user_dir = self.user_item_dir()?.to_path_buf();
        let target = user_dir.join(basename);

        match self.pool.get(basename).cloned() {
            Some(entry) if entry.per_user => return Ok(entry.filename),
            Some(entry) => {
                std::fs::create_dir_all(&user_dir).map_err(Error::Io)?;
                std::fs::copy(&entry.filename, &target).map_err(Error::Io)?;
                let mut updated = entry;
                updated.filename = target.clone();
                updated.per_user = true;
                self.pool.insert(basename.to_string(), updated);
            }
            None => {
                std::fs::create_dir_all(&user_dir).map_err(Error::Io)?;
                // New user-dir entries follow item-dir semantics: no
                // Categories yet means no keywords, synthesized or not.
                self.pool.insert(
                    basename.to_string(),
                    FileEntry {
                        filename: target.clone(),
                        per_user: true,
                        keywords: Default::default(),
                        implicit_keywords: false,
                    },
                );
            }
        }

        // The pool changed, so any folder whose query matched (or now
        // matches) this entry is stale.
        self.tree.invalidate_all();
        Ok(target)
    }
}

/// The `vfolder://` backend.
pub struct VfolderBackend {
    state: Mutex<VfolderState>,
}

impl VfolderBackend {
    pub fn new(system_config_path: impl Into<PathBuf>, user_config_path: impl Into<PathBuf>) -> Result<Self> {
        Self::with_environments(
            system_config_path,
            user_config_path,
            pool::DEFAULT_ENVIRONMENTS.iter().map(|s| s.to_string()).collect(),
        )
    }

    /// Like [`VfolderBackend::new`], but with an explicit set of
    /// environment tags honoured when entries carry an `OnlyShowIn` key.
    pub fn with_environments(
        system_config_path: impl Into<PathBuf>,
        user_config_path: impl Into<PathBuf>,
        environments: Vec<String>,
    ) -> Result<Self> {
        Ok(VfolderBackend {
            state: Mutex::new(VfolderState::load(
                system_config_path.into(),
                user_config_path.into(),
                environments,
            )?),
        })
    }
}

enum VfolderHandle {
    Local(Handle),
    Directory(Mutex<std::vec::IntoIter<FileInfo>>),
}

impl Backend for VfolderBackend {
    fn open(&self, uri: &Uri, mode: OpenMode, ctx: &OperationContext) -> Result<Handle> {
        let mut state = self.state.lock();
        let Resolved::Entry { parent, basename } = state.resolve(uri)? else {
            return Err(Error::IsDirectory);
        };
        if !state.entry_in_folder(parent, &basename) {
            return Err(Error::NotFound);
        }
        let path = match mode {
            OpenMode::Read => state
                .pool
                .get(&basename)
                .ok_or(Error::NotFound)?
                .filename
                .clone(),
            OpenMode::Write | OpenMode::Random => {
                state.ensure_writable()?;
                if state.tree.node(parent).read_only {
                    return Err(Error::ReadOnly);
                }
                state.materialise_for_write(&basename)?
            }
        };
        let inner = state.local.open(&file_uri_for(&path)?, mode, ctx)?;
        Ok(Handle::new(VfolderHandle::Local(inner)))
    }

    fn create(
        &self,
        uri: &Uri,
        mode: OpenMode,
        exclusive: bool,
        permissions: u32,
        ctx: &OperationContext,
    ) -> Result<Handle> {
        let mut state = self.state.lock();
        let Resolved::Entry { parent, basename } = state.resolve(uri)? else {
            return Err(Error::IsDirectory);
        };

        if exclusive && state.entry_in_folder(parent, &basename) {
            return Err(Error::FileExists);
        }
        state.ensure_writable()?;
        if state.tree.node(parent).read_only {
            return Err(Error::ReadOnly);
        }

        let path = state.materialise_for_write(&basename)?;
        let inner = state
            .local
            .create(&file_uri_for(&path)?, mode, false, permissions, ctx)?;

        if !state.tree.node(parent).includes.iter().any(|n| n == &basename) {
            state.tree.node_mut(parent).includes.push(basename.clone());
        }
        state.tree.node_mut(parent).excludes.remove(&basename);
        state.tree.invalidate(parent);
        state.persist()?;

        Ok(Handle::new(VfolderHandle::Local(inner)))
    }

    fn close(&self, handle: &Handle, ctx: &OperationContext) -> Result<()> {
        match handle.downcast_ref::<VfolderHandle>() {
            Some(VfolderHandle::Local(inner)) => {
                let state = self.state.lock();
                state.local.close(inner, ctx)
            }
            _ => Err(Error::BadParameters("not a vfolder file handle".into())),
        }
    }

    fn read(&self, handle: &Handle, buf: &mut [u8], ctx: &OperationContext) -> Result<usize> {
        match handle.downcast_ref::<VfolderHandle>() {
            Some(VfolderHandle::Local(inner)) => self.state.lock().local.read(inner, buf, ctx),
            _ => Err(Error::BadParameters("not a vfolder file handle".into())),
        }
    }

    fn write(&self, handle: &Handle, buf: &[u8], ctx: &OperationContext) -> Result<usize> {
        match handle.downcast_ref::<VfolderHandle>() {
            Some(VfolderHandle::Local(inner)) => self.state.lock().local.write(inner, buf, ctx),
            _ => Err(Error::BadParameters("not a vfolder file handle".into())),
        }
    }

    fn seek(&self, handle: &Handle, origin: SeekOrigin, offset: i64, ctx: &OperationContext) -> Result<()> {
        match handle.downcast_ref::<VfolderHandle>() {
            Some(VfolderHandle::Local(inner)) => self.state.lock().local.seek(inner, origin, offset, ctx),
            _ => Err(Error::BadParameters("not a vfolder file handle".into())),
        }
    }

    fn tell(&self, handle: &Handle, ctx: &OperationContext) -> Result<u64> {
        match handle.downcast_ref::<VfolderHandle>() {
            Some(VfolderHandle::Local(inner)) => self.state.lock().local.tell(inner, ctx),
            _ => Err(Error::BadParameters("not a vfolder file handle".into())),
        }
    }

    fn open_directory(&self, uri: &Uri, _options: InfoOptions, _ctx: &OperationContext) -> Result<Handle> {
        let mut state = self.state.lock();
        let id = match state.resolve(uri)? {
            Resolved::Folder(id) => id,
            Resolved::Entry { .. } => return Err(Error::NotADirectory),
        };

        let mut infos = Vec::new();
        for entry in state.tree.node(id).entries.clone() {
            match entry {
                EntryRef::Folder(child) => {
                    infos.push(FileInfo::bare(state.tree.node(child).name.clone(), FileKind::Directory));
                }
                EntryRef::File(name) => {
                    let size = state
                        .pool
                        .get(&name)
                        .and_then(|fe| std::fs::metadata(&fe.filename).ok())
                        .map(|m| m.len())
                        .unwrap_or(0);
                    infos.push(FileInfo {
                        size,
                        ..FileInfo::bare(name, FileKind::Regular)
                    });
                }
            }
        }

        Ok(Handle::new(VfolderHandle::Directory(Mutex::new(infos.into_iter()))))
    }

    fn close_directory(&self, _handle: &Handle, _ctx: &OperationContext) -> Result<()> {
        Ok(())
    }

    fn read_directory(&self, handle: &Handle, _ctx: &OperationContext) -> Result<FileInfo> {
        match handle.downcast_ref::<VfolderHandle>() {
            Some(VfolderHandle::Directory(entries)) => entries.lock().next().ok_or(Error::Eof),
            _ => Err(Error::BadParameters("not a vfolder directory handle".into())),
        }
    }

    fn get_file_info(&self, uri: &Uri, _options: InfoOptions, _ctx: &OperationContext) -> Result<FileInfo> {
        let mut state = self.state.lock();
        match state.resolve(uri)? {
            Resolved::Folder(id) => Ok(FileInfo::bare(state.tree.node(id).name.clone(), FileKind::Directory)),
            Resolved::Entry { parent, basename } => {
                if !state.entry_in_folder(parent, &basename) {
                    return Err(Error::NotFound);
                }
                let entry = state.pool.get(&basename).ok_or(Error::NotFound)?;
                let meta = std::fs::metadata(&entry.filename).map_err(Error::Io)?;
                Ok(FileInfo {
                    size: meta.len(),
                    writable: !state.tree.node(parent).read_only,
                    ..FileInfo::bare(basename, FileKind::Regular)
                })
            }
        }
    }

    fn make_directory(&self, uri: &Uri, _permissions: u32, _ctx: &OperationContext) -> Result<()> {
        let mut state = self.state.lock();
        let Resolved::Entry { parent, basename } = state.resolve(uri)? else {
            return Err(Error::FileExists);
        };
        state.ensure_writable()?;
        if state.tree.node(parent).read_only {
            return Err(Error::ReadOnly);
        }
        if state.tree.subfolder_named(parent, &basename).is_some() {
            return Err(Error::FileExists);
        }
        state.tree.append_subfolder(
            parent,
            &FolderSpec {
                name: basename,
                ..Default::default()
            },
        );
        state.persist()
    }

    fn remove_directory(&self, uri: &Uri, _ctx: &OperationContext) -> Result<()> {
        let mut state = self.state.lock();
        let id = match state.resolve(uri)? {
            Resolved::Folder(id) => id,
            Resolved::Entry { .. } => return Err(Error::NotADirectory),
        };
        state.ensure_writable()?;
        if id == state.root {
            return Err(Error::AccessDenied);
        }
        if !state.tree.node(id).entries.is_empty() || state.tree.node(id).desktop_file.is_some() {
            return Err(Error::DirectoryNotEmpty);
        }
        let parent = state
            .tree
            .node(id)
            .parent
            .ok_or(Error::AccessDenied)?;
        state.tree.remove_subfolder(parent, id);
        state.persist()
    }

    fn move_(&self, src: &Uri, dst: &Uri, force_replace: bool, _ctx: &OperationContext) -> Result<()> {
        if src.scheme() != dst.scheme() || src.host() != dst.host() {
            return Err(Error::NotSameFilesystem);
        }

        let mut state = self.state.lock();
        let (src_parent, src_name) = match state.resolve(src)? {
            Resolved::Entry { parent, basename } => (parent, basename),
            Resolved::Folder(_) => return Err(Error::NotSupported),
        };
        if !state.entry_in_folder(src_parent, &src_name) {
            return Err(Error::NotFound);
        }

        let (dst_parent, dst_name) = match state.resolve(dst)? {
            Resolved::Entry { parent, basename } => (parent, basename),
            Resolved::Folder(_) => return Err(Error::IsDirectory),
        };

        if state.entry_in_folder(dst_parent, &dst_name) && !force_replace {
            return Err(Error::FileExists);
        }
        state.ensure_writable()?;
        if state.tree.node(src_parent).read_only || state.tree.node(dst_parent).read_only {
            return Err(Error::ReadOnly);
        }
        // Two supported shapes: a rename inside one folder, or the same
        // basename relocating to another folder. Renaming while changing
        // folders in one step is not a thing the entry model can express.
        if src_parent != dst_parent && src_name != dst_name {
            return Err(Error::NotSupported);
        }

        if src_parent == dst_parent {
            // Same-folder rename: physically rename the backing file too.
            let entry = state.pool.get(&src_name).ok_or(Error::NotFound)?.clone();
            let new_path = entry.filename.with_file_name(&dst_name);
            std::fs::rename(&entry.filename, &new_path).map_err(Error::Io)?;
            let mut updated = entry;
            updated.filename = new_path;
            state.pool.remove(&src_name);
            state.pool.insert(dst_name.clone(), updated);
            state.tree.invalidate_all();
        } else if let Some(query::Query {
            node: query::QueryNode::Keyword(keyword),
            not: false,
        }) = state.tree.node(dst_parent).query.clone()
        {
            // Folder change into a keyword-defined folder: stamp the
            // keyword onto the entry so it keeps matching after the
            // include list is next rebuilt, and persist it for per-user
            // files (system files gain it in memory only).
            if let Some(mut entry) = state.pool.get(&src_name).cloned() {
                if entry.keywords.insert(keyword) {
                    entry.implicit_keywords = false;
                    if entry.per_user {
                        pool::write_entry_categories(&entry.filename, &entry.keywords)
                            .map_err(Error::Io)?;
                    }
                    state.pool.insert(src_name.clone(), entry);
                    state.tree.invalidate_all();
                }
            }
        }

        let node = state.tree.node_mut(src_parent);
        node.includes.retain(|n| n != &src_name);
        node.excludes.insert(src_name.clone());
        state.tree.invalidate(src_parent);

        let node = state.tree.node_mut(dst_parent);
        if !node.includes.iter().any(|n| n == &dst_name) {
            node.includes.push(dst_name.clone());
        }
        node.excludes.remove(&dst_name);
        state.tree.invalidate(dst_parent);

        let _ = state.tree.persist_sort_order(dst_parent);
        state.persist()
    }

    fn unlink(&self, uri: &Uri, _ctx: &OperationContext) -> Result<()> {
        let mut state = self.state.lock();
        let Resolved::Entry { parent, basename } = state.resolve(uri)? else {
            return Err(Error::IsDirectory);
        };
        if !state.entry_in_folder(parent, &basename) {
            return Err(Error::NotFound);
        }
        state.ensure_writable()?;
        if state.tree.node(parent).read_only {
            return Err(Error::ReadOnly);
        }

        let node = state.tree.node_mut(parent);
        node.includes.retain(|n| n != &basename);
        node.excludes.insert(basename.clone());
        state.tree.invalidate(parent);

        // A per-user file no other folder references is really gone: drop
        // the physical file and its pool entry. System files stay put, so
        // a later pool re-read restores the system-provided version.
        if let Some(entry) = state.pool.get(&basename).cloned() {
            if entry.per_user && !state.tree.referenced_in_includes(&basename) {
                let _ = std::fs::remove_file(&entry.filename);
                state.pool.remove(&basename);
                state.tree.invalidate_all();
            }
        }

        state.persist()
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

    fn check_same_fs(&self, a: &Uri, b: &Uri, _ctx: &OperationContext) -> Result<bool> {
        Ok(a.scheme() == b.scheme() && a.host() == b.host())
    }

    fn is_local(&self, _uri: &Uri) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_config(dir: &Path, item_dir: &Path, user_item_dir: &Path) -> PathBuf {
        let config_path = dir.join("vfolders.xml");
        let text = format!(
            r#"<VFolderInfo>
  <ItemDir>{}</ItemDir>
  <UserItemDir>{}</UserItemDir>
  <Folder>
    <Name>Root</Name>
    <Folder>
      <Name>Games</Name>
      <Query><Keyword>Game</Keyword></Query>
    </Folder>
  </Folder>
</VFolderInfo>"#,
            item_dir.display(),
            user_item_dir.display()
        );
        fs::write(&config_path, text).unwrap();
        config_path
    }

    fn backend() -> (VfolderBackend, tempfile::TempDir) {
        let root = tempfile::tempdir().unwrap();
        let item_dir = root.path().join("system");
        let user_item_dir = root.path().join("user");
        fs::create_dir_all(&item_dir).unwrap();
        fs::create_dir_all(&user_item_dir).unwrap();
        fs::write(
            item_dir.join("a.desktop"),
            "[Desktop Entry]\nCategories=Game;\n",
        )
        .unwrap();
        let config_path = write_config(root.path(), &item_dir, &user_item_dir);
        let backend = VfolderBackend::new(config_path.clone(), config_path).unwrap();
        (backend, root)
    }

    fn ctx() -> OperationContext {
        OperationContext::new(vfs_core::CancellationToken::new())
    }

    #[test]
    fn get_file_info_on_root_is_a_directory() {
        let (backend, _root) = backend();
        let uri = Uri::parse("vfolder:///").unwrap();
        let info = backend.get_file_info(&uri, InfoOptions::default(), &ctx()).unwrap();
        assert_eq!(info.kind, FileKind::Directory);
    }

    #[test]
    fn query_matches_entry_by_keyword() {
        let (backend, _root) = backend();
        let uri = Uri::parse("vfolder:///Games/a.desktop").unwrap();
        let info = backend.get_file_info(&uri, InfoOptions::default(), &ctx()).unwrap();
        assert_eq!(info.kind, FileKind::Regular);
    }

    #[test]
    fn unknown_entry_is_not_found() {
        let (backend, _root) = backend();
        let uri = Uri::parse("vfolder:///Games/missing.desktop").unwrap();
        assert!(matches!(
            backend.get_file_info(&uri, InfoOptions::default(), &ctx()),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn unlink_excludes_entry_from_its_folder() {
        let (backend, _root) = backend();
        let uri = Uri::parse("vfolder:///Games/a.desktop").unwrap();
        backend.unlink(&uri, &ctx()).unwrap();
        assert!(matches!(
            backend.get_file_info(&uri, InfoOptions::default(), &ctx()),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn make_directory_adds_subfolder() {
        let (backend, _root) = backend();
        let uri = Uri::parse("vfolder:///NewFolder").unwrap();
        backend.make_directory(&uri, 0o755, &ctx()).unwrap();
        let info = backend.get_file_info(&uri, InfoOptions::default(), &ctx()).unwrap();
        assert_eq!(info.kind, FileKind::Directory);
    }

    #[test]
    fn remove_directory_refuses_non_empty_folder() {
        let (backend, _root) = backend();
        let uri = Uri::parse("vfolder:///Games").unwrap();
        assert!(matches!(
            backend.remove_directory(&uri, &ctx()),
            Err(Error::DirectoryNotEmpty)
        ));
    }

    #[test]
    fn cross_vfolder_move_is_rejected() {
        let (backend, _root) = backend();
        let src = Uri::parse("vfolder:///Games/a.desktop").unwrap();
        let dst = Uri::parse("vfolder://other/Games/a.desktop").unwrap();
        assert!(matches!(
            backend.move_(&src, &dst, false, &ctx()),
            Err(Error::NotSameFilesystem)
        ));
    }

    #[test]
    fn is_local_is_always_true() {
        let (backend, _root) = backend();
        let uri = Uri::parse("vfolder:///").unwrap();
        assert!(backend.is_local(&uri));
    }
}
