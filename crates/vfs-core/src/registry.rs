//! Resolves a scheme name to a [`Backend`] instance, loading each backend
//! at most once per scheme (process-wide, behind a lock; read-heavy). A
//! failed load is cached as negative so repeated attempts are cheap. A
//! scheme may be registered as a forward to another scheme's backend, the
//! pattern used by the client/daemon proxy: every remote scheme resolves
//! to the same proxy backend instance.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::backend::Backend;
use crate::error::{Error, Result};

type Loader = Box<dyn Fn() -> Result<Arc<dyn Backend>> + Send + Sync>;

enum Slot {
    Loaded(Arc<dyn Backend>),
    Failed,
}

/// A process-lifetime singleton mapping scheme → backend.
///
/// Construct one with [`MethodRegistry::new`], [`MethodRegistry::register_loader`]
/// every scheme the process supports, then call [`MethodRegistry::resolve`]
/// as callers address URIs. Concurrent first-use of the same scheme does
/// not double-load: the loader runs once under the registry's write lock.
pub struct MethodRegistry {
    loaders: RwLock<HashMap<String, Loader>>,
    loaded: RwLock<HashMap<String, Slot>>,
    forwards: RwLock<HashMap<String, String>>,
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self {
            loaders: RwLock::new(HashMap::new()),
            loaded: RwLock::new(HashMap::new()),
            forwards: RwLock::new(HashMap::new()),
        }
    }

    /// Register a lazy loader for `scheme`. Overwrites any previous
    /// loader for the same scheme and clears its cached load state, so a
    /// backend can be swapped before first use (tests rely on this).
    pub fn register_loader(
        &self,
        scheme: &str,
        loader: impl Fn() -> Result<Arc<dyn Backend>> + Send + Sync + 'static,
    ) {
        self.loaders
            .write()
            .insert(scheme.to_string(), Box::new(loader));
        self.loaded.write().remove(scheme);
    }

    /// Register an already-constructed backend directly, skipping the
    /// lazy-load path. Used for backends that are cheap to build eagerly
    /// (e.g. the local filesystem backend).
    pub fn register_backend(&self, scheme: &str, backend: Arc<dyn Backend>) {
        self.loaded
            .write()
            .insert(scheme.to_string(), Slot::Loaded(backend));
    }

    /// Make `scheme` resolve to whatever `target_scheme` resolves to:
    /// the proxy pattern used by the client/daemon bridge, where every
    /// remote scheme (`ftp`, `ssh`, …) forwards to one daemon-proxy
    /// backend instance registered under `target_scheme`.
    pub fn register_forward(&self, scheme: &str, target_scheme: &str) {
        self.forwards
            .write()
            .insert(scheme.to_string(), target_scheme.to_string());
    }

    /// Resolve `scheme` to its backend, loading it if this is the first
    /// use. Returns [`Error::ServiceNotAvailable`] if no loader is
    /// registered, or if a prior load attempt failed (cached negative).
    pub fn resolve(&self, scheme: &str) -> Result<Arc<dyn Backend>> {
        let resolved = self
            .forwards
            .read()
            .get(scheme)
            .cloned()
            .unwrap_or_else(|| scheme.to_string());

        if let Some(slot) = self.loaded.read().get(&resolved) {
            return match slot {
                Slot::Loaded(backend) => Ok(backend.clone()),
                Slot::Failed => Err(Error::ServiceNotAvailable),
            };
        }

        let mut loaded = self.loaded.write();
        // Re-check under the write lock: another thread may have raced us
        // between the read-lock check above and acquiring the write lock.
        if let Some(slot) = loaded.get(&resolved) {
            return match slot {
                Slot::Loaded(backend) => Ok(backend.clone()),
                Slot::Failed => Err(Error::ServiceNotAvailable),
            };
        }

        let loaders = self.loaders.read();
        let Some(loader) = loaders.get(&resolved) else {
            return Err(Error::ServiceNotAvailable);
        };

        match loader() {
            Ok(backend) => {
                tracing::debug!(scheme = %resolved, "backend loaded");
                loaded.insert(resolved, Slot::Loaded(backend.clone()));
                Ok(backend)
            }
            Err(err) => {
                tracing::warn!(scheme = %resolved, error = %err, "backend load failed");
                loaded.insert(resolved, Slot::Failed);
                Err(err)
            }
        }
    }

    /// Drop the cached load (successful or failed) for `scheme`, forcing
    /// the next [`MethodRegistry::resolve`] to reload. Used by tests and
    /// by a daemon that wants to hot-swap a backend implementation.
    pub fn invalidate(&self, scheme: &str) {
        self.loaded.write().remove(scheme);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Handle, InfoOptions, OpenMode};
    use crate::context::OperationContext;
    use crate::cancellation::CancellationToken;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use vfs_uri::Uri;

    struct StubBackend;

    impl Backend for StubBackend {
        fn open(&self, _uri: &Uri, _mode: OpenMode, _ctx: &OperationContext) -> Result<Handle> {
            Err(Error::NotSupported)
        }
        fn create(
            &self,
            _uri: &Uri,
            _mode: OpenMode,
            _exclusive: bool,
            _permissions: u32,
            _ctx: &OperationContext,
        ) -> Result<Handle> {
            Err(Error::NotSupported)
        }
        fn close(&self, _handle: &Handle, _ctx: &OperationContext) -> Result<()> {
            Ok(())
        }
        fn read(&self, _h: &Handle, _buf: &mut [u8], _ctx: &OperationContext) -> Result<usize> {
            Err(Error::NotSupported)
        }
        fn write(&self, _h: &Handle, _buf: &[u8], _ctx: &OperationContext) -> Result<usize> {
            Err(Error::NotSupported)
        }
        fn open_directory(
            &self,
            _uri: &Uri,
            _options: InfoOptions,
            _ctx: &OperationContext,
        ) -> Result<Handle> {
            Err(Error::NotSupported)
        }
        fn close_directory(&self, _handle: &Handle, _ctx: &OperationContext) -> Result<()> {
            Ok(())
        }
        fn read_directory(
            &self,
            _handle: &Handle,
            _ctx: &OperationContext,
        ) -> Result<crate::backend::FileInfo> {
            Err(Error::Eof)
        }
        fn get_file_info(
            &self,
            _uri: &Uri,
            _options: InfoOptions,
            _ctx: &OperationContext,
        ) -> Result<crate::backend::FileInfo> {
            Err(Error::NotFound)
        }
        fn make_directory(&self, _uri: &Uri, _permissions: u32, _ctx: &OperationContext) -> Result<()> {
            Err(Error::NotSupported)
        }
        fn remove_directory(&self, _uri: &Uri, _ctx: &OperationContext) -> Result<()> {
            Err(Error::NotSupported)
        }
        fn move_(
            &self,
            _src: &Uri,
            _dst: &Uri,
            _force_replace: bool,
            _ctx: &OperationContext,
        ) -> Result<()> {
            Err(Error::NotSupported)
        }
        fn unlink(&self, _uri: &Uri, _ctx: &OperationContext) -> Result<()> {
            Err(Error::NotSupported)
        }
    }

    fn ctx() -> OperationContext {
        OperationContext::new(CancellationToken::new())
    }

    #[test]
    fn resolve_unregistered_scheme_fails() {
        let registry = MethodRegistry::new();
        assert!(matches!(
            registry.resolve("nope"),
            Err(Error::ServiceNotAvailable)
        ));
    }

    #[test]
    fn resolve_loads_once() {
        let registry = MethodRegistry::new();
        let load_count = Arc::new(AtomicUsize::new(0));
        let count = load_count.clone();
        registry.register_loader("stub", move || {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(StubBackend) as Arc<dyn Backend>)
        });

        let a = registry.resolve("stub").unwrap();
        let b = registry.resolve("stub").unwrap();
        assert_eq!(load_count.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&a, &b));
        let _ = ctx();
    }

    #[test]
    fn failed_load_is_cached_negative() {
        let registry = MethodRegistry::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let count = attempts.clone();
        registry.register_loader("broken", move || {
            count.fetch_add(1, Ordering::SeqCst);
            Err(Error::Internal("boom".into()))
        });

        assert!(registry.resolve("broken").is_err());
        assert!(registry.resolve("broken").is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn invalidate_forces_reload() {
        let registry = MethodRegistry::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let count = attempts.clone();
        registry.register_loader("stub", move || {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(StubBackend) as Arc<dyn Backend>)
        });
        registry.resolve("stub").unwrap();
        registry.invalidate("stub");
        registry.resolve("stub").unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn forward_resolves_to_target_backend() {
        let registry = MethodRegistry::new();
        registry.register_backend("daemon-proxy", Arc::new(StubBackend));
        registry.register_forward("ftp", "daemon-proxy");
        registry.register_forward("ssh", "daemon-proxy");

        let ftp = registry.resolve("ftp").unwrap();
        let ssh = registry.resolve("ssh").unwrap();
        assert!(Arc::ptr_eq(&ftp, &ssh));
    }

    #[test]
    fn register_backend_is_eager_not_lazy() {
        let registry = MethodRegistry::new();
        registry.register_backend("file", Arc::new(StubBackend));
        assert!(registry.resolve("file").is_ok());
    }
}
