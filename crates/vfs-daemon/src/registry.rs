//! Wires up the [`MethodRegistry`] every client session resolves schemes
//! against. `file` is registered eagerly (cheap, stateless); `ftp`, `ssh`,
//! and `vfolder` are lazy loaders, matching [`MethodRegistry::register_loader`]'s
//! own doc comment: backends expensive enough to want the negative-caching
//! behaviour register lazily.

use std::sync::Arc;

use vfs_core::{Backend, Error, MethodRegistry};

fn vfolder_config_paths() -> (std::path::PathBuf, std::path::PathBuf) {
    let user = dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("vfolder")
        .join("vfolders.xml");
    let system = std::path::PathBuf::from("/etc/xdg/vfolder/vfolders.xml");
    (system, user)
}

pub fn build() -> Arc<MethodRegistry> {
    let registry = MethodRegistry::new();

    registry.register_backend("file", Arc::new(vfs_backend_file::LocalBackend::new()));

    registry.register_loader("ftp", || {
        Ok(Arc::new(vfs_backend_ftp::FtpBackend::new()) as Arc<dyn Backend>)
    });

    registry.register_loader("ssh", || {
        vfs_backend_ssh::SshBackend::new().map(|b| Arc::new(b) as Arc<dyn Backend>)
    });
    // `sftp://` addresses the same backend and connection cache as `ssh://`.
    registry.register_forward("sftp", "ssh");

    registry.register_loader("vfolder", || {
        let (system, user) = vfolder_config_paths();
        vfs_backend_vfolder::VfolderBackend::new(system, user)
            .map(|b| Arc::new(b) as Arc<dyn Backend>)
            .map_err(|e| Error::Internal(format!("failed to load vfolder config: {e}")))
    });

    Arc::new(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_is_resolvable_immediately() {
        let registry = build();
        assert!(registry.resolve("file").is_ok());
    }

    #[test]
    fn unknown_scheme_is_unavailable() {
        let registry = build();
        assert!(matches!(registry.resolve("gopher"), Err(Error::ServiceNotAvailable)));
    }
}
