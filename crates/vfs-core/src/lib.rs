//! The synchronous backend contract, the method registry that resolves a
//! URI scheme to a backend, and the job engine that turns blocking backend
//! calls into asynchronous, cancellable operations.
//!
//! A backend implementor only needs [`backend::Backend`] and
//! [`error::Error`]. A caller that wants async semantics drives a
//! [`job::Job`] against a backend obtained from a [`registry::MethodRegistry`].

pub mod backend;
pub mod cancellation;
pub mod context;
pub mod error;
pub mod job;
pub mod registry;

pub use backend::{
    Backend, FileInfo, FileInfoPatch, FileKind, FindDirectoryKind, Handle, InfoOptions, OpenMode,
    SeekOrigin, SetInfoMask,
};
pub use cancellation::CancellationToken;
pub use context::{MessageSink, NullSink, OperationContext};
pub use error::{Error, Result};
pub use job::{Job, Notification, OpRequest, OpResponse};
pub use registry::MethodRegistry;
