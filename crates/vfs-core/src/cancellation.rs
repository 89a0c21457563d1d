//! Cooperative cancellation.
//!
//! A long-running backend call must either poll [`CancellationToken::is_cancelled`]
//! at safe points, or block inside a syscall whose fd set includes
//! [`CancellationToken::wake_fd`]. The wake fd is created lazily: before a
//! caller first asks for it, `cancel()` only flips the flag.
//!
//! `cancel()` is safe to call from any thread. The cancelled flag is
//! monotonic: once set it is never cleared.

use std::io::Write;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

type CancelCallback = Box<dyn FnOnce() + Send>;

struct Inner {
    cancelled: AtomicBool,
    wake: Mutex<Option<(UnixStream, UnixStream)>>,
    callback: Mutex<Option<CancelCallback>>,
}

/// A shared handle signalling "abort" to any in-flight operation.
///
/// Cloning a [`CancellationToken`] shares the same underlying flag and wake
/// fd. There is exactly one cancellation per [`crate::context::OperationContext`],
/// but the token itself may be handed to multiple cooperating pieces of
/// code (the backend call, and the job engine's cancel path).
#[derive(Clone)]
pub struct CancellationToken(Arc<Inner>);

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken(Arc::new(Inner {
            cancelled: AtomicBool::new(false),
            wake: Mutex::new(None),
            callback: Mutex::new(None),
        }))
    }

    /// Poll the cancelled flag. Cheap; safe to call from any thread.
    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }

    /// Set the cancelled flag, wake anyone blocked on [`wake_fd`], and
    /// invoke the registered callback (if any) synchronously on the
    /// calling thread.
    ///
    /// Idempotent: calling this more than once has the same observable
    /// effect as calling it once.
    pub fn cancel(&self) {
        let was_cancelled = self.0.cancelled.swap(true, Ordering::SeqCst);
        if was_cancelled {
            return;
        }

        if let Some((_, write_end)) = self.0.wake.lock().as_mut() {
            // Best-effort: the read side may already be gone.
            let _ = write_end.write_all(&[1]);
        }

        if let Some(cb) = self.0.callback.lock().take() {
            cb();
        }
    }

    /// Register a callback to run (on the cancelling thread) the first
    /// time [`cancel`] is called. Race-free only when the caller
    /// guarantees at most one in-flight operation uses this token at a
    /// time (the job engine and the client/daemon bridge both uphold
    /// this by construction).
    pub fn on_cancel(&self, callback: impl FnOnce() + Send + 'static) {
        *self.0.callback.lock() = Some(Box::new(callback));
    }

    /// Return a raw fd that becomes readable once [`cancel`] has been
    /// called, creating the underlying socket pair on first request.
    ///
    /// Callers poll/select on this fd alongside whatever I/O fd their
    /// backend call is blocked on.
    pub fn wake_fd(&self) -> RawFd {
        let mut guard = self.0.wake.lock();
        if guard.is_none() {
            // UnixStream::pair gives two connected, pollable, bidirectional
            // endpoints, the idiomatic stand-in for a self-pipe.
            if let Ok((read_end, write_end)) = UnixStream::pair() {
                let _ = read_end.set_nonblocking(true);
                *guard = Some((read_end, write_end));
            }
        }
        let fd = guard.as_ref().map(|(r, _)| r.as_raw_fd()).unwrap_or(-1);

        // If cancellation already happened before the fd existed, wake it
        // immediately so a subsequent poll doesn't block forever.
        if self.is_cancelled() {
            if let Some((_, write_end)) = guard.as_mut() {
                let _ = write_end.write_all(&[1]);
            }
        }
        fd
    }
}
