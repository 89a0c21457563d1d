//! Per-connection state: a lazily-created [`vfs_core::job::Job`] per scheme
//! this client has touched, the table of opaque handle ids it has open, and
//! the bookkeeping that lets a wire `Ack`/`Cancel` reach the right job.
//!
//! One [`Job`] is created per (client, scheme) pair rather than shared
//! globally, so each accepted connection keeps its own open handles and
//! in-flight ops isolated from every other connection; nothing needs
//! locking across sessions.
//!
//! A background "pump" task is spawned per `Job` the first time its scheme
//! is used; it drains that job's notification channel (a blocking
//! `std::sync::mpsc::Receiver`, so draining happens inside
//! [`tokio::task::spawn_blocking`]) and routes each notification to
//! whichever pending call or stream is waiting for that job-local op id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot};
use vfs_core::job::{Job, Notification as JobNotification, OpRequest, OpResponse};
use vfs_core::{CancellationToken, Error, Handle, InfoOptions, MethodRegistry, OperationContext, Result};
use vfs_uri::Uri;

const LISTING_CHUNK_SIZE: usize = 256;
const PUMP_POLL: Duration = Duration::from_millis(500);

enum Pending {
    Call(oneshot::Sender<Result<OpResponse>>),
    Stream(mpsc::UnboundedSender<JobNotification>),
}

struct SchemeJob {
    job: Arc<Job>,
    pending: Arc<AsyncMutex<HashMap<u64, Pending>>>,
}

/// What a wire `Ack`/`Cancel` needs to reach the right job.
struct ActiveOp {
    job: Arc<Job>,
}

pub struct ClientSession {
    registry: Arc<MethodRegistry>,
    jobs: AsyncMutex<HashMap<String, Arc<SchemeJob>>>,
    handles: AsyncMutex<HashMap<u64, (String, Handle)>>,
    active: AsyncMutex<HashMap<u64, ActiveOp>>,
    next_handle: AtomicU64,
}

impl ClientSession {
    pub fn new(registry: Arc<MethodRegistry>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            jobs: AsyncMutex::new(HashMap::new()),
            handles: AsyncMutex::new(HashMap::new()),
            active: AsyncMutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        })
    }

    async fn scheme_job(&self, scheme: &str) -> Result<Arc<SchemeJob>> {
        if let Some(sj) = self.jobs.lock().await.get(scheme) {
            return Ok(sj.clone());
        }
        let backend = self.registry.resolve(scheme)?;
        let job = Arc::new(Job::new(backend));
        let pending = Arc::new(AsyncMutex::new(HashMap::new()));
        let sj = Arc::new(SchemeJob { job: job.clone(), pending: pending.clone() });
        tokio::spawn(pump(Arc::downgrade(&job), pending));
        self.jobs.lock().await.insert(scheme.to_string(), sj.clone());
        Ok(sj)
    }

    /// Store a freshly opened handle under a new opaque id.
    pub async fn store_handle(&self, scheme: &str, handle: Handle) -> u64 {
        let id = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.handles.lock().await.insert(id, (scheme.to_string(), handle));
        id
    }

    /// Look up a stored handle and the scheme it belongs to.
    pub async fn handle(&self, id: u64) -> Result<(String, Handle)> {
        self.handles
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::BadParameters(format!("unknown handle id {id}")))
    }

    /// Drop a stored handle (on `close`/`close_directory`).
    pub async fn forget_handle(&self, id: u64) {
        self.handles.lock().await.remove(&id);
    }

    /// Submit a non-streaming op on `scheme` and await its single result.
    /// `wire_id` is the client's request id, registered so a `Cancel` for
    /// it can reach this job while it's in flight.
    pub async fn call(&self, wire_id: u64, scheme: &str, request: OpRequest) -> Result<OpResponse> {
        let sj = self.scheme_job(scheme).await?;
        let ctx = OperationContext::new(CancellationToken::new());

        let (tx, rx) = oneshot::channel();
        {
            // Hold the pending lock across submission so the pump can never
            // observe the op's result before we've registered to receive it.
            let mut pending = sj.pending.lock().await;
            let op_id = sj.job.call(request, ctx);
            pending.insert(op_id, Pending::Call(tx));
        }

        self.active.lock().await.insert(wire_id, ActiveOp { job: sj.job.clone() });
        let result = rx
            .await
            .unwrap_or_else(|_| Err(Error::Internal("job pump dropped".into())));
        self.active.lock().await.remove(&wire_id);
        result
    }

    /// Start a streaming directory listing on `scheme`. Returns a receiver
    /// of raw [`JobNotification`]s the caller drains into wire
    /// `Notification`s, acking via [`Self::ack`] between chunks.
    pub async fn start_listing(
        &self,
        wire_id: u64,
        scheme: &str,
        uri: Uri,
        options: InfoOptions,
    ) -> Result<mpsc::UnboundedReceiver<JobNotification>> {
        let sj = self.scheme_job(scheme).await?;
        let ctx = OperationContext::new(CancellationToken::new());

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut pending = sj.pending.lock().await;
            let op_id = sj.job.list_directory(uri, options, LISTING_CHUNK_SIZE, ctx);
            pending.insert(op_id, Pending::Stream(tx));
        }
        self.active.lock().await.insert(wire_id, ActiveOp { job: sj.job.clone() });
        Ok(rx)
    }

    /// A listing finished (final chunk or error), so drop its `Cancel` routing.
    pub async fn finish_listing(&self, wire_id: u64) {
        self.active.lock().await.remove(&wire_id);
    }

    /// Release the next chunk of a streaming listing identified by `wire_id`.
    pub async fn ack(&self, wire_id: u64) {
        if let Some(op) = self.active.lock().await.get(&wire_id) {
            op.job.ack();
        }
    }

    /// Cancel whatever is in flight for `wire_id`, streaming or not.
    pub async fn cancel(&self, wire_id: u64) {
        if let Some(op) = self.active.lock().await.get(&wire_id) {
            op.job.cancel();
        }
    }

    /// Resolve the scheme a URI addresses, for ops that carry their own URI
    /// rather than an existing handle.
    pub fn scheme_of(&self, uri: &Uri) -> String {
        uri.scheme().to_string()
    }

    /// Drain everything this client still holds, used when its connection
    /// goes away (cleanly or not). Every in-flight op is cancelled first,
    /// then every handle the client left open is closed through its owning
    /// backend, so a crashed client cannot leak daemon-side resources.
    pub async fn shutdown(&self) {
        for (_, op) in self.active.lock().await.drain() {
            op.job.cancel();
        }

        let handles: Vec<(String, Handle)> = self
            .handles
            .lock()
            .await
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for (scheme, handle) in handles {
            let Ok(sj) = self.scheme_job(&scheme).await else { continue };
            let ctx = OperationContext::new(CancellationToken::new());
            let (tx, rx) = oneshot::channel();
            {
                let mut pending = sj.pending.lock().await;
                let op_id = sj.job.call(OpRequest::Close { handle }, ctx);
                pending.insert(op_id, Pending::Call(tx));
            }
            let _ = rx.await;
        }
    }
}

async fn pump(job: Weak<Job>, pending: Arc<AsyncMutex<HashMap<u64, Pending>>>) {
    loop {
        let Some(job) = job.upgrade() else { return };
        let notification = tokio::task::spawn_blocking(move || job.recv_timeout(PUMP_POLL))
            .await
            .unwrap_or(None);
        let Some(notification) = notification else { continue };
        deliver(&pending, notification).await;
    }
}

async fn deliver(pending: &Arc<AsyncMutex<HashMap<u64, Pending>>>, notification: JobNotification) {
    let JobNotification { op_id, result, needs_ack } = notification;
    let mut guard = pending.lock().await;
    let Some(entry) = guard.remove(&op_id) else { return };
    match entry {
        Pending::Call(tx) => {
            let _ = tx.send(result.unwrap_or_else(|| Err(Error::Internal("missing job result".into()))));
        }
        Pending::Stream(tx) => {
            let still_wanted = tx
                .send(JobNotification { op_id, result, needs_ack })
                .is_ok();
            if still_wanted && needs_ack {
                guard.insert(op_id, Pending::Stream(tx));
            }
        }
    }
}
