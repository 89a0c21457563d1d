//! Per-call side channel: cancellation plus an optional message sink.

use std::sync::Arc;

use crate::cancellation::CancellationToken;

/// Receives short status strings emitted by a backend during a call (e.g.
/// "waiting for retry…"), used to drive interactive UI feedback.
pub trait MessageSink: Send + Sync {
    fn message(&self, text: &str);
}

/// A no-op sink for callers that don't care about progress messages.
pub struct NullSink;

impl MessageSink for NullSink {
    fn message(&self, _text: &str) {}
}

/// Bundles a [`CancellationToken`] with an optional [`MessageSink`].
///
/// Created by the job engine before invoking a backend method and dropped
/// after the result is delivered. Cheap to clone (the token and sink are
/// both reference-counted).
#[derive(Clone)]
pub struct OperationContext {
    token: CancellationToken,
    sink: Option<Arc<dyn MessageSink>>,
}

impl OperationContext {
    pub fn new(token: CancellationToken) -> Self {
        Self { token, sink: None }
    }

    pub fn with_sink(token: CancellationToken, sink: Arc<dyn MessageSink>) -> Self {
        Self {
            token,
            sink: Some(sink),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Emit a status message, if a sink is attached. No-op otherwise.
    pub fn emit(&self, text: &str) {
        if let Some(sink) = &self.sink {
            sink.message(text);
        }
    }
}
