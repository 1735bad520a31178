use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use crate::message::RequestId;

/// How often a cell-backed token polls its shared cell while parked in
/// [`CancellationToken::cancelled`].
const CELL_POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug)]
struct TokenInner {
    cancelled: AtomicBool,
    notify: Notify,
    /// Shared-memory fast path observed in addition to the local flag.
    cell: Option<Arc<AtomicU32>>,
}

impl TokenInner {
    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            if let Some(cell) = &self.cell {
                cell.store(1, Ordering::SeqCst);
            }
            self.notify.notify_waiters();
        }
    }
}

/// Observer half of a [`CancellationSource`]; monotonic once cancelled.
#[derive(Clone, Debug)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

impl CancellationToken {
    /// Token that can never be cancelled.
    pub fn none() -> Self {
        CancellationSource::new().token()
    }

    pub fn is_cancelled(&self) -> bool {
        if self.inner.cancelled.load(Ordering::SeqCst) {
            return true;
        }
        match &self.inner.cell {
            Some(cell) => cell.load(Ordering::SeqCst) != 0,
            None => false,
        }
    }

    /// Resolves once the token is cancelled; the at-most-once event.
    ///
    /// Cell-backed tokens additionally poll the shared cell, so a
    /// cancellation flipped on the far side of a worker boundary is observed
    /// without a wire round-trip.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            match &self.inner.cell {
                Some(_) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep(CELL_POLL_INTERVAL) => {}
                    }
                }
                None => notified.await,
            }
        }
    }
}

/// Owner of a cancellation token.
#[derive(Debug)]
pub struct CancellationSource {
    inner: Arc<TokenInner>,
}

impl CancellationSource {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
                cell: None,
            }),
        }
    }

    /// Source whose token also observes a shared cancellation cell.
    pub fn with_cell(cell: Arc<AtomicU32>) -> Self {
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
                cell: Some(cell),
            }),
        }
    }

    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Releases the source without cancelling; dropping it is equivalent.
    pub fn dispose(self) {}
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Sender half of a cancellation strategy: what happens when the caller's
/// token fires for a locally-issued request.
pub trait CancellationSenderStrategy: Send + Sync {
    /// Called once when request `id` goes on the wire.
    fn enable_cancellation(&self, _id: &RequestId) {}

    /// Called when the caller's token fires. Returning `true` instructs the
    /// engine to also send the inline `$/cancelRequest` notification.
    fn cancel(&self, _id: &RequestId) -> bool {
        true
    }

    /// Called after the response for `id` settles.
    fn cleanup(&self, _id: &RequestId) {}
}

/// Receiver half of a cancellation strategy: mints the source whose token is
/// handed to the handler of an inbound request.
pub trait CancellationReceiverStrategy: Send + Sync {
    fn create_source(&self, id: &RequestId) -> CancellationSource;
}

/// Default sender: cancellation travels as an inline `$/cancelRequest`.
#[derive(Clone, Copy, Debug, Default)]
pub struct MessageSenderStrategy;

impl CancellationSenderStrategy for MessageSenderStrategy {}

/// Default receiver: plain sources with no shared-memory fast path.
#[derive(Clone, Copy, Debug, Default)]
pub struct MessageReceiverStrategy;

impl CancellationReceiverStrategy for MessageReceiverStrategy {
    fn create_source(&self, _id: &RequestId) -> CancellationSource {
        CancellationSource::new()
    }
}

/// Pluggable pair describing how cancellation crosses the channel.
#[derive(Clone)]
pub struct CancellationStrategy {
    pub sender: Arc<dyn CancellationSenderStrategy>,
    pub receiver: Arc<dyn CancellationReceiverStrategy>,
}

impl Default for CancellationStrategy {
    fn default() -> Self {
        Self {
            sender: Arc::new(MessageSenderStrategy),
            receiver: Arc::new(MessageReceiverStrategy),
        }
    }
}

impl std::fmt::Debug for CancellationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationStrategy").finish_non_exhaustive()
    }
}
