use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::cancellation::{
    CancellationReceiverStrategy, CancellationSenderStrategy, CancellationSource,
    CancellationStrategy,
};
use crate::message::RequestId;

/// Registry of per-request cancellation cells shared by both ends of an
/// in-process (worker-thread) transport.
///
/// JSON cannot carry a memory handle, so instead of attaching the cell to the
/// request envelope both strategy halves hold the same registry keyed by
/// request id.
#[derive(Debug, Default)]
pub struct SharedCancellationCells {
    cells: Mutex<HashMap<RequestId, Arc<AtomicU32>>>,
}

impl SharedCancellationCells {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn insert(&self, id: RequestId) -> Arc<AtomicU32> {
        let cell = Arc::new(AtomicU32::new(0));
        self.lock().insert(id, Arc::clone(&cell));
        cell
    }

    fn get(&self, id: &RequestId) -> Option<Arc<AtomicU32>> {
        self.lock().get(id).cloned()
    }

    fn remove(&self, id: &RequestId) {
        self.lock().remove(id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RequestId, Arc<AtomicU32>>> {
        self.cells.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Sender half: flips the shared cell instead of sending `$/cancelRequest`.
#[derive(Clone, Debug)]
pub struct SharedCellSenderStrategy {
    cells: Arc<SharedCancellationCells>,
}

impl SharedCellSenderStrategy {
    pub fn new(cells: Arc<SharedCancellationCells>) -> Self {
        Self { cells }
    }
}

impl CancellationSenderStrategy for SharedCellSenderStrategy {
    fn enable_cancellation(&self, id: &RequestId) {
        self.cells.insert(id.clone());
    }

    fn cancel(&self, id: &RequestId) -> bool {
        match self.cells.get(id) {
            Some(cell) => {
                cell.store(1, Ordering::SeqCst);
                false
            }
            // Cell already cleaned up; fall back to the inline notification.
            None => true,
        }
    }

    fn cleanup(&self, id: &RequestId) {
        self.cells.remove(id);
    }
}

/// Receiver half: tokens observe the shared cell through atomic loads and
/// fall back to plain sources when no cell was registered for the id.
#[derive(Clone, Debug)]
pub struct SharedCellReceiverStrategy {
    cells: Arc<SharedCancellationCells>,
}

impl SharedCellReceiverStrategy {
    pub fn new(cells: Arc<SharedCancellationCells>) -> Self {
        Self { cells }
    }
}

impl CancellationReceiverStrategy for SharedCellReceiverStrategy {
    fn create_source(&self, id: &RequestId) -> CancellationSource {
        match self.cells.get(id) {
            Some(cell) => CancellationSource::with_cell(cell),
            None => CancellationSource::new(),
        }
    }
}

/// Builds both halves of the shared-cell strategy over one registry.
pub fn shared_cell_strategy(cells: Arc<SharedCancellationCells>) -> CancellationStrategy {
    CancellationStrategy {
        sender: Arc::new(SharedCellSenderStrategy::new(Arc::clone(&cells))),
        receiver: Arc::new(SharedCellReceiverStrategy::new(cells)),
    }
}
