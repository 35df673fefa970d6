//! In-process queue of claimed work items.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use crate::models::WorkItem;

/// An item waiting for a worker.
#[derive(Debug, Clone)]
pub struct QueuedItem {
    pub item: WorkItem,
    /// Set when a retired worker pushed it back. Its claim was released, so
    /// the next worker must re-claim it first.
    pub requeued: bool,
}

/// FIFO shared by the workers of one pool run.
#[derive(Debug, Default)]
pub struct WorkQueue {
    items: Mutex<VecDeque<QueuedItem>>,
}

impl WorkQueue {
    pub fn new(items: impl IntoIterator<Item = WorkItem>) -> Self {
        Self {
            items: Mutex::new(
                items
                    .into_iter()
                    .map(|item| QueuedItem {
                        item,
                        requeued: false,
                    })
                    .collect(),
            ),
        }
    }

    pub fn pop(&self) -> Option<QueuedItem> {
        self.lock().pop_front()
    }

    /// Put a released item at the tail.
    pub fn requeue(&self, item: WorkItem) {
        self.lock().push_back(QueuedItem {
            item,
            requeued: true,
        });
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Take everything still queued.
    pub fn drain(&self) -> Vec<QueuedItem> {
        self.lock().drain(..).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<QueuedItem>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
