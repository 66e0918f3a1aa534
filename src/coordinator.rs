//! Step-by-step batch coordination.
//!
//! The manual workflow phases walk a queue one item at a time, waiting for
//! the user between items. [`BatchActionCoordinator`] owns that walk: a
//! cursor over a frozen item list, advanced by the handler's verdict, and
//! a [`CancelHandle`] that stops the walk from the handler or from
//! outside. It knows nothing about terminals or mail; the caller supplies
//! all of that through the handler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// What the handler decided for the current item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepSignal {
    /// Move on to the next item
    Advance,
    /// Stop the whole batch here
    Cancel,
}

/// How a coordinator run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Every item was presented and advanced past
    Completed,
    /// The handler or an external handle stopped the run early
    Cancelled,
}

/// Shared cancellation flag, cloneable across tasks
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Cursor over a frozen batch of items, advanced one user decision
/// at a time
#[derive(Debug)]
pub struct BatchActionCoordinator<T> {
    items: Vec<T>,
    cursor: usize,
    cancel: CancelHandle,
}

impl<T> BatchActionCoordinator<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self::with_cancel(items, CancelHandle::new())
    }

    /// Create a coordinator wired to an existing cancellation handle,
    /// so cancelling one phase stops the ones after it too
    pub fn with_cancel(items: Vec<T>, cancel: CancelHandle) -> Self {
        Self {
            items,
            cursor: 0,
            cancel,
        }
    }

    /// The item the cursor points at, if any
    pub fn current(&self) -> Option<&T> {
        self.items.get(self.cursor)
    }

    /// Zero-based position of the cursor
    pub fn position(&self) -> usize {
        self.cursor
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Items not yet advanced past, the current one included
    pub fn remaining(&self) -> usize {
        self.items.len().saturating_sub(self.cursor)
    }

    pub fn is_done(&self) -> bool {
        self.cursor >= self.items.len()
    }

    /// A clone of the cancellation handle for external use
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Walk the items, presenting each to `handler` in order.
    ///
    /// The handler receives the item's position and a copy of the item
    /// and resolves to a [`StepSignal`] once the user has acted. A
    /// tripped cancellation handle is honored before every step, so an
    /// external cancel takes effect at the next item boundary.
    pub async fn run<F, Fut>(&mut self, mut handler: F) -> BatchOutcome
    where
        T: Clone,
        F: FnMut(usize, T) -> Fut,
        Fut: std::future::Future<Output = StepSignal>,
    {
        loop {
            if self.cancel.is_cancelled() {
                return BatchOutcome::Cancelled;
            }

            let item = match self.items.get(self.cursor) {
                Some(item) => item.clone(),
                None => return BatchOutcome::Completed,
            };

            match handler(self.cursor, item).await {
                StepSignal::Advance => self.cursor += 1,
                StepSignal::Cancel => {
                    self.cancel.cancel();
                    return BatchOutcome::Cancelled;
                }
            }
        }
    }
}
