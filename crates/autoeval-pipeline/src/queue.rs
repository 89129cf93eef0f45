//! Single-active-run admission.
//!
//! A run takes its [`Place`] in line when it is started, before any task is
//! spawned, so runs are admitted strictly in start order. Each place waits
//! for the one ahead of it to be released. The queue owns the process-wide
//! cancellation flag: it is cleared when a run is admitted and again when its
//! slot is released, so a cancel aimed at one run never leaks into the next.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;

use autoeval_types::{Result, RunStatus};

use crate::cancel::CancelFlag;
use crate::records::{update_run_status, StatusUpdate};
use crate::store::RecordStore;

#[derive(Debug, Default)]
pub struct RunQueue {
    /// Release signal of the most recently reserved place.
    tail: Mutex<Option<oneshot::Receiver<()>>>,
    /// Places reserved and not yet released, active run included.
    pending: Arc<AtomicUsize>,
    active: Mutex<Option<String>>,
    cancel: CancelFlag,
}

/// A reserved position in the queue.
#[derive(Debug)]
pub struct Place {
    ahead: Option<oneshot::Receiver<()>>,
    turn: Turn,
}

/// Held from reservation until the run releases the queue. Dropping it,
/// including on panic or an abandoned place, lets the next place in.
#[derive(Debug)]
struct Turn {
    _release: oneshot::Sender<()>,
    pending: Arc<AtomicUsize>,
}

impl Drop for Turn {
    fn drop(&mut self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RunQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the next place in line. Admission order is reservation order.
    pub fn reserve(&self) -> Place {
        let (release, released) = oneshot::channel();
        let mut tail = lock(&self.tail);
        let ahead = tail.replace(released);
        self.pending.fetch_add(1, Ordering::SeqCst);
        Place {
            ahead,
            turn: Turn {
                _release: release,
                pending: Arc::clone(&self.pending),
            },
        }
    }

    /// Wait for every place ahead of `place`, then mark `run_id` active and
    /// `running`.
    ///
    /// The returned slot must be held for the whole run, including the
    /// final status write.
    pub async fn acquire(
        &self,
        place: Place,
        run_id: &str,
        store: &dyn RecordStore,
    ) -> Result<RunSlot<'_>> {
        let Place { ahead, turn } = place;
        if let Some(ahead) = ahead {
            // nothing is ever sent; the sender dropping is the release
            let _ = ahead.await;
        }
        *lock(&self.active) = Some(run_id.to_string());
        self.cancel.clear();
        let slot = RunSlot {
            queue: self,
            _turn: turn,
        };
        update_run_status(store, run_id, RunStatus::Running, StatusUpdate::default()).await?;
        tracing::info!(run_id = %run_id, "Run admitted");
        Ok(slot)
    }

    /// `true` while some run holds or waits for the queue.
    pub fn is_busy(&self) -> bool {
        self.pending.load(Ordering::SeqCst) > 0
    }

    pub fn active_run_id(&self) -> Option<String> {
        lock(&self.active).clone()
    }

    /// Set the cancellation flag if `run_id` is the active run.
    pub fn request_cancel(&self, run_id: &str) -> bool {
        let active = lock(&self.active);
        if active.as_deref() != Some(run_id) {
            return false;
        }
        self.cancel.set();
        tracing::info!(run_id = %run_id, "Cancellation requested");
        true
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }
}

/// Proof that a run holds the queue. Releasing it frees the queue for the
/// next place in line.
pub struct RunSlot<'a> {
    queue: &'a RunQueue,
    _turn: Turn,
}

impl RunSlot<'_> {
    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.queue.cancel
    }
}

impl Drop for RunSlot<'_> {
    fn drop(&mut self) {
        *lock(&self.queue.active) = None;
        self.queue.cancel.clear();
    }
}
