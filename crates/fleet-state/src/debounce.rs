//! Debounce coalescer.
//!
//! Wraps an async action so that a burst of triggers runs it once, after the
//! quiet period has elapsed with no further trigger.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;

type Action = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default)]
struct Slot {
    generation: u64,
    pending: Option<JoinHandle<()>>,
}

/// Reusable timer + cancel + re-arm primitive.
///
/// Must be triggered from within a tokio runtime. Dropping the debouncer
/// cancels a pending run.
pub struct Debouncer {
    quiet: Duration,
    action: Action,
    slot: Arc<Mutex<Slot>>,
}

impl Debouncer {
    pub fn new<F, Fut>(quiet: Duration, action: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let action: Action = Arc::new(move || -> BoxFuture<'static, ()> { Box::pin(action()) });
        Self { quiet, action, slot: Arc::new(Mutex::new(Slot::default())) }
    }

    /// Requests a run, resetting the quiet period.
    pub fn trigger(&self) {
        let mut slot = lock(&self.slot);
        slot.generation = slot.generation.wrapping_add(1);
        if let Some(pending) = slot.pending.take() {
            pending.abort();
        }

        let generation = slot.generation;
        let quiet = self.quiet;
        let action = Arc::clone(&self.action);
        let shared = Arc::clone(&self.slot);

        slot.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(quiet).await;
            {
                let mut slot = lock(&shared);
                if slot.generation != generation {
                    return;
                }
                // once running, the action is no longer cancellable by re-arming
                slot.pending = None;
            }
            action().await;
        }));
    }

    /// Runs the action now, discarding any pending timer.
    pub async fn flush(&self) {
        self.cancel();
        (self.action)().await;
    }

    /// Cancels a pending run. Returns whether one was pending.
    pub fn cancel(&self) -> bool {
        let mut slot = lock(&self.slot);
        slot.generation = slot.generation.wrapping_add(1);
        slot.pending.take().is_some_and(|pending| {
            pending.abort();
            true
        })
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        lock(&self.slot).pending.as_ref().is_some_and(|pending| !pending.is_finished())
    }

    #[must_use]
    pub const fn quiet(&self) -> Duration {
        self.quiet
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for Debouncer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Debouncer")
            .field("quiet", &self.quiet)
            .field("pending", &self.is_pending())
            .finish_non_exhaustive()
    }
}

fn lock(slot: &Mutex<Slot>) -> MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}
