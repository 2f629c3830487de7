//! Cooperative cancellation.
//!
//! A [`CancelToken`] is a cheap, cloneable flag plus a wake-up signal. The
//! orchestrator holds one per job and derives a [`CancelToken::child`] per
//! batch: cancelling the job cancels every batch, while a fatal error inside
//! a batch can cancel just that batch's sibling subtask without touching the
//! job.

use futures::future::select_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Flag {
    cancelled: AtomicBool,
    notify: Notify,
}

impl Flag {
    fn is_set(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn set(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    async fn wait(&self) {
        loop {
            // Register interest before re-checking so a concurrent `set`
            // cannot slip between the check and the await.
            let notified = self.notify.notified();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

/// Cancellation handle shared between the caller and the pipeline.
///
/// ```rust
/// use edgequake_ocr::CancelToken;
///
/// # tokio_test::block_on(async {
/// let job = CancelToken::new();
/// let batch = job.child();
/// job.cancel();
/// batch.cancelled().await;
/// assert!(batch.is_cancelled());
/// # });
/// ```
#[derive(Debug, Clone)]
pub struct CancelToken {
    /// Own flag first, then every ancestor up to the root. Never empty.
    chain: Vec<Arc<Flag>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            chain: vec![Arc::new(Flag::default())],
        }
    }

    /// A token cancelled when either it or `self` is cancelled.
    pub fn child(&self) -> Self {
        let mut chain = Vec::with_capacity(self.chain.len() + 1);
        chain.push(Arc::new(Flag::default()));
        chain.extend(self.chain.iter().cloned());
        Self { chain }
    }

    /// Request cancellation of this token and all of its children.
    pub fn cancel(&self) {
        if let Some(own) = self.chain.first() {
            own.set();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.chain.iter().any(|f| f.is_set())
    }

    /// Resolve once this token or any ancestor is cancelled.
    pub async fn cancelled(&self) {
        let waits = self.chain.iter().map(|f| Box::pin(f.wait()));
        select_all(waits).await;
    }
}
