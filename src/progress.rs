//! Progress-callback trait for batch conversion events.
//!
//! Pass an [`Arc<dyn ProcessingCallback>`] to
//! [`crate::processor::DocumentProcessor::run`] to receive events as the
//! pipeline works through a document. This is the only surface the pipeline
//! exposes to UI and CLI layers; it never holds a reference to a concrete UI
//! object.
//!
//! All calls are fire-and-forget: methods are synchronous, take `&self`, and
//! the pipeline does not wait on anything they do. Implementations must
//! return promptly. When an event needs to reach another thread or an async
//! consumer, use [`ChannelCallback`], which only pushes into an unbounded
//! channel.
//!
//! # Example
//!
//! ```rust
//! use edgequake_ocr::{ProcessingCallback, Severity};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! struct ErrorCounter(AtomicUsize);
//!
//! impl ProcessingCallback for ErrorCounter {
//!     fn on_error(&self, message: &str, severity: Severity) {
//!         self.0.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("[{severity:?}] {message}");
//!     }
//! }
//! ```

use crate::job::JobStats;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

/// How bad a reported error is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    /// Something was retried or skipped; the batch may still succeed.
    Warning,
    /// Half of a batch was lost; the job continues.
    Error,
    /// The job is aborting.
    Fatal,
}

/// Receives pipeline events. Every method has a no-op default.
///
/// # Thread safety
///
/// The text and figure subtasks of a batch run concurrently, so
/// `on_progress_update` and `on_error` may interleave. Implementations must
/// protect shared mutable state with appropriate synchronisation.
pub trait ProcessingCallback: Send + Sync {
    /// Called before the two model requests of a batch are sent.
    ///
    /// `batch_num` is 0-based.
    fn on_batch_start(&self, batch_num: usize, total_batches: usize, page_count: usize) {
        let _ = (batch_num, total_batches, page_count);
    }

    /// Streamed text extraction progress: the most recent part of the
    /// accumulating text and the running output-token count.
    fn on_progress_update(&self, text_tail: &str, output_tokens: u64) {
        let _ = (text_tail, output_tokens);
    }

    /// A figure was cropped and written to `path`.
    fn on_image_extracted(&self, path: &Path, fig_num: u32) {
        let _ = (path, fig_num);
    }

    /// Something went wrong. The message names the batch and subtask.
    fn on_error(&self, message: &str, severity: Severity) {
        let _ = (message, severity);
    }

    /// A page was rasterised (`done` of `total` pages in the job).
    fn on_page_convert(&self, done: usize, total: usize) {
        let _ = (done, total);
    }

    /// Token usage committed for a finished batch.
    fn on_page_tokens(&self, batch_num: usize, input_tokens: u64, output_tokens: u64) {
        let _ = (batch_num, input_tokens, output_tokens);
    }

    /// Called once when the job reaches a terminal state.
    fn on_complete(&self, stats: &JobStats) {
        let _ = stats;
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopCallback;

impl ProcessingCallback for NoopCallback {}

/// Convenience alias for the shared callback handle.
pub type CallbackHandle = Arc<dyn ProcessingCallback>;

/// Owned form of every callback, for channel-based consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProgressEvent {
    BatchStart {
        batch_num: usize,
        total_batches: usize,
        page_count: usize,
    },
    Progress {
        text_tail: String,
        output_tokens: u64,
    },
    ImageExtracted {
        path: PathBuf,
        fig_num: u32,
    },
    Error {
        message: String,
        severity: Severity,
    },
    PageConvert {
        done: usize,
        total: usize,
    },
    PageTokens {
        batch_num: usize,
        input_tokens: u64,
        output_tokens: u64,
    },
    Complete(JobStats),
}

/// Forwards every event into an unbounded tokio channel.
///
/// Sending never blocks or awaits; if the receiver has been dropped the
/// event is discarded.
#[derive(Debug, Clone)]
pub struct ChannelCallback {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelCallback {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: ProgressEvent) {
        let _ = self.tx.send(event);
    }
}

impl ProcessingCallback for ChannelCallback {
    fn on_batch_start(&self, batch_num: usize, total_batches: usize, page_count: usize) {
        self.send(ProgressEvent::BatchStart {
            batch_num,
            total_batches,
            page_count,
        });
    }

    fn on_progress_update(&self, text_tail: &str, output_tokens: u64) {
        self.send(ProgressEvent::Progress {
            text_tail: text_tail.to_string(),
            output_tokens,
        });
    }

    fn on_image_extracted(&self, path: &Path, fig_num: u32) {
        self.send(ProgressEvent::ImageExtracted {
            path: path.to_path_buf(),
            fig_num,
        });
    }

    fn on_error(&self, message: &str, severity: Severity) {
        self.send(ProgressEvent::Error {
            message: message.to_string(),
            severity,
        });
    }

    fn on_page_convert(&self, done: usize, total: usize) {
        self.send(ProgressEvent::PageConvert { done, total });
    }

    fn on_page_tokens(&self, batch_num: usize, input_tokens: u64, output_tokens: u64) {
        self.send(ProgressEvent::PageTokens {
            batch_num,
            input_tokens,
            output_tokens,
        });
    }

    fn on_complete(&self, stats: &JobStats) {
        self.send(ProgressEvent::Complete(stats.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TrackingCallback {
        batches: AtomicUsize,
        errors: AtomicUsize,
    }

    impl ProcessingCallback for TrackingCallback {
        fn on_batch_start(&self, _batch_num: usize, _total: usize, _pages: usize) {
            self.batches.fetch_add(1, Ordering::SeqCst);
        }

        fn on_error(&self, _message: &str, _severity: Severity) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopCallback;
        cb.on_batch_start(0, 3, 10);
        cb.on_progress_update("tail", 12);
        cb.on_image_extracted(Path::new("images/1_fig1.png"), 1);
        cb.on_error("boom", Severity::Warning);
        cb.on_page_convert(1, 10);
        cb.on_page_tokens(0, 100, 50);
        cb.on_complete(&JobStats::default());
    }

    #[test]
    fn overridden_methods_receive_events() {
        let cb = TrackingCallback {
            batches: AtomicUsize::new(0),
            errors: AtomicUsize::new(0),
        };
        cb.on_batch_start(0, 2, 10);
        cb.on_batch_start(1, 2, 5);
        cb.on_error("batch 2 figures: rate limit", Severity::Error);
        cb.on_progress_update("ignored", 1);
        assert_eq!(cb.batches.load(Ordering::SeqCst), 2);
        assert_eq!(cb.errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn channel_callback_forwards_in_order() {
        let (cb, mut rx) = ChannelCallback::new();
        cb.on_page_convert(1, 2);
        cb.on_image_extracted(Path::new("3_fig1.png"), 1);
        assert_eq!(
            rx.try_recv().unwrap(),
            ProgressEvent::PageConvert { done: 1, total: 2 }
        );
        assert!(matches!(
            rx.try_recv().unwrap(),
            ProgressEvent::ImageExtracted { fig_num: 1, .. }
        ));
    }

    #[test]
    fn channel_callback_survives_dropped_receiver() {
        let (cb, rx) = ChannelCallback::new();
        drop(rx);
        cb.on_error("nobody listening", Severity::Fatal);
    }

    #[test]
    fn arc_dyn_callback_is_send_sync() {
        fn assert_send_sync<T: Send + Sync + ?Sized>() {}
        assert_send_sync::<dyn ProcessingCallback>();
        let cb: CallbackHandle = Arc::new(NoopCallback);
        cb.on_batch_start(0, 1, 1);
    }
}
