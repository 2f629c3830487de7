//! Per-batch pipeline stages.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ plan ──▶ render ──▶ encode ──┬─▶ text ────▶ postprocess ─▶ context
//! (magic)  (spans)  (pdfium)   (base64)  └─▶ figures ─▶ crop
//!                                              ▲
//!                                   retry wraps every model call
//! ```
//!
//! 1. [`input`]   — reject missing, unreadable or non-PDF sources up front
//! 2. [`plan`]    — split the page range into fixed-size batches
//! 3. [`render`]  — rasterise a batch; runs in `spawn_blocking` because
//!    pdfium is not async-safe
//! 4. [`encode`]  — base64 page images for the model request, token estimates
//! 5. [`text`]    — stream the batch's markdown, with throttled progress
//! 6. [`figures`] — ask for figure regions as JSON and crop them from the pages
//! 7. [`postprocess`] — deterministic cleanup of model output
//! 8. [`context`] — heading breadcrumb carried from one batch into the next
//! 9. [`retry`]   — backoff, jitter and error classification around each call
//!
//! Sequencing, commit and job state live in [`crate::processor`].

pub mod context;
pub mod encode;
pub mod figures;
pub mod input;
pub mod plan;
pub mod postprocess;
pub mod render;
pub mod retry;
pub mod text;
