//! Error types for the edgequake-ocr library.
//!
//! Two distinct error types reflect two distinct failure scopes:
//!
//! * [`PipelineError`] — **Job-level**: the job cannot start or cannot
//!   continue at all (missing input file, corrupt PDF, output directory not
//!   writable, rasteriser failure). The orchestrator records it in the
//!   job's error log and ends the job in `Error`.
//!
//! * [`BatchError`] — **Request-level**: one model request for one half of
//!   one batch failed. These are classified by [`BatchError::class`] into
//!   retryable and fatal so the [`crate::pipeline::retry::RetryPolicy`]
//!   knows whether another attempt can help.
//!
//! Cancellation is modelled as [`BatchError::Cancelled`] so it can travel
//! through the same `Result` plumbing, but it is never reported as a
//! failure.

use std::path::PathBuf;
use thiserror::Error;

/// Job-level failures.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("PDF file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The file exists and was read, but is not a PDF.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    // ── PDF errors ────────────────────────────────────────────────────────
    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF '{path}' is corrupt: {detail}")]
    CorruptPdf { path: PathBuf, detail: String },

    /// Requested pages do not exist in the document.
    #[error("Page range {start}-{end} is out of range (document has {total} pages)")]
    PageOutOfRange { start: u32, end: u32, total: u32 },

    /// The rasteriser failed for a specific page.
    #[error("Rasterisation failed for page {page}: {detail}")]
    RasterisationFailed { page: u32, detail: String },

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\
Set PDFIUM_LIB_PATH=/path/to/libpdfium or install pdfium system-wide."
    )]
    PdfiumBindingFailed(String),

    // ── Model errors ──────────────────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("Vision model provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write the output directory, markdown or figures.
    #[error("Failed to write output '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error (task panicked, runtime failure).
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Whether another attempt may succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient: network, timeout, rate limit, bad structured output, 5xx.
    Retryable,
    /// Retries cannot fix it: auth, malformed request, status below threshold.
    Fatal,
}

/// A failed model request for one half of a batch.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum BatchError {
    /// Connection reset, DNS failure, truncated stream.
    #[error("network error: {0}")]
    Network(String),

    /// The call exceeded the per-request timeout.
    #[error("request timed out after {secs}s")]
    Timeout { secs: u64 },

    /// HTTP 429 from the provider.
    #[error("rate limit exceeded{}", .retry_after_secs.map(|s| format!(" (retry after {s}s)")).unwrap_or_default())]
    RateLimited { retry_after_secs: Option<u64> },

    /// Any other non-success HTTP status.
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// The structured (JSON) response did not match the region schema.
    #[error("response failed schema validation: {0}")]
    SchemaValidation(String),

    /// 401/403 — the API key is missing, invalid, or lacks access.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// 400 — the request itself is wrong (bad model id, oversized payload).
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// Cooperative shutdown signal, not a failure.
    #[error("operation cancelled")]
    Cancelled,
}

impl BatchError {
    /// Map an HTTP status and response body onto the taxonomy.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            400 => BatchError::MalformedRequest(message),
            401 | 403 => BatchError::Auth(message),
            429 => BatchError::RateLimited {
                retry_after_secs: None,
            },
            _ => BatchError::Http { status, message },
        }
    }

    /// Classify the error. `Http` errors are retryable only when their status
    /// is at or above `min_http_error_code`.
    ///
    /// `Cancelled` is reported as fatal so that nothing retries it; callers
    /// check [`BatchError::is_cancelled`] first.
    pub fn class(&self, min_http_error_code: u16) -> ErrorClass {
        match self {
            BatchError::Network(_)
            | BatchError::Timeout { .. }
            | BatchError::RateLimited { .. }
            | BatchError::SchemaValidation(_) => ErrorClass::Retryable,
            BatchError::Http { status, .. } if *status >= min_http_error_code => {
                ErrorClass::Retryable
            }
            BatchError::Http { .. }
            | BatchError::Auth(_)
            | BatchError::MalformedRequest(_)
            | BatchError::Cancelled => ErrorClass::Fatal,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, BatchError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert!(matches!(
            BatchError::from_status(401, "bad key"),
            BatchError::Auth(_)
        ));
        assert!(matches!(
            BatchError::from_status(403, "forbidden"),
            BatchError::Auth(_)
        ));
        assert!(matches!(
            BatchError::from_status(400, "bad"),
            BatchError::MalformedRequest(_)
        ));
        assert!(matches!(
            BatchError::from_status(429, ""),
            BatchError::RateLimited { .. }
        ));
        assert!(matches!(
            BatchError::from_status(503, "overloaded"),
            BatchError::Http { status: 503, .. }
        ));
    }

    #[test]
    fn http_threshold_decides_class() {
        let e = BatchError::from_status(503, "overloaded");
        assert_eq!(e.class(400), ErrorClass::Retryable);
        assert_eq!(e.class(600), ErrorClass::Fatal);

        let redirect = BatchError::Http {
            status: 302,
            message: "moved".into(),
        };
        assert_eq!(redirect.class(400), ErrorClass::Fatal);
    }

    #[test]
    fn transient_errors_are_retryable() {
        for e in [
            BatchError::Network("reset".into()),
            BatchError::Timeout { secs: 30 },
            BatchError::RateLimited {
                retry_after_secs: Some(5),
            },
            BatchError::SchemaValidation("missing field `regions`".into()),
        ] {
            assert_eq!(e.class(400), ErrorClass::Retryable, "{e}");
        }
    }

    #[test]
    fn auth_and_malformed_are_fatal() {
        assert_eq!(BatchError::Auth("x".into()).class(400), ErrorClass::Fatal);
        assert_eq!(
            BatchError::MalformedRequest("x".into()).class(400),
            ErrorClass::Fatal
        );
    }

    #[test]
    fn rate_limit_display_with_retry() {
        let e = BatchError::RateLimited {
            retry_after_secs: Some(60),
        };
        assert!(e.to_string().contains("60s"));
    }

    #[test]
    fn page_out_of_range_display() {
        let e = PipelineError::PageOutOfRange {
            start: 5,
            end: 9,
            total: 3,
        };
        let msg = e.to_string();
        assert!(msg.contains("5-9"), "got: {msg}");
        assert!(msg.contains("3 pages"), "got: {msg}");
    }
}
