//! Job bookkeeping: status machine, error log, batch results and stats.
//!
//! [`JobState`] is owned exclusively by the orchestrator for the whole run
//! and handed back to the caller once it reaches a terminal status. It is
//! `Serialize` so the CLI can print it with `--json`.

use crate::pipeline::context::{HeaderEntry, HeaderStack};
use crate::pipeline::figures::ExtractedImage;
use crate::pipeline::plan::BatchSpan;
use crate::progress::Severity;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Processing,
    Cancelled,
    Completed,
    CompletedWithErrors,
    Error,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Pending | JobStatus::Processing)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Completed => "completed",
            JobStatus::CompletedWithErrors => "completed with errors",
            JobStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Which half of a batch an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Subtask {
    Text,
    Figures,
}

impl fmt::Display for Subtask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Subtask::Text => "text",
            Subtask::Figures => "figures",
        })
    }
}

/// One entry in the job's error log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// `None` for job-level failures (validation, rendering, output).
    pub batch_num: Option<usize>,
    pub subtask: Option<Subtask>,
    pub message: String,
    pub severity: Severity,
}

impl ErrorRecord {
    /// Human-readable line naming the batch (1-based) and subtask.
    pub fn describe(&self) -> String {
        match (self.batch_num, self.subtask) {
            (Some(b), Some(s)) => format!("batch {} {s}: {}", b + 1, self.message),
            (Some(b), None) => format!("batch {}: {}", b + 1, self.message),
            _ => self.message.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchStatus {
    Success,
    /// One half failed after retries; the other half was committed.
    PartialFailure,
    /// A non-retryable error; nothing from the batch was committed.
    FatalFailure,
    /// The job was cancelled while the batch was in flight.
    Cancelled,
}

/// Everything one batch produced, returned by value to the orchestrator.
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub span: BatchSpan,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// `None` when the text half failed.
    pub markdown_text: Option<String>,
    pub new_header_entries: Vec<HeaderEntry>,
    pub extracted_images: Vec<ExtractedImage>,
    pub status: BatchStatus,
}

/// Summary handed to `on_complete` and printed by the CLI.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobStats {
    pub total_batches: usize,
    pub batches_processed: usize,
    pub pages_converted: usize,
    pub images_extracted: usize,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub errors: usize,
    pub elapsed_ms: u64,
}

/// The full state of one conversion job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobState {
    pub id: Uuid,
    pub source_path: PathBuf,
    pub output_dir: PathBuf,
    pub batch_plan: Vec<BatchSpan>,
    /// Index into `batch_plan` of the batch being (or last) processed.
    pub current_batch_index: usize,
    pub header_stack: HeaderStack,
    pub accumulated_cost: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub pages_converted: usize,
    pub images_extracted: usize,
    pub status: JobStatus,
    pub error_log: Vec<ErrorRecord>,
    pub elapsed_ms: u64,
}

impl JobState {
    pub fn new(source_path: PathBuf, output_dir: PathBuf) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_path,
            output_dir,
            batch_plan: Vec::new(),
            current_batch_index: 0,
            header_stack: HeaderStack::new(),
            accumulated_cost: 0.0,
            input_tokens: 0,
            output_tokens: 0,
            pages_converted: 0,
            images_extracted: 0,
            status: JobStatus::Pending,
            error_log: Vec::new(),
            elapsed_ms: 0,
        }
    }

    /// Move to `to`. Terminal states never change; the attempt is refused
    /// and logged.
    pub fn transition(&mut self, to: JobStatus) -> bool {
        if self.status.is_terminal() {
            warn!(job = %self.id, from = %self.status, to = %to, "refusing to leave terminal state");
            return false;
        }
        self.status = to;
        true
    }

    pub fn record_error(
        &mut self,
        batch_num: Option<usize>,
        subtask: Option<Subtask>,
        message: impl Into<String>,
        severity: Severity,
    ) -> &ErrorRecord {
        self.error_log.push(ErrorRecord {
            batch_num,
            subtask,
            message: message.into(),
            severity,
        });
        &self.error_log[self.error_log.len() - 1]
    }

    /// `true` once anything was written to the error log at `Error` severity
    /// or above.
    pub fn has_batch_errors(&self) -> bool {
        self.error_log
            .iter()
            .any(|e| matches!(e.severity, Severity::Error | Severity::Fatal))
    }

    pub fn stats(&self, batches_processed: usize) -> JobStats {
        JobStats {
            total_batches: self.batch_plan.len(),
            batches_processed,
            pages_converted: self.pages_converted,
            images_extracted: self.images_extracted,
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            cost_usd: self.accumulated_cost,
            errors: self
                .error_log
                .iter()
                .filter(|e| e.severity != Severity::Warning)
                .count(),
            elapsed_ms: self.elapsed_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> JobState {
        JobState::new("doc.pdf".into(), "doc_converted".into())
    }

    #[test]
    fn normal_lifecycle() {
        let mut j = job();
        assert_eq!(j.status, JobStatus::Pending);
        assert!(j.transition(JobStatus::Processing));
        assert!(j.transition(JobStatus::Completed));
        assert!(j.status.is_terminal());
    }

    #[test]
    fn terminal_states_are_final() {
        for terminal in [
            JobStatus::Cancelled,
            JobStatus::Completed,
            JobStatus::CompletedWithErrors,
            JobStatus::Error,
        ] {
            let mut j = job();
            j.transition(JobStatus::Processing);
            j.transition(terminal);
            assert!(!j.transition(JobStatus::Processing));
            assert!(!j.transition(JobStatus::Completed));
            assert_eq!(j.status, terminal);
        }
    }

    #[test]
    fn error_records_describe_batch_one_based() {
        let mut j = job();
        let rec = j.record_error(Some(1), Some(Subtask::Figures), "rate limit", Severity::Error);
        assert_eq!(rec.describe(), "batch 2 figures: rate limit");
        assert!(j.has_batch_errors());
    }

    #[test]
    fn warnings_do_not_count_as_errors() {
        let mut j = job();
        j.record_error(Some(0), Some(Subtask::Text), "retrying", Severity::Warning);
        assert!(!j.has_batch_errors());
        assert_eq!(j.stats(1).errors, 0);
    }

    #[test]
    fn job_state_serialises() {
        let j = job();
        let json = serde_json::to_string(&j).unwrap();
        assert!(json.contains("\"status\":\"Pending\""));
    }
}
