//! Typed error and warning records for the summarizer.
//!
//! The canonical failure messages are part of the public contract: hosts
//! match on `generateSummaryFailure`, `summaryOpWaitTimeout`,
//! `summaryAckWaitTimeout`, and `summaryNack` exactly as rendered here.

use thiserror::Error;

/// Why a single summarize attempt produced `false`.
///
/// Every failure is non-terminal on its own; only the exhaustion of all
/// three attempts in one escalation window stops the run.
#[derive(Debug, Clone, Error)]
pub enum SummarizeFailure {
    /// The generator threw, or reported the op was never submitted.
    #[error("generateSummaryFailure")]
    GenerateSummaryFailure { detail: Option<String> },

    /// The proposal broadcast was not observed within the ack-wait window.
    #[error("summaryOpWaitTimeout")]
    SummaryOpWaitTimeout,

    /// The broadcast was observed, but no ack or nack arrived in the window.
    #[error("summaryAckWaitTimeout")]
    SummaryAckWaitTimeout,

    /// Explicit server rejection.
    #[error("summaryNack")]
    SummaryNack { message: Option<String> },
}

impl SummarizeFailure {
    /// The canonical message for this failure.
    pub fn canonical_message(&self) -> &'static str {
        match self {
            SummarizeFailure::GenerateSummaryFailure { .. } => "generateSummaryFailure",
            SummarizeFailure::SummaryOpWaitTimeout => "summaryOpWaitTimeout",
            SummarizeFailure::SummaryAckWaitTimeout => "summaryAckWaitTimeout",
            SummarizeFailure::SummaryNack { .. } => "summaryNack",
        }
    }

    /// Detail beyond the canonical message, when the collaborator supplied one.
    pub fn detail(&self) -> Option<&str> {
        match self {
            SummarizeFailure::GenerateSummaryFailure { detail } => detail.as_deref(),
            SummarizeFailure::SummaryNack { message } => message.as_deref(),
            _ => None,
        }
    }
}

/// Warning record emitted upward while summarizing.
///
/// Warnings are non-terminal; the host may ignore them. `logged` reports
/// whether the core already wrote detail to its own log so the host can
/// decide whether to re-log.
#[derive(Debug, Clone)]
pub struct SummarizingWarning {
    /// Always `"summarizingError"`.
    pub error_type: &'static str,
    /// The canonical failure message.
    pub message: String,
    pub logged: bool,
}

impl SummarizingWarning {
    pub fn new(message: impl Into<String>, logged: bool) -> Self {
        Self {
            error_type: "summarizingError",
            message: message.into(),
            logged,
        }
    }
}

impl From<&SummarizeFailure> for SummarizingWarning {
    fn from(failure: &SummarizeFailure) -> Self {
        SummarizingWarning::new(failure.canonical_message(), true)
    }
}
