//! Collaborator contract for building and committing summary trees.
//!
//! The summarizer core never touches storage itself. It asks the generator
//! to build and submit a summary, then watches the stream for the outcome.
//! The generator also exposes the rebase hook the facade's ack-refresh loop
//! drives once per observed ack.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

/// Knobs for a single attempt. The escalation policy owns these: the first
/// attempt runs with both off, retry1 refreshes the latest ack, retry2 also
/// regenerates the full tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SummarizeOptions {
    /// Regenerate the whole tree instead of reusing unchanged subtree handles.
    pub full_tree: bool,
    /// Re-fetch the latest acked summary before generating.
    pub refresh_latest_ack: bool,
}

/// Correlation context threaded through generator calls and telemetry.
///
/// One logger value exists per attempt; its fields tie generator-side events
/// to the core's own records for the same attempt.
#[derive(Debug, Clone)]
pub struct SummaryLogger {
    run_id: Uuid,
    client_id: String,
    summarize_count: u64,
    reason: String,
}

impl SummaryLogger {
    pub fn new(client_id: impl Into<String>, summarize_count: u64, reason: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            client_id: client_id.into(),
            summarize_count,
            reason: reason.into(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn summarize_count(&self) -> u64 {
        self.summarize_count
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Log a progress event for this attempt.
    pub fn event(&self, name: &str) {
        info!(
            target: "scrivener::summarize",
            run_id = %self.run_id,
            client_id = %self.client_id,
            summarize_count = self.summarize_count,
            reason = %self.reason,
            event = name,
        );
    }

    /// Log a non-fatal problem for this attempt.
    pub fn error(&self, name: &str, detail: &str) {
        warn!(
            target: "scrivener::summarize",
            run_id = %self.run_id,
            client_id = %self.client_id,
            summarize_count = self.summarize_count,
            reason = %self.reason,
            event = name,
            detail,
        );
    }
}

/// Size accounting for a generated summary tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryStats {
    pub tree_node_count: u64,
    pub blob_node_count: u64,
    /// Subtrees submitted as handles to unchanged previous content.
    pub handle_node_count: u64,
    pub total_blob_size: u64,
}

/// What the generator did for one attempt.
#[derive(Debug, Clone, Default)]
pub struct GenerateSummaryData {
    /// Stream position the summary was taken against.
    pub reference_sequence_number: u64,
    /// Whether the summarize op actually went out. When false the ack-wait
    /// phase is skipped and the attempt fails immediately.
    pub submitted: bool,
    /// Local submission id of the summarize op, used to spot its echo.
    pub client_sequence_number: u64,
    pub summary_stats: SummaryStats,
    /// Generator-side failure detail when `submitted` is false.
    pub error: Option<String>,
}

/// Inputs to one generation attempt.
#[derive(Debug, Clone)]
pub struct SummaryGenerationOptions {
    pub options: SummarizeOptions,
    pub logger: SummaryLogger,
}

/// Failure from the ack-refresh hook. Non-fatal errors are logged and the
/// refresh loop keeps going; a fatal one ends the loop and stops the run.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct RefreshError {
    pub message: String,
    pub fatal: bool,
}

impl RefreshError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: false,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: true,
        }
    }
}

/// The external summary builder.
#[async_trait]
pub trait SummaryGenerator: Send + Sync {
    /// Build a summary of current document state and submit the summarize op
    /// through the ordering service.
    async fn generate_summary(
        &self,
        options: SummaryGenerationOptions,
    ) -> Result<GenerateSummaryData>;

    /// Rebase the host's in-memory tree onto the latest committed summary.
    /// Called once per ack observed by the facade's refresh loop.
    async fn refresh_latest_summary_ack(
        &self,
        proposal_handle: Option<String>,
        ack_handle: Option<String>,
        logger: SummaryLogger,
    ) -> Result<(), RefreshError>;
}
