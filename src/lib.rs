//! Scrivener: the summarizer agent of a collaborative-document runtime.
//!
//! A scrivener instance observes the ordered op stream of a live document
//! and periodically produces a summary: a compacted snapshot of document
//! state identified by a storage handle, submitted through the ordering
//! service and confirmed by an acknowledgement on that same stream.
//!
//! The crate covers the heuristic clock deciding when to summarize, the
//! attempt state machine (generate, await broadcast, await ack or nack),
//! the three-attempt retry escalation, single-flight enforcement with
//! trigger coalescing, and cooperative lifecycle with a parent client that
//! may be revoked mid-flight. Building summary trees, storing blobs, and
//! electing the summarizer client stay with the host, behind the
//! [`generator::SummaryGenerator`] and [`runtime::SummarizerRuntime`]
//! contracts.

pub mod collection;
pub mod coordinator;
pub mod errors;
pub mod generator;
pub mod heuristics;
pub mod protocol;
pub mod runtime;
pub mod running;
pub mod summarizer;
pub mod timers;

pub use collection::{AckNack, AckedSummary, SummaryCollection, SummaryWatcher};
pub use coordinator::{RunCoordinator, StopReason};
pub use errors::{SummarizeFailure, SummarizingWarning};
pub use generator::{
    GenerateSummaryData, RefreshError, SummaryGenerationOptions, SummaryGenerator, SummaryLogger,
    SummaryStats, SummarizeOptions,
};
pub use heuristics::{
    SummarizeHeuristics, SummarizeReason, SummaryAttempt, SummaryConfiguration,
};
pub use protocol::{AckNackContents, OpEvent, OpType, SequencedOp, SummarizeContents};
pub use runtime::{CloseFn, DeltaManagerHandle, SummarizerRuntime};
pub use running::{RunningSummarizer, RunningSummarizerParams};
pub use summarizer::{Summarizer, SummarizerResponse};
pub use timers::{PromiseTimer, Timer, TimerLapse};
