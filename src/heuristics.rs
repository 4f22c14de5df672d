//! Heuristic clock deciding when a summarize should be triggered.
//!
//! The heuristics own the idle timer and the last-attempted / last-acked
//! bookkeeping. The owner updates `last_op_seq_number` before calling
//! [`SummarizeHeuristics::run`] on each op; `run` then either triggers a
//! summarize (time pressure before op pressure) or re-arms the idle timer.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::timers::Timer;

/// Hard cap on the ack-wait window regardless of configuration.
pub const MAX_ACK_WAIT_CAP: Duration = Duration::from_millis(120_000);

/// Ops of uncommitted lag above which a departing parent still gets a final
/// summary attempt.
pub const LAST_SUMMARY_OP_LAG: u64 = 50;

/// Immutable per-run tuning for the heuristic clock.
#[derive(Debug, Clone)]
pub struct SummaryConfiguration {
    /// Quiet period after the last op before an idle summary fires.
    pub idle_time: Duration,
    /// Maximum wall time between acked summaries.
    pub max_time: Duration,
    /// Maximum unsummarized ops between acked summaries.
    pub max_ops: u64,
    /// How long to wait for broadcast plus ack before giving up on an
    /// attempt. Clamped to [`MAX_ACK_WAIT_CAP`].
    pub max_ack_wait_time: Duration,
}

impl Default for SummaryConfiguration {
    fn default() -> Self {
        Self {
            idle_time: Duration::from_millis(5_000),
            max_time: Duration::from_millis(60_000),
            max_ops: 1_000,
            max_ack_wait_time: Duration::from_millis(120_000),
        }
    }
}

impl SummaryConfiguration {
    /// The ack-wait window actually applied to an attempt.
    pub fn effective_ack_wait(&self) -> Duration {
        self.max_ack_wait_time.min(MAX_ACK_WAIT_CAP)
    }
}

/// One summary attempt, as tracked by the heuristics.
#[derive(Debug, Clone)]
pub struct SummaryAttempt {
    /// Stream position the summary was taken against.
    pub ref_sequence_number: u64,
    /// When the attempt was submitted or synthesized.
    pub summary_time: Instant,
    /// Position the server assigned the summarize op once broadcast.
    pub summary_sequence_number: Option<u64>,
}

impl SummaryAttempt {
    pub fn new(ref_sequence_number: u64) -> Self {
        Self {
            ref_sequence_number,
            summary_time: Instant::now(),
            summary_sequence_number: None,
        }
    }
}

/// Why a summarize was triggered. Used for telemetry and retry dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SummarizeReason {
    Idle,
    MaxTime,
    MaxOps,
    /// Best-effort final summary while the parent is leaving.
    LastSummary,
    Retry1,
    Retry2,
    /// A save op demanded an immediate summary.
    Save { client_id: String, contents: String },
}

impl fmt::Display for SummarizeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SummarizeReason::Idle => write!(f, "idle"),
            SummarizeReason::MaxTime => write!(f, "maxTime"),
            SummarizeReason::MaxOps => write!(f, "maxOps"),
            SummarizeReason::LastSummary => write!(f, "lastSummary"),
            SummarizeReason::Retry1 => write!(f, "retry1"),
            SummarizeReason::Retry2 => write!(f, "retry2"),
            SummarizeReason::Save { client_id, contents } => {
                write!(f, "save;{}: {}", client_id, contents)
            }
        }
    }
}

/// Callback invoked when the heuristics decide a summarize is due.
///
/// The callback runs on whichever task evaluated the clock, including the
/// idle timer's. It must stay cheap and non-blocking; posting the reason to
/// the owner's queue is the expected shape.
pub type TriggerFn = Arc<dyn Fn(SummarizeReason) + Send + Sync>;

/// The heuristic clock itself.
pub struct SummarizeHeuristics {
    configuration: SummaryConfiguration,
    trigger: TriggerFn,
    /// Latest op position seen on the stream. Updated by the owner before
    /// each `run`.
    pub last_op_seq_number: u64,
    last_attempted: SummaryAttempt,
    last_acked: SummaryAttempt,
    idle_timer: Timer,
    /// Set by the owner while an attempt is in flight. The idle timer stays
    /// unarmed for the whole window; pressure triggers still fire and are
    /// coalesced by the owner.
    attempt_in_flight: Arc<AtomicBool>,
}

impl SummarizeHeuristics {
    pub fn new(
        configuration: SummaryConfiguration,
        trigger: TriggerFn,
        last_op_seq_number: u64,
        first_ack: SummaryAttempt,
        attempt_in_flight: Arc<AtomicBool>,
    ) -> Self {
        Self {
            configuration,
            trigger,
            last_op_seq_number,
            last_attempted: first_ack.clone(),
            last_acked: first_ack,
            idle_timer: Timer::new(),
            attempt_in_flight,
        }
    }

    pub fn configuration(&self) -> &SummaryConfiguration {
        &self.configuration
    }

    pub fn last_attempted(&self) -> &SummaryAttempt {
        &self.last_attempted
    }

    pub fn last_acked(&self) -> &SummaryAttempt {
        &self.last_acked
    }

    /// Reset both attempt records, after startup resynchronization found the
    /// latest acked summary on the stream.
    pub fn initialize(&mut self, attempt: SummaryAttempt) {
        self.last_attempted = attempt.clone();
        self.last_acked = attempt;
    }

    /// Record that an attempt was made against `ref_seq` (or the latest op
    /// position when the generator never reported one). Runs whether or not
    /// the generator succeeded, so the attempt clock moves even on failure.
    pub fn record_attempt(&mut self, ref_seq: Option<u64>) {
        self.last_attempted = SummaryAttempt {
            ref_sequence_number: ref_seq.unwrap_or(self.last_op_seq_number),
            summary_time: Instant::now(),
            summary_sequence_number: None,
        };
    }

    /// The server assigned the broadcast summarize op its stream position.
    pub fn set_attempt_summary_sequence_number(&mut self, seq: u64) {
        self.last_attempted.summary_sequence_number = Some(seq);
    }

    /// The last attempt was acked; it becomes the committed baseline.
    pub fn ack_last_sent(&mut self) {
        self.last_acked = self.last_attempted.clone();
    }

    /// Unsummarized ops since the last acked summary.
    pub fn ops_since_last_ack(&self) -> u64 {
        self.last_op_seq_number
            .saturating_sub(self.last_acked.ref_sequence_number)
    }

    /// Evaluate the clock. Time pressure is checked before op pressure; when
    /// neither has built up, the idle timer is re-armed.
    pub fn run(&mut self) {
        self.idle_timer.clear();

        let elapsed = self.last_acked.summary_time.elapsed();
        let op_lag = self.ops_since_last_ack();

        if elapsed > self.configuration.max_time {
            (self.trigger)(SummarizeReason::MaxTime);
        } else if op_lag > self.configuration.max_ops {
            (self.trigger)(SummarizeReason::MaxOps);
        } else if !self.attempt_in_flight.load(Ordering::Acquire) {
            let trigger = Arc::clone(&self.trigger);
            self.idle_timer
                .restart(self.configuration.idle_time, move || {
                    trigger(SummarizeReason::Idle)
                });
        }
    }

    /// Whether the idle timer is currently armed.
    pub fn idle_timer_armed(&self) -> bool {
        self.idle_timer.has_timer()
    }

    /// Cancel any pending idle firing without evaluating the clock.
    pub fn clear_idle_timer(&self) {
        self.idle_timer.clear();
    }

    /// Cancel the idle timer without evaluating.
    pub fn dispose(&mut self) {
        self.idle_timer.clear();
    }
}
