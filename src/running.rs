//! The running summarize state machine.
//!
//! One instance exists per elected run. It owns the heuristics, enforces the
//! single-flight invariant, and walks each trigger through the three-attempt
//! escalation: the trigger reason itself, then retry1 (refresh the latest
//! ack), then retry2 (refresh plus full tree). Exhausting all three stops
//! the whole run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::collection::{AckNack, SummaryCollection, SummaryWatcher};
use crate::coordinator::StopReason;
use crate::errors::{SummarizeFailure, SummarizingWarning};
use crate::generator::{
    SummaryGenerationOptions, SummaryGenerator, SummaryLogger, SummarizeOptions,
};
use crate::heuristics::{
    SummarizeHeuristics, SummarizeReason, SummaryAttempt, SummaryConfiguration,
    LAST_SUMMARY_OP_LAG,
};
use crate::protocol::{OpType, SequencedOp};
use crate::timers::{PromiseTimer, TimerLapse};

/// First long-summarize telemetry warning lands after this much time.
const LONG_SUMMARIZE_INITIAL_WARNING: Duration = Duration::from_secs(20);

/// Warnings re-arm with doubled duration up to this many times.
const MAX_LONG_SUMMARIZE_WARNINGS: u32 = 5;

struct Flight {
    /// Present iff an attempt is in flight. Doubles as the completion signal
    /// `wait_stop` awaits.
    summarizing: Option<watch::Sender<bool>>,
    done_rx: Option<watch::Receiver<bool>>,
    /// Coalesces triggers that arrive while an attempt is in flight.
    try_while_summarizing: bool,
    stopping: bool,
    disposed: bool,
    /// Monotonic attempt counter for correlation.
    summarize_count: u64,
}

struct Inner {
    client_id: String,
    on_behalf_of: Arc<Mutex<Option<String>>>,
    configuration: SummaryConfiguration,
    generator: Arc<dyn SummaryGenerator>,
    collection: SummaryCollection,
    watcher: SummaryWatcher,
    heuristics: Mutex<SummarizeHeuristics>,
    flight: Mutex<Flight>,
    /// Mirrors `flight.summarizing` for the heuristics, which must not arm
    /// the idle timer while an attempt is in flight.
    attempt_in_flight: Arc<AtomicBool>,
    pending_ack_timer: Arc<PromiseTimer>,
    long_summarize_warning: Mutex<Option<JoinHandle<()>>>,
    warning_tx: mpsc::Sender<SummarizingWarning>,
    stop_tx: mpsc::UnboundedSender<StopReason>,
}

/// Construction inputs for [`RunningSummarizer`].
pub struct RunningSummarizerParams {
    pub client_id: String,
    pub on_behalf_of: Arc<Mutex<Option<String>>>,
    pub configuration: SummaryConfiguration,
    pub generator: Arc<dyn SummaryGenerator>,
    pub collection: SummaryCollection,
    /// Heuristic triggers are posted here; the owner feeds them back into
    /// [`RunningSummarizer::trigger`] on its own task.
    pub trigger_tx: mpsc::UnboundedSender<SummarizeReason>,
    pub warning_tx: mpsc::Sender<SummarizingWarning>,
    /// Receives `failToSummarize` when an escalation exhausts all attempts.
    pub stop_tx: mpsc::UnboundedSender<StopReason>,
    /// Baseline attempt until startup resynchronization finds a newer ack.
    pub first_ack: SummaryAttempt,
    pub last_op_seq_number: u64,
}

pub struct RunningSummarizer {
    inner: Arc<Inner>,
}

impl RunningSummarizer {
    pub fn new(params: RunningSummarizerParams) -> Self {
        let watcher = params.collection.create_watcher(params.client_id.clone());
        let trigger_tx = params.trigger_tx;
        let trigger: Arc<dyn Fn(SummarizeReason) + Send + Sync> = Arc::new(move |reason| {
            let _ = trigger_tx.send(reason);
        });
        let attempt_in_flight = Arc::new(AtomicBool::new(false));
        let heuristics = SummarizeHeuristics::new(
            params.configuration.clone(),
            trigger,
            params.last_op_seq_number,
            params.first_ack,
            Arc::clone(&attempt_in_flight),
        );
        let pending_ack_timer =
            Arc::new(PromiseTimer::new(params.configuration.effective_ack_wait()));

        Self {
            inner: Arc::new(Inner {
                client_id: params.client_id,
                on_behalf_of: params.on_behalf_of,
                configuration: params.configuration,
                generator: params.generator,
                collection: params.collection,
                watcher,
                heuristics: Mutex::new(heuristics),
                attempt_in_flight,
                flight: Mutex::new(Flight {
                    summarizing: None,
                    done_rx: None,
                    try_while_summarizing: false,
                    stopping: false,
                    disposed: false,
                    summarize_count: 0,
                }),
                pending_ack_timer,
                long_summarize_warning: Mutex::new(None),
                warning_tx: params.warning_tx,
                stop_tx: params.stop_tx,
            }),
        }
    }

    /// Synchronize to the newest committed summary, then seed the first tick.
    ///
    /// Races the collection draining up to `flush_target` against the
    /// ack-wait window. When the flush wins and reports an ack, the
    /// heuristics baseline moves to it; when the timer wins, the baseline
    /// stays at the constructor-provided attempt, whose `summary_time` of
    /// "now" biases the first max-time check toward firing later. That bias
    /// is intentional: without an observed ack there is nothing older to
    /// measure from.
    pub async fn start(&self, flush_target: u64) {
        let inner = &self.inner;
        let timer = Arc::clone(&inner.pending_ack_timer);
        inner.collection.set_pending_ack_timeout_callback(
            inner.configuration.effective_ack_wait(),
            move || timer.clear(),
        );

        tokio::select! {
            latest = inner.watcher.wait_flushed(flush_target) => {
                if let Some(acked) = latest {
                    let attempt = SummaryAttempt {
                        ref_sequence_number: acked.summarize_op.reference_sequence_number,
                        summary_time: Instant::now(),
                        summary_sequence_number: Some(acked.summarize_op.sequence_number),
                    };
                    info!(
                        target: "scrivener::running",
                        ref_seq = attempt.ref_sequence_number,
                        "resynchronized to latest acked summary"
                    );
                    inner.heuristics.lock().expect("heuristics poisoned").initialize(attempt);
                }
            }
            _ = inner.pending_ack_timer.start() => {}
        }

        inner.pending_ack_timer.clear();
        inner.collection.unset_pending_ack_timeout_callback();
        inner.heuristics.lock().expect("heuristics poisoned").run();
    }

    /// Feed one op from the batch-end emitter. Poisoned deliveries are
    /// dropped without inspection.
    pub fn handle_op(&self, error: Option<&str>, op: &SequencedOp) {
        if error.is_some() {
            return;
        }
        let save_reason = {
            let mut heuristics = self.inner.heuristics.lock().expect("heuristics poisoned");
            heuristics.last_op_seq_number = op.sequence_number;
            if op.op_type == OpType::Save {
                Some(SummarizeReason::Save {
                    client_id: op.client_id.clone().unwrap_or_default(),
                    contents: op.contents.as_str().unwrap_or_default().to_string(),
                })
            } else {
                heuristics.run();
                None
            }
        };
        if let Some(reason) = save_reason {
            self.trigger(reason);
        }
    }

    /// Feed one quorum op. Leave ops for this client or its parent are
    /// swallowed so a departing client never generates its own farewell
    /// summary; everything else counts as regular activity.
    pub fn handle_system_op(&self, op: &SequencedOp) {
        match op.op_type {
            OpType::ClientLeave => {
                let leaver = op.leaving_client_id().unwrap_or_default();
                let parent = self
                    .inner
                    .on_behalf_of
                    .lock()
                    .expect("on-behalf-of cell poisoned")
                    .clone();
                if leaver == self.inner.client_id || Some(leaver) == parent.as_deref() {
                    return;
                }
                self.handle_op(None, op);
            }
            OpType::ClientJoin | OpType::Propose | OpType::Reject => self.handle_op(None, op),
            _ => {}
        }
    }

    /// Begin an escalation for `reason`, or coalesce it into the in-flight
    /// one. Retries happen inside the same single-flight window.
    pub fn trigger(&self, reason: SummarizeReason) {
        let begin = {
            let mut flight = self.inner.flight.lock().expect("flight state poisoned");
            if flight.disposed {
                return;
            }
            if flight.summarizing.is_some() {
                flight.try_while_summarizing = true;
                false
            } else {
                let (done_tx, done_rx) = watch::channel(false);
                flight.summarizing = Some(done_tx);
                flight.done_rx = Some(done_rx);
                self.inner.attempt_in_flight.store(true, Ordering::Release);
                true
            }
        };
        if begin {
            // The idle timer stays unarmed for the whole flight window.
            self.inner
                .heuristics
                .lock()
                .expect("heuristics poisoned")
                .clear_idle_timer();
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move { inner.run_attempts(reason).await });
        }
    }

    /// Give the run a chance to land a final summary, then settle.
    ///
    /// When significant uncommitted state is outstanding (more than
    /// [`LAST_SUMMARY_OP_LAG`] ops past the last ack), a `lastSummary`
    /// attempt is triggered and awaited; otherwise this resolves as soon as
    /// any in-flight attempt completes.
    pub async fn wait_stop(&self) {
        let op_lag = self
            .inner
            .heuristics
            .lock()
            .expect("heuristics poisoned")
            .ops_since_last_ack();

        enum Plan {
            Return,
            Await(Option<watch::Receiver<bool>>),
            TriggerLast,
        }

        let plan = {
            let mut flight = self.inner.flight.lock().expect("flight state poisoned");
            if flight.disposed {
                Plan::Return
            } else if flight.stopping {
                Plan::Await(flight.done_rx.clone())
            } else {
                flight.stopping = true;
                if op_lag > LAST_SUMMARY_OP_LAG {
                    Plan::TriggerLast
                } else {
                    Plan::Return
                }
            }
        };

        match plan {
            Plan::Return => {}
            Plan::Await(done) => await_done(done).await,
            Plan::TriggerLast => {
                info!(
                    target: "scrivener::running",
                    op_lag,
                    "triggering last summary before stop"
                );
                self.trigger(SummarizeReason::LastSummary);
                let done = self
                    .inner
                    .flight
                    .lock()
                    .expect("flight state poisoned")
                    .done_rx
                    .clone();
                await_done(done).await;
            }
        }
    }

    /// Cancel timers and stop reacting to the stream. Idempotent. In-flight
    /// awaits resolve through their own timeouts or the cleared ack timer.
    pub fn dispose(&self) {
        {
            let mut flight = self.inner.flight.lock().expect("flight state poisoned");
            if flight.disposed {
                return;
            }
            flight.disposed = true;
        }
        self.inner
            .heuristics
            .lock()
            .expect("heuristics poisoned")
            .dispose();
        self.inner.pending_ack_timer.clear();
        self.inner.clear_long_summarize_warning();
        self.inner.collection.unset_pending_ack_timeout_callback();
    }

    /// Attempts begun so far, successful or not.
    pub fn summarize_count(&self) -> u64 {
        self.inner
            .flight
            .lock()
            .expect("flight state poisoned")
            .summarize_count
    }

    /// Stream position of the last acked summary.
    pub fn last_acked_ref_seq(&self) -> u64 {
        self.inner
            .heuristics
            .lock()
            .expect("heuristics poisoned")
            .last_acked()
            .ref_sequence_number
    }
}

async fn await_done(done: Option<watch::Receiver<bool>>) {
    let Some(mut done) = done else {
        return;
    };
    while !*done.borrow_and_update() {
        if done.changed().await.is_err() {
            break;
        }
    }
}

impl Inner {
    async fn run_attempts(self: Arc<Self>, reason: SummarizeReason) {
        let trigger_reason = reason.to_string();
        let plan = vec![
            (
                reason,
                SummarizeOptions {
                    refresh_latest_ack: false,
                    full_tree: false,
                },
            ),
            (
                SummarizeReason::Retry1,
                SummarizeOptions {
                    refresh_latest_ack: true,
                    full_tree: false,
                },
            ),
            (
                SummarizeReason::Retry2,
                SummarizeOptions {
                    refresh_latest_ack: true,
                    full_tree: true,
                },
            ),
        ];

        let mut succeeded = false;
        for (attempt_reason, options) in plan {
            if self.flight.lock().expect("flight state poisoned").disposed {
                break;
            }
            if self.summarize(attempt_reason, options).await {
                succeeded = true;
                break;
            }
        }

        let disposed = self.flight.lock().expect("flight state poisoned").disposed;
        if !succeeded && !disposed {
            error!(
                target: "scrivener::running",
                reason = %trigger_reason,
                "FailToSummarize: all summarize attempts failed"
            );
            let _ = self.stop_tx.send(StopReason::FailToSummarize);
        }

        // Always release the single-flight gate, then reconsider the clock
        // once if triggers were coalesced meanwhile.
        let rerun = {
            let mut flight = self.flight.lock().expect("flight state poisoned");
            if let Some(done) = flight.summarizing.take() {
                let _ = done.send(true);
            }
            flight.done_rx = None;
            self.attempt_in_flight.store(false, Ordering::Release);
            let rerun = flight.try_while_summarizing && !flight.stopping && !flight.disposed;
            flight.try_while_summarizing = false;
            rerun
        };
        if rerun {
            self.heuristics.lock().expect("heuristics poisoned").run();
        }
    }

    /// One summarize attempt. Returns whether the server acked it.
    async fn summarize(&self, reason: SummarizeReason, options: SummarizeOptions) -> bool {
        let count = {
            let mut flight = self.flight.lock().expect("flight state poisoned");
            flight.summarize_count += 1;
            flight.summarize_count
        };
        let logger = SummaryLogger::new(self.client_id.clone(), count, reason.to_string());
        logger.event("summarizing");
        self.start_long_summarize_warning(logger.clone());

        let result = self
            .generator
            .generate_summary(SummaryGenerationOptions {
                options,
                logger: logger.clone(),
            })
            .await;

        // The attempt clock moves whether or not generation succeeded.
        {
            let mut heuristics = self.heuristics.lock().expect("heuristics poisoned");
            heuristics.record_attempt(result.as_ref().ok().map(|d| d.reference_sequence_number));
        }
        self.clear_long_summarize_warning();

        let data = match result {
            Ok(data) => data,
            Err(e) => {
                return self.fail(
                    &logger,
                    SummarizeFailure::GenerateSummaryFailure {
                        detail: Some(e.to_string()),
                    },
                );
            }
        };
        if !data.submitted {
            return self.fail(
                &logger,
                SummarizeFailure::GenerateSummaryFailure { detail: data.error },
            );
        }
        logger.event("generated");

        // One ack-wait window covers both the broadcast and the ack phase.
        let deadline = self.pending_ack_timer.start();
        tokio::pin!(deadline);

        let proposal = self.watcher.watch_summary(data.client_sequence_number);

        let summarize_op = tokio::select! {
            broadcast = proposal.wait_broadcast() => match broadcast {
                Some(op) => op,
                // Collection torn down mid-attempt; the run is over.
                None => return false,
            },
            lapse = &mut deadline => {
                return match lapse {
                    TimerLapse::Fired => {
                        self.fail(&logger, SummarizeFailure::SummaryOpWaitTimeout)
                    }
                    TimerLapse::Cleared => false,
                };
            }
        };
        self.heuristics
            .lock()
            .expect("heuristics poisoned")
            .set_attempt_summary_sequence_number(summarize_op.sequence_number);
        logger.event("broadcast");

        let ack_nack = tokio::select! {
            result = proposal.wait_ack_nack() => match result {
                Some(result) => result,
                None => return false,
            },
            lapse = &mut deadline => {
                return match lapse {
                    TimerLapse::Fired => {
                        self.fail(&logger, SummarizeFailure::SummaryAckWaitTimeout)
                    }
                    TimerLapse::Cleared => false,
                };
            }
        };
        self.pending_ack_timer.clear();

        match ack_nack {
            AckNack::Ack(acked) => {
                self.heuristics
                    .lock()
                    .expect("heuristics poisoned")
                    .ack_last_sent();
                logger.event("acked");
                info!(
                    target: "scrivener::running",
                    summarize_count = count,
                    handle = acked.contents.handle.as_deref().unwrap_or_default(),
                    "summary acked"
                );
                true
            }
            AckNack::Nack { contents, .. } => self.fail(
                &logger,
                SummarizeFailure::SummaryNack {
                    message: contents.error_message,
                },
            ),
        }
    }

    fn fail(&self, logger: &SummaryLogger, failure: SummarizeFailure) -> bool {
        logger.error(
            failure.canonical_message(),
            failure.detail().unwrap_or_default(),
        );
        warn!(
            target: "scrivener::running",
            failure = %failure,
            detail = failure.detail().unwrap_or_default(),
            "summarize attempt failed"
        );
        // Never block the core on a slow warning consumer.
        let _ = self.warning_tx.try_send(SummarizingWarning::from(&failure));
        false
    }

    fn start_long_summarize_warning(&self, logger: SummaryLogger) {
        let mut guard = self
            .long_summarize_warning
            .lock()
            .expect("warning ticker poisoned");
        if let Some(handle) = guard.take() {
            handle.abort();
        }
        *guard = Some(tokio::spawn(async move {
            let mut wait = LONG_SUMMARIZE_INITIAL_WARNING;
            let mut total = Duration::ZERO;
            for _ in 0..MAX_LONG_SUMMARIZE_WARNINGS {
                tokio::time::sleep(wait).await;
                total += wait;
                logger.error(
                    "summarizeTimeout",
                    &format!("generateSummary running for {}s", total.as_secs()),
                );
                wait *= 2;
            }
        }));
    }

    fn clear_long_summarize_warning(&self) {
        if let Some(handle) = self
            .long_summarize_warning
            .lock()
            .expect("warning ticker poisoned")
            .take()
        {
            handle.abort();
        }
    }
}
