//! Lifecycle facade around the running summarize state machine.
//!
//! `run` performs the election preconditions, bridges the runtime's op
//! stream into the collection and the running summarizer, and blocks until
//! the run coordinator reports a lost precondition or `stop` is called. An
//! independent ack-refresh loop feeds every observed ack back into the host
//! so it can rebase onto the latest committed summary.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{info, warn};

use crate::collection::SummaryCollection;
use crate::coordinator::{RunCoordinator, StopReason};
use crate::errors::SummarizingWarning;
use crate::generator::{SummaryGenerator, SummaryLogger};
use crate::heuristics::{SummaryAttempt, SummaryConfiguration};
use crate::protocol::OpEvent;
use crate::running::{RunningSummarizer, RunningSummarizerParams};
use crate::runtime::{CloseFn, DeltaManagerHandle, SummarizerRuntime};

/// Warnings queue depth before new warnings are dropped on the floor.
const WARNING_BUFFER: usize = 64;

/// Response to a host request routed at this summarizer.
pub enum SummarizerResponse {
    /// The summarizer itself, for the root URL.
    Summarizer(Summarizer),
    NotFound { status: u16, message: String },
}

struct NextSummarizer {
    tx: Option<oneshot::Sender<Summarizer>>,
    rx: Option<oneshot::Receiver<Summarizer>>,
}

struct FacadeInner {
    client_id: String,
    on_behalf_of: Arc<Mutex<Option<String>>>,
    configuration: SummaryConfiguration,
    generator: Arc<dyn SummaryGenerator>,
    collection: SummaryCollection,
    delta: DeltaManagerHandle,
    connected: watch::Receiver<bool>,
    elected: watch::Receiver<Option<String>>,
    close: CloseFn,
    ops: Mutex<Option<mpsc::UnboundedReceiver<OpEvent>>>,
    warning_tx: mpsc::Sender<SummarizingWarning>,
    warnings_rx: Mutex<Option<mpsc::Receiver<SummarizingWarning>>>,
    stop_signal: watch::Sender<Option<StopReason>>,
    stop_watch: watch::Receiver<Option<StopReason>>,
    next_summarizer: Mutex<NextSummarizer>,
}

/// The summarizer agent as exposed to the embedding runtime.
#[derive(Clone)]
pub struct Summarizer {
    inner: Arc<FacadeInner>,
}

impl Summarizer {
    pub fn new(
        runtime: SummarizerRuntime,
        configuration: SummaryConfiguration,
        generator: Arc<dyn SummaryGenerator>,
    ) -> Self {
        let (warning_tx, warning_rx) = mpsc::channel(WARNING_BUFFER);
        let (stop_signal, stop_watch) = watch::channel(None);
        let (next_tx, next_rx) = oneshot::channel();

        Self {
            inner: Arc::new(FacadeInner {
                client_id: runtime.client_id,
                on_behalf_of: Arc::new(Mutex::new(None)),
                configuration,
                generator,
                collection: SummaryCollection::new(),
                delta: runtime.delta_manager,
                connected: runtime.connected,
                elected: runtime.summarizer_client_id,
                close: runtime.close,
                ops: Mutex::new(Some(runtime.ops)),
                warning_tx,
                warnings_rx: Mutex::new(Some(warning_rx)),
                stop_signal,
                stop_watch,
                next_summarizer: Mutex::new(NextSummarizer {
                    tx: Some(next_tx),
                    rx: Some(next_rx),
                }),
            }),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// The warning stream. Takeable once.
    pub fn warnings(&self) -> Option<mpsc::Receiver<SummarizingWarning>> {
        self.inner
            .warnings_rx
            .lock()
            .expect("warnings slot poisoned")
            .take()
    }

    /// Swap the parent client id mid-run.
    pub fn update_on_behalf_of(&self, client_id: impl Into<String>) {
        *self
            .inner
            .on_behalf_of
            .lock()
            .expect("on-behalf-of cell poisoned") = Some(client_id.into());
    }

    /// Resolves with the successor summarizer once one attaches.
    pub async fn set_summarizer(&self) -> Option<Summarizer> {
        let rx = self
            .inner
            .next_summarizer
            .lock()
            .expect("next-summarizer slot poisoned")
            .rx
            .take()?;
        rx.await.ok()
    }

    /// Host-side half of the successor handoff.
    pub fn resolve_next_summarizer(&self, next: Summarizer) {
        if let Some(tx) = self
            .inner
            .next_summarizer
            .lock()
            .expect("next-summarizer slot poisoned")
            .tx
            .take()
        {
            let _ = tx.send(next);
        }
    }

    /// Route a host request. The root URL resolves to this summarizer;
    /// anything else is not found.
    pub fn handle_request(&self, url: &str) -> SummarizerResponse {
        if url.is_empty() || url == "/" {
            SummarizerResponse::Summarizer(self.clone())
        } else {
            SummarizerResponse::NotFound {
                status: 404,
                message: format!("request url not found: {url}"),
            }
        }
    }

    /// Ask the run to end. Idempotent; the first reason wins and duplicate
    /// calls are ignored.
    pub fn stop(&self, reason: StopReason) {
        let recorded = self.inner.stop_signal.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
        if recorded {
            info!(target: "scrivener::summarizer", reason = %reason, "stop requested");
        }
    }

    /// The reason the run stopped, once one was recorded.
    pub fn stop_reason(&self) -> Option<StopReason> {
        *self.inner.stop_watch.borrow()
    }

    /// Run the summarizer on behalf of the parent client. Long-running:
    /// blocks until a precondition is lost, `stop` is called, or the op
    /// stream ends. Returns without starting (after logging) when the
    /// preconditions fail.
    pub async fn run(&self, on_behalf_of: &str) -> Result<()> {
        self.update_on_behalf_of(on_behalf_of);

        let mut coordinator = RunCoordinator::new(
            self.inner.connected.clone(),
            self.inner.elected.clone(),
            self.inner.client_id.clone(),
            Arc::clone(&self.inner.on_behalf_of),
        );

        if !coordinator.wait_start().await {
            info!(
                target: "scrivener::summarizer",
                on_behalf_of,
                "NotStarted: parent never connected"
            );
            return Ok(());
        }
        if !self.inner.delta.active() {
            info!(
                target: "scrivener::summarizer",
                on_behalf_of,
                "NotStarted: this client cannot write"
            );
            return Ok(());
        }
        let elected = self.inner.elected.borrow().clone();
        let authorized = matches!(
            elected.as_deref(),
            Some(id) if id == on_behalf_of || id == self.inner.client_id
        );
        if !authorized {
            info!(
                target: "scrivener::summarizer",
                on_behalf_of,
                elected = elected.as_deref().unwrap_or(""),
                "NotStarted: another client is the authoritative summarizer"
            );
            return Ok(());
        }

        let mut ops = self
            .inner
            .ops
            .lock()
            .expect("op stream slot poisoned")
            .take()
            .context("summarizer run already consumed the op stream")?;

        let (trigger_tx, mut trigger_rx) = mpsc::unbounded_channel();
        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();

        let running = RunningSummarizer::new(RunningSummarizerParams {
            client_id: self.inner.client_id.clone(),
            on_behalf_of: Arc::clone(&self.inner.on_behalf_of),
            configuration: self.inner.configuration.clone(),
            generator: Arc::clone(&self.inner.generator),
            collection: self.inner.collection.clone(),
            trigger_tx,
            warning_tx: self.inner.warning_tx.clone(),
            stop_tx: fatal_tx,
            first_ack: SummaryAttempt::new(self.inner.delta.initial_sequence_number),
            last_op_seq_number: self.inner.delta.last_sequence_number(),
        });

        let refresh_task = tokio::spawn(self.clone().ack_refresh_loop());

        // Ops must keep flowing into the collection while startup
        // resynchronization races its flush against the ack-wait window, so
        // the start future is pumped alongside the stream.
        let flush_target = self.inner.delta.last_sequence_number();
        let start_fut = running.start(flush_target);
        tokio::pin!(start_fut);
        let mut started = false;
        let mut stop_watch = self.inner.stop_watch.clone();

        let stop_reason = loop {
            // A stop recorded before this point must still end the loop.
            if let Some(reason) = *stop_watch.borrow_and_update() {
                break reason;
            }
            tokio::select! {
                _ = &mut start_fut, if !started => {
                    started = true;
                }
                event = ops.recv() => match event {
                    Some(event) => {
                        self.inner.delta.observe(event.op.sequence_number);
                        self.inner.collection.process_op(&event.op);
                        if started {
                            if event.op.op_type.is_quorum() {
                                // Quorum ops have no batch error channel.
                                if event.error.is_none() {
                                    running.handle_system_op(&event.op);
                                }
                            } else {
                                running.handle_op(event.error.as_deref(), &event.op);
                            }
                        }
                    }
                    None => break StopReason::Disposed,
                },
                Some(reason) = trigger_rx.recv() => {
                    if started {
                        running.trigger(reason);
                    }
                }
                Some(reason) = fatal_rx.recv() => break reason,
                changed = stop_watch.changed() => {
                    if changed.is_err() {
                        break StopReason::Disposed;
                    }
                    // Loop top reads the recorded reason.
                }
                reason = coordinator.wait_stopped() => break reason,
            }
        };

        info!(target: "scrivener::summarizer", reason = %stop_reason, "summarizer stopping");
        self.stop(stop_reason);

        // An in-flight (or final) summary still needs its broadcast and ack
        // from the stream, so keep pumping the collection until it settles.
        {
            let wait_stop = running.wait_stop();
            tokio::pin!(wait_stop);
            loop {
                tokio::select! {
                    _ = &mut wait_stop => break,
                    event = ops.recv() => match event {
                        Some(event) => {
                            self.inner.delta.observe(event.op.sequence_number);
                            self.inner.collection.process_op(&event.op);
                        }
                        None => {
                            // Stream is gone; nothing left to wait for.
                            running.dispose();
                            (&mut wait_stop).await;
                            break;
                        }
                    },
                }
            }
        }

        running.dispose();
        refresh_task.abort();
        self.inner.collection.dispose();
        (self.inner.close)();
        Ok(())
    }

    /// Feed every observed ack back into the host so it can rebase onto the
    /// newest committed summary. Transient refresh failures are logged and
    /// the loop keeps going; a fatal one emits a warning and ends the run.
    async fn ack_refresh_loop(self) {
        let mut ref_seq = self.inner.delta.initial_sequence_number;
        let mut refresh_count: u64 = 0;
        loop {
            let Some(acked) = self.inner.collection.wait_summary_ack(ref_seq).await else {
                break;
            };
            refresh_count += 1;
            let logger = SummaryLogger::new(
                self.inner.client_id.clone(),
                refresh_count,
                "refreshLatestAck",
            );
            let proposal_handle = acked.summarize_op.summarize_contents().map(|c| c.handle);
            let ack_handle = acked.contents.handle.clone();

            match self
                .inner
                .generator
                .refresh_latest_summary_ack(proposal_handle, ack_handle, logger)
                .await
            {
                Ok(()) => {}
                Err(e) if e.fatal => {
                    warn!(
                        target: "scrivener::summarizer",
                        error = %e,
                        "fatal refreshLatestSummaryAck failure"
                    );
                    let _ = self
                        .inner
                        .warning_tx
                        .try_send(SummarizingWarning::new(e.message, true));
                    self.stop(StopReason::Disposed);
                    break;
                }
                Err(e) => {
                    warn!(
                        target: "scrivener::summarizer",
                        error = %e,
                        "refreshLatestSummaryAck failed; continuing"
                    );
                }
            }

            ref_seq = acked.ack_op.sequence_number.max(ref_seq + 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::generator::{
        GenerateSummaryData, RefreshError, SummaryGenerationOptions,
    };

    struct NoopGenerator;

    #[async_trait]
    impl SummaryGenerator for NoopGenerator {
        async fn generate_summary(
            &self,
            _options: SummaryGenerationOptions,
        ) -> Result<GenerateSummaryData> {
            Err(anyhow!("not under test"))
        }

        async fn refresh_latest_summary_ack(
            &self,
            _proposal_handle: Option<String>,
            _ack_handle: Option<String>,
            _logger: SummaryLogger,
        ) -> std::result::Result<(), RefreshError> {
            Ok(())
        }
    }

    struct TestRuntime {
        summarizer: Summarizer,
        _op_tx: mpsc::UnboundedSender<OpEvent>,
        connected_tx: watch::Sender<bool>,
        elected_tx: watch::Sender<Option<String>>,
        closed: Arc<AtomicBool>,
    }

    fn build(connected: bool, elected: Option<&str>, active: bool) -> TestRuntime {
        let (op_tx, op_rx) = mpsc::unbounded_channel();
        let (connected_tx, connected_rx) = watch::channel(connected);
        let (elected_tx, elected_rx) = watch::channel(elected.map(String::from));
        let closed = Arc::new(AtomicBool::new(false));
        let close_flag = Arc::clone(&closed);

        let runtime = SummarizerRuntime {
            client_id: "summarizer-client".to_string(),
            summarizer_client_id: elected_rx,
            connected: connected_rx,
            delta_manager: DeltaManagerHandle::new(0, active),
            ops: op_rx,
            close: Arc::new(move || {
                close_flag.store(true, Ordering::SeqCst);
            }),
        };
        let summarizer = Summarizer::new(
            runtime,
            SummaryConfiguration::default(),
            Arc::new(NoopGenerator),
        );
        TestRuntime {
            summarizer,
            _op_tx: op_tx,
            connected_tx,
            elected_tx,
            closed,
        }
    }

    #[tokio::test]
    async fn request_routing() {
        let rt = build(true, Some("parent-client"), true);

        match rt.summarizer.handle_request("/") {
            SummarizerResponse::Summarizer(_) => {}
            SummarizerResponse::NotFound { .. } => panic!("root should resolve"),
        }
        match rt.summarizer.handle_request("") {
            SummarizerResponse::Summarizer(_) => {}
            SummarizerResponse::NotFound { .. } => panic!("empty url should resolve"),
        }
        match rt.summarizer.handle_request("/other") {
            SummarizerResponse::NotFound { status, .. } => assert_eq!(status, 404),
            SummarizerResponse::Summarizer(_) => panic!("unknown url should 404"),
        }
    }

    #[tokio::test]
    async fn stop_is_idempotent_first_reason_wins() {
        let rt = build(true, Some("parent-client"), true);

        rt.summarizer.stop(StopReason::ParentNotConnected);
        rt.summarizer.stop(StopReason::FailToSummarize);
        assert_eq!(
            rt.summarizer.stop_reason(),
            Some(StopReason::ParentNotConnected)
        );
    }

    #[tokio::test]
    async fn not_started_when_inactive() {
        let rt = build(true, Some("parent-client"), false);
        rt.summarizer.run("parent-client").await.unwrap();
        assert!(!rt.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn not_started_when_another_client_is_elected() {
        let rt = build(true, Some("somebody-else"), true);
        rt.summarizer.run("parent-client").await.unwrap();
        assert!(!rt.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn not_started_when_nobody_is_elected() {
        let rt = build(true, None, true);
        rt.summarizer.run("parent-client").await.unwrap();
        assert!(!rt.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn not_started_when_runtime_dies_before_connecting() {
        let rt = build(false, Some("parent-client"), true);
        drop(rt.connected_tx);
        rt.summarizer.run("parent-client").await.unwrap();
        assert!(!rt.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn run_on_own_client_id_is_authorized() {
        let rt = build(true, Some("summarizer-client"), true);
        let summarizer = rt.summarizer.clone();
        let run = tokio::spawn(async move { summarizer.run("parent-client").await });

        tokio::task::yield_now().await;
        rt.summarizer.stop(StopReason::Disposed);
        run.await.unwrap().unwrap();
        assert!(rt.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn disconnect_ends_the_run_and_closes_parent() {
        let rt = build(true, Some("parent-client"), true);
        let summarizer = rt.summarizer.clone();
        let run = tokio::spawn(async move { summarizer.run("parent-client").await });

        tokio::task::yield_now().await;
        rt.connected_tx.send(false).unwrap();
        run.await.unwrap().unwrap();

        assert!(rt.closed.load(Ordering::SeqCst));
        assert_eq!(
            rt.summarizer.stop_reason(),
            Some(StopReason::ParentNotConnected)
        );
    }

    #[tokio::test]
    async fn election_handoff_ends_the_run() {
        let rt = build(true, Some("parent-client"), true);
        let summarizer = rt.summarizer.clone();
        let run = tokio::spawn(async move { summarizer.run("parent-client").await });

        tokio::task::yield_now().await;
        rt.elected_tx.send(Some("usurper".to_string())).unwrap();
        run.await.unwrap().unwrap();

        assert_eq!(
            rt.summarizer.stop_reason(),
            Some(StopReason::ParentNoLongerSummarizer)
        );
    }

    #[tokio::test]
    async fn successor_handoff_resolves() {
        let rt = build(true, Some("parent-client"), true);
        let successor = build(true, Some("parent-client"), true);

        let waiter = {
            let summarizer = rt.summarizer.clone();
            tokio::spawn(async move { summarizer.set_summarizer().await })
        };
        tokio::task::yield_now().await;
        rt.summarizer.resolve_next_summarizer(successor.summarizer.clone());

        let next = waiter.await.unwrap().expect("successor should arrive");
        assert_eq!(next.client_id(), "summarizer-client");
    }

    #[tokio::test]
    async fn warnings_channel_is_takeable_once() {
        let rt = build(true, Some("parent-client"), true);
        assert!(rt.summarizer.warnings().is_some());
        assert!(rt.summarizer.warnings().is_none());
    }
}
