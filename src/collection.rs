//! Multiplexer over the ordered stream for summary proposals.
//!
//! The collection watches every summarize / summary-ack / summary-nack op on
//! the inbound stream and tracks each proposal through the states
//! Submitted, Broadcast, then Acked or Nacked. Waiters attach per proposal
//! (scoped to the submitting client through a [`SummaryWatcher`]) or
//! globally (`wait_summary_ack` for the facade's ack-refresh loop,
//! `wait_flushed` for startup resynchronization).
//!
//! Ordering guarantee: for any proposal, `wait_broadcast` resolves strictly
//! before `wait_ack_nack`. Acks are correlated to proposals through
//! `summaryProposal.summarySequenceNumber`, which only becomes known when
//! the broadcast is observed, so an ack can never resolve first.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tracing::debug;

use crate::protocol::{AckNackContents, OpType, SequencedOp};

/// A proposal's broadcast op paired with the server's adjudication.
#[derive(Debug, Clone)]
pub struct AckedSummary {
    /// The summarize op as echoed back on the stream.
    pub summarize_op: SequencedOp,
    /// The ack op itself.
    pub ack_op: SequencedOp,
    pub contents: AckNackContents,
}

/// Resolution of a watched proposal.
#[derive(Debug, Clone)]
pub enum AckNack {
    Ack(AckedSummary),
    Nack {
        summarize_op: SequencedOp,
        nack_op: SequencedOp,
        contents: AckNackContents,
    },
}

impl AckNack {
    pub fn is_ack(&self) -> bool {
        matches!(self, AckNack::Ack(_))
    }
}

type ProposalKey = (String, u64);

#[derive(Default)]
struct ProposalState {
    summarize_op: Option<SequencedOp>,
    broadcast_waiters: Vec<oneshot::Sender<SequencedOp>>,
    result: Option<AckNack>,
    result_waiters: Vec<oneshot::Sender<AckNack>>,
}

struct PendingAckTimeout {
    max_ack_wait: chrono::Duration,
    callback: Box<dyn Fn() + Send + Sync>,
    fired: bool,
}

#[derive(Default)]
struct CollectionState {
    last_processed_seq: u64,
    latest_ack: Option<AckedSummary>,
    proposals: HashMap<ProposalKey, ProposalState>,
    /// Broadcast summarize ops indexed by their own stream position, the key
    /// acks and nacks reference.
    by_summary_seq: HashMap<u64, ProposalKey>,
    flush_waiters: Vec<(u64, oneshot::Sender<Option<AckedSummary>>)>,
    refresh_waiters: Vec<(u64, oneshot::Sender<AckedSummary>)>,
    pending_ack_timeout: Option<PendingAckTimeout>,
    disposed: bool,
}

/// Stream-side bookkeeping for all summary proposals on a document.
#[derive(Clone, Default)]
pub struct SummaryCollection {
    state: Arc<Mutex<CollectionState>>,
}

impl SummaryCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scope subsequent `watch_summary` calls to proposals originated by
    /// `client_id`.
    pub fn create_watcher(&self, client_id: impl Into<String>) -> SummaryWatcher {
        SummaryWatcher {
            collection: self.clone(),
            client_id: client_id.into(),
        }
    }

    /// Feed one sequenced op from the inbound stream.
    pub fn process_op(&self, op: &SequencedOp) {
        let mut state = self.state.lock().expect("collection state poisoned");
        if state.disposed {
            return;
        }
        state.last_processed_seq = state.last_processed_seq.max(op.sequence_number);

        match op.op_type {
            OpType::Summarize => Self::on_summarize(&mut state, op),
            OpType::SummaryAck | OpType::SummaryNack => Self::on_ack_nack(&mut state, op),
            _ => {}
        }

        Self::drain_flush_waiters(&mut state);
        Self::check_pending_ack_timeout(&mut state, op.timestamp);
    }

    fn on_summarize(state: &mut CollectionState, op: &SequencedOp) {
        let Some(client_id) = op.client_id.clone() else {
            return;
        };
        let key = (client_id, op.client_sequence_number);
        let proposal = state.proposals.entry(key.clone()).or_default();
        if proposal.summarize_op.is_some() {
            return;
        }

        proposal.summarize_op = Some(op.clone());
        for waiter in proposal.broadcast_waiters.drain(..) {
            let _ = waiter.send(op.clone());
        }
        state.by_summary_seq.insert(op.sequence_number, key);
        debug!(
            sequence_number = op.sequence_number,
            client_sequence_number = op.client_sequence_number,
            "observed summarize broadcast"
        );
    }

    fn on_ack_nack(state: &mut CollectionState, op: &SequencedOp) {
        let Some(contents) = op.ack_nack_contents() else {
            return;
        };
        let summary_seq = contents.summary_proposal.summary_sequence_number;
        let Some(key) = state.by_summary_seq.get(&summary_seq).cloned() else {
            return;
        };
        let Some(proposal) = state.proposals.get_mut(&key) else {
            return;
        };
        // A proposal is adjudicated at most once; later echoes are dropped.
        if proposal.result.is_some() {
            return;
        }
        let summarize_op = proposal
            .summarize_op
            .clone()
            .expect("proposal indexed by summary seq must be broadcast");

        let result = if op.op_type == OpType::SummaryAck {
            AckNack::Ack(AckedSummary {
                summarize_op: summarize_op.clone(),
                ack_op: op.clone(),
                contents,
            })
        } else {
            AckNack::Nack {
                summarize_op: summarize_op.clone(),
                nack_op: op.clone(),
                contents,
            }
        };

        proposal.result = Some(result.clone());
        for waiter in proposal.result_waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }

        if let AckNack::Ack(acked) = result {
            let ref_seq = acked.summarize_op.reference_sequence_number;
            state.latest_ack = Some(acked.clone());

            let mut remaining = Vec::new();
            for (min_ref_seq, waiter) in state.refresh_waiters.drain(..) {
                if ref_seq >= min_ref_seq {
                    let _ = waiter.send(acked.clone());
                } else {
                    remaining.push((min_ref_seq, waiter));
                }
            }
            state.refresh_waiters = remaining;
        }
    }

    fn drain_flush_waiters(state: &mut CollectionState) {
        let drained = state.last_processed_seq;
        let latest = state.latest_ack.clone();
        let mut remaining = Vec::new();
        for (target, waiter) in state.flush_waiters.drain(..) {
            if drained >= target {
                let _ = waiter.send(latest.clone());
            } else {
                remaining.push((target, waiter));
            }
        }
        state.flush_waiters = remaining;
    }

    fn check_pending_ack_timeout(state: &mut CollectionState, now: DateTime<Utc>) {
        let Some(timeout) = state.pending_ack_timeout.as_ref() else {
            return;
        };
        if timeout.fired {
            return;
        }

        let overdue = state.proposals.values().any(|proposal| {
            proposal.result.is_none()
                && proposal
                    .summarize_op
                    .as_ref()
                    .is_some_and(|op| now - op.timestamp >= timeout.max_ack_wait)
        });
        if overdue {
            let timeout = state.pending_ack_timeout.as_mut().expect("checked above");
            timeout.fired = true;
            (timeout.callback)();
        }
    }

    /// Resolve once the collection has observed the stream drained up to
    /// `target_seq`, reporting the latest ack seen by then. Used on startup
    /// to synchronize to the newest committed summary.
    pub async fn wait_flushed(&self, target_seq: u64) -> Option<AckedSummary> {
        let rx = {
            let mut state = self.state.lock().expect("collection state poisoned");
            if state.last_processed_seq >= target_seq {
                return state.latest_ack.clone();
            }
            let (tx, rx) = oneshot::channel();
            state.flush_waiters.push((target_seq, tx));
            rx
        };
        rx.await.unwrap_or(None)
    }

    /// Resolve with the next ack whose referenced proposal covers stream
    /// position `min_ref_seq` or later. Returns `None` once the collection
    /// is disposed.
    pub async fn wait_summary_ack(&self, min_ref_seq: u64) -> Option<AckedSummary> {
        let rx = {
            let mut state = self.state.lock().expect("collection state poisoned");
            if state.disposed {
                return None;
            }
            if let Some(latest) = &state.latest_ack {
                if latest.summarize_op.reference_sequence_number >= min_ref_seq {
                    return Some(latest.clone());
                }
            }
            let (tx, rx) = oneshot::channel();
            state.refresh_waiters.push((min_ref_seq, tx));
            rx
        };
        rx.await.ok()
    }

    /// Install the startup fallback: once the op-timestamp gap between an
    /// unacked broadcast proposal and the newest op exceeds `max_ack_wait`,
    /// invoke `callback`. Fires at most once per installed window.
    pub fn set_pending_ack_timeout_callback<F>(&self, max_ack_wait: Duration, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut state = self.state.lock().expect("collection state poisoned");
        state.pending_ack_timeout = Some(PendingAckTimeout {
            max_ack_wait: chrono::Duration::from_std(max_ack_wait)
                .unwrap_or_else(|_| chrono::Duration::milliseconds(i64::MAX / 2)),
            callback: Box::new(callback),
            fired: false,
        });
    }

    pub fn unset_pending_ack_timeout_callback(&self) {
        let mut state = self.state.lock().expect("collection state poisoned");
        state.pending_ack_timeout = None;
    }

    /// Latest ack observed so far, if any.
    pub fn latest_ack(&self) -> Option<AckedSummary> {
        self.state
            .lock()
            .expect("collection state poisoned")
            .latest_ack
            .clone()
    }

    /// Drop all waiters and stop processing. Idempotent.
    pub fn dispose(&self) {
        let mut state = self.state.lock().expect("collection state poisoned");
        state.disposed = true;
        state.pending_ack_timeout = None;
        state.flush_waiters.clear();
        state.refresh_waiters.clear();
        for proposal in state.proposals.values_mut() {
            proposal.broadcast_waiters.clear();
            proposal.result_waiters.clear();
        }
    }
}

/// A collection view scoped to proposals submitted by one client.
#[derive(Clone)]
pub struct SummaryWatcher {
    collection: SummaryCollection,
    client_id: String,
}

impl SummaryWatcher {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Register interest in the proposal that will be broadcast with this
    /// local client-sequence-number.
    pub fn watch_summary(&self, client_sequence_number: u64) -> PendingSummary {
        let key = (self.client_id.clone(), client_sequence_number);
        let mut state = self
            .collection
            .state
            .lock()
            .expect("collection state poisoned");
        state.proposals.entry(key.clone()).or_default();
        PendingSummary {
            state: Arc::clone(&self.collection.state),
            key,
        }
    }

    /// Resolve once the stream has drained up to `target_seq`, reporting the
    /// latest ack observed by then.
    pub async fn wait_flushed(&self, target_seq: u64) -> Option<AckedSummary> {
        self.collection.wait_flushed(target_seq).await
    }
}

/// Handle onto one watched proposal.
pub struct PendingSummary {
    state: Arc<Mutex<CollectionState>>,
    key: ProposalKey,
}

impl PendingSummary {
    /// Resolve with the summarize op once it appears on the inbound stream.
    /// Returns `None` if the collection was torn down first.
    pub async fn wait_broadcast(&self) -> Option<SequencedOp> {
        let rx = {
            let mut state = self.state.lock().expect("collection state poisoned");
            if state.disposed {
                return None;
            }
            let proposal = state.proposals.entry(self.key.clone()).or_default();
            if let Some(op) = &proposal.summarize_op {
                return Some(op.clone());
            }
            let (tx, rx) = oneshot::channel();
            proposal.broadcast_waiters.push(tx);
            rx
        };
        rx.await.ok()
    }

    /// Resolve with the matching ack or nack. Resolves at most once, and
    /// never before the matching broadcast has been observed.
    pub async fn wait_ack_nack(&self) -> Option<AckNack> {
        let rx = {
            let mut state = self.state.lock().expect("collection state poisoned");
            if state.disposed {
                return None;
            }
            let proposal = state.proposals.entry(self.key.clone()).or_default();
            if let Some(result) = &proposal.result {
                return Some(result.clone());
            }
            let (tx, rx) = oneshot::channel();
            proposal.result_waiters.push(tx);
            rx
        };
        rx.await.ok()
    }
}
