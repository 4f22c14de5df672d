//! Contract between the summarizer and its embedding runtime.
//!
//! The host wires the summarizer up with live handles: watch channels for
//! the connection signal and the election result, an unbounded channel for
//! the batch-end op feed, a shared view of the delta manager's counters, and
//! a close hook for the parent container.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::protocol::OpEvent;

/// Shared, host-updated view of the ordering connection.
#[derive(Clone)]
pub struct DeltaManagerHandle {
    /// Stream position the container was loaded from.
    pub initial_sequence_number: u64,
    last_sequence_number: Arc<AtomicU64>,
    active: Arc<AtomicBool>,
}

impl DeltaManagerHandle {
    pub fn new(initial_sequence_number: u64, active: bool) -> Self {
        Self {
            initial_sequence_number,
            last_sequence_number: Arc::new(AtomicU64::new(initial_sequence_number)),
            active: Arc::new(AtomicBool::new(active)),
        }
    }

    /// Latest sequence number known to have been delivered.
    pub fn last_sequence_number(&self) -> u64 {
        self.last_sequence_number.load(Ordering::Acquire)
    }

    /// Record that `seq` has been delivered.
    pub fn observe(&self, seq: u64) {
        self.last_sequence_number.fetch_max(seq, Ordering::AcqRel);
    }

    /// Whether this client may write to the stream.
    pub fn active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }
}

/// Hook for closing the parent container when the run ends.
pub type CloseFn = Arc<dyn Fn() + Send + Sync>;

/// Everything the embedding runtime supplies to a summarizer instance.
pub struct SummarizerRuntime {
    /// This summarizer process's own client id.
    pub client_id: String,
    /// The computed (elected) summarizer client id, or `None` when nobody
    /// should summarize.
    pub summarizer_client_id: watch::Receiver<Option<String>>,
    /// Connection signal for the parent.
    pub connected: watch::Receiver<bool>,
    pub delta_manager: DeltaManagerHandle,
    /// Batch-end feed of sequenced ops.
    pub ops: mpsc::UnboundedReceiver<OpEvent>,
    pub close: CloseFn,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_manager_tracks_high_water_mark() {
        let delta = DeltaManagerHandle::new(10, true);
        assert_eq!(delta.last_sequence_number(), 10);

        delta.observe(15);
        delta.observe(12);
        assert_eq!(delta.last_sequence_number(), 15);
    }

    #[test]
    fn active_flag_flips() {
        let delta = DeltaManagerHandle::new(0, false);
        assert!(!delta.active());
        delta.set_active(true);
        assert!(delta.active());
    }
}
