//! Gates the summarizer run on the parent staying connected and elected.

use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

/// Why a summarizer run ended. The rendered strings are wire-visible in
/// telemetry and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Three consecutive attempts failed.
    FailToSummarize,
    /// Another client became the authoritative summarizer.
    ParentNoLongerSummarizer,
    /// The parent lost its connection to the ordering service.
    ParentNotConnected,
    /// The election now says nobody should summarize.
    ParentShouldNotSummarize,
    /// The host tore the summarizer down.
    Disposed,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StopReason::FailToSummarize => "failToSummarize",
            StopReason::ParentNoLongerSummarizer => "parentNoLongerSummarizer",
            StopReason::ParentNotConnected => "parentNotConnected",
            StopReason::ParentShouldNotSummarize => "parentShouldNotSummarize",
            StopReason::Disposed => "disposed",
        };
        write!(f, "{name}")
    }
}

/// Watches the connection signal and the election result, reporting when the
/// run may begin and when it must end.
///
/// The elected summarizer may be this process's own client or its parent
/// (the on-behalf-of client); either keeps the run alive. The on-behalf-of
/// id lives behind a shared cell so `update_on_behalf_of` takes effect
/// mid-run.
pub struct RunCoordinator {
    connected: watch::Receiver<bool>,
    elected: watch::Receiver<Option<String>>,
    client_id: String,
    on_behalf_of: Arc<Mutex<Option<String>>>,
}

impl RunCoordinator {
    pub fn new(
        connected: watch::Receiver<bool>,
        elected: watch::Receiver<Option<String>>,
        client_id: impl Into<String>,
        on_behalf_of: Arc<Mutex<Option<String>>>,
    ) -> Self {
        Self {
            connected,
            elected,
            client_id: client_id.into(),
            on_behalf_of,
        }
    }

    /// Wait until the parent is connected. Reports `false` when the runtime
    /// went away before a connection was ever established.
    pub async fn wait_start(&mut self) -> bool {
        loop {
            if *self.connected.borrow_and_update() {
                return true;
            }
            if self.connected.changed().await.is_err() {
                return false;
            }
        }
    }

    fn check(&mut self) -> Option<StopReason> {
        if !*self.connected.borrow_and_update() {
            return Some(StopReason::ParentNotConnected);
        }
        match self.elected.borrow_and_update().clone() {
            None => Some(StopReason::ParentShouldNotSummarize),
            Some(elected) => {
                let parent = self
                    .on_behalf_of
                    .lock()
                    .expect("on-behalf-of cell poisoned")
                    .clone();
                if elected == self.client_id || Some(&elected) == parent.as_ref() {
                    None
                } else {
                    Some(StopReason::ParentNoLongerSummarizer)
                }
            }
        }
    }

    /// Resolve once a run precondition is lost. The first lost precondition
    /// wins: disconnection is reported ahead of election changes.
    pub async fn wait_stopped(&mut self) -> StopReason {
        loop {
            if let Some(reason) = self.check() {
                return reason;
            }
            tokio::select! {
                changed = self.connected.changed() => {
                    if changed.is_err() {
                        return StopReason::ParentNotConnected;
                    }
                }
                changed = self.elected.changed() => {
                    if changed.is_err() {
                        return StopReason::ParentShouldNotSummarize;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn harness(
        connected: bool,
        elected: Option<&str>,
    ) -> (
        watch::Sender<bool>,
        watch::Sender<Option<String>>,
        RunCoordinator,
    ) {
        let (connected_tx, connected_rx) = watch::channel(connected);
        let (elected_tx, elected_rx) = watch::channel(elected.map(String::from));
        let coordinator = RunCoordinator::new(
            connected_rx,
            elected_rx,
            "summarizer-client",
            Arc::new(Mutex::new(Some("parent-client".to_string()))),
        );
        (connected_tx, elected_tx, coordinator)
    }

    #[tokio::test]
    async fn wait_start_resolves_once_connected() {
        let (connected_tx, _elected_tx, mut coordinator) = harness(false, Some("parent-client"));

        let start = tokio::spawn(async move { coordinator.wait_start().await });
        tokio::task::yield_now().await;
        connected_tx.send(true).unwrap();

        assert!(start.await.unwrap());
    }

    #[tokio::test]
    async fn wait_start_reports_false_when_runtime_dies() {
        let (connected_tx, _elected_tx, mut coordinator) = harness(false, Some("parent-client"));
        drop(connected_tx);
        assert!(!coordinator.wait_start().await);
    }

    #[tokio::test]
    async fn disconnect_stops_the_run() {
        let (connected_tx, _elected_tx, mut coordinator) = harness(true, Some("parent-client"));

        let stopped = tokio::spawn(async move { coordinator.wait_stopped().await });
        tokio::task::yield_now().await;
        connected_tx.send(false).unwrap();

        assert_eq!(stopped.await.unwrap(), StopReason::ParentNotConnected);
    }

    #[tokio::test]
    async fn election_change_stops_the_run() {
        let (_connected_tx, elected_tx, mut coordinator) = harness(true, Some("parent-client"));

        let stopped = tokio::spawn(async move { coordinator.wait_stopped().await });
        tokio::task::yield_now().await;
        elected_tx.send(Some("usurper".to_string())).unwrap();

        assert_eq!(stopped.await.unwrap(), StopReason::ParentNoLongerSummarizer);
    }

    #[tokio::test]
    async fn lost_election_reports_should_not_summarize() {
        let (_connected_tx, elected_tx, mut coordinator) = harness(true, Some("parent-client"));

        let stopped = tokio::spawn(async move { coordinator.wait_stopped().await });
        tokio::task::yield_now().await;
        elected_tx.send(None).unwrap();

        assert_eq!(stopped.await.unwrap(), StopReason::ParentShouldNotSummarize);
    }

    #[tokio::test]
    async fn own_client_election_keeps_running() {
        let (connected_tx, elected_tx, mut coordinator) = harness(true, Some("parent-client"));

        let stopped = tokio::spawn(async move { coordinator.wait_stopped().await });
        tokio::task::yield_now().await;

        // Electing this summarizer client itself is not a stop condition.
        elected_tx.send(Some("summarizer-client".to_string())).unwrap();
        tokio::task::yield_now().await;
        assert!(!stopped.is_finished());

        connected_tx.send(false).unwrap();
        assert_eq!(stopped.await.unwrap(), StopReason::ParentNotConnected);
    }

    #[test]
    fn stop_reasons_render_wire_strings() {
        assert_eq!(StopReason::FailToSummarize.to_string(), "failToSummarize");
        assert_eq!(
            StopReason::ParentNoLongerSummarizer.to_string(),
            "parentNoLongerSummarizer"
        );
        assert_eq!(StopReason::ParentNotConnected.to_string(), "parentNotConnected");
        assert_eq!(
            StopReason::ParentShouldNotSummarize.to_string(),
            "parentShouldNotSummarize"
        );
        assert_eq!(StopReason::Disposed.to_string(), "disposed");
    }
}
