//! Timer primitives for the summarize state machine.
//!
//! Two shapes are needed. [`Timer`] is a restartable one-shot that delivers a
//! callback; a cleared timer never delivers. [`PromiseTimer`] is a deadline a
//! caller can race a real future against: it resolves with a distinguished
//! [`TimerLapse`] marker so the racer can never confuse a timeout with real
//! completion or with cancellation.
//!
//! Callbacks fire on the owning runtime. Code that mutates summarizer state
//! from a timer callback must post back to the owning task through a channel
//! rather than touching shared state directly.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

#[derive(Default)]
struct TimerState {
    /// Bumped on every start/clear; a sleeper whose generation no longer
    /// matches must not deliver its callback.
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

/// A restartable one-shot timer.
///
/// `start` schedules the callback after `duration`. Starting again (or
/// calling [`Timer::restart`], which is the same operation) cancels any
/// pending firing first. `clear` cancels silently; after `clear` returns on
/// the owning context the callback will not be delivered.
#[derive(Default)]
pub struct Timer {
    state: Arc<Mutex<TimerState>>,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start<F>(&self, duration: Duration, on_fire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.state.lock().expect("timer state poisoned");
        state.generation += 1;
        if let Some(handle) = state.handle.take() {
            handle.abort();
        }

        let generation = state.generation;
        let shared = Arc::clone(&self.state);
        state.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let fire = {
                let mut state = shared.lock().expect("timer state poisoned");
                if state.generation == generation {
                    state.handle = None;
                    true
                } else {
                    false
                }
            };
            if fire {
                on_fire();
            }
        }));
    }

    /// Cancel any pending firing and schedule anew.
    pub fn restart<F>(&self, duration: Duration, on_fire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.start(duration, on_fire);
    }

    /// Cancel silently. Idempotent.
    pub fn clear(&self) {
        let mut state = self.state.lock().expect("timer state poisoned");
        state.generation += 1;
        if let Some(handle) = state.handle.take() {
            handle.abort();
        }
    }

    /// Whether a firing is currently scheduled.
    pub fn has_timer(&self) -> bool {
        self.state
            .lock()
            .expect("timer state poisoned")
            .handle
            .is_some()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(handle) = state.handle.take() {
                handle.abort();
            }
        }
    }
}

/// How a [`PromiseTimer`] wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerLapse {
    /// The full duration elapsed.
    Fired,
    /// `clear` cut the wait short.
    Cleared,
}

/// A deadline future with unambiguous cancellation.
///
/// `start` returns a future resolving to [`TimerLapse::Fired`] after the
/// configured duration, or [`TimerLapse::Cleared`] if `clear` ran first. A
/// caller racing a real future against this one treats only `Fired` as a
/// timeout. Starting while a wait is pending resolves the previous waiter
/// with `Cleared`.
pub struct PromiseTimer {
    duration: Duration,
    cancel: Mutex<Option<oneshot::Sender<()>>>,
}

impl PromiseTimer {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            cancel: Mutex::new(None),
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub async fn start(&self) -> TimerLapse {
        let (tx, rx) = oneshot::channel();
        {
            let mut cancel = self.cancel.lock().expect("promise timer poisoned");
            if let Some(previous) = cancel.replace(tx) {
                let _ = previous.send(());
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(self.duration) => {
                self.cancel.lock().expect("promise timer poisoned").take();
                TimerLapse::Fired
            }
            _ = rx => TimerLapse::Cleared,
        }
    }

    /// Resolve the pending waiter with `Cleared`, if any.
    pub fn clear(&self) {
        if let Some(tx) = self.cancel.lock().expect("promise timer poisoned").take() {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::{advance, sleep};

    #[tokio::test(start_paused = true)]
    async fn timer_fires_after_duration() {
        let fired = Arc::new(AtomicU32::new(0));
        let timer = Timer::new();

        let counter = Arc::clone(&fired);
        timer.start(Duration::from_millis(100), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        sleep(Duration::from_millis(99)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        sleep(Duration::from_millis(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timer.has_timer());
    }

    #[tokio::test(start_paused = true)]
    async fn cleared_timer_never_delivers() {
        let fired = Arc::new(AtomicU32::new(0));
        let timer = Timer::new();

        let counter = Arc::clone(&fired);
        timer.start(Duration::from_millis(50), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        timer.clear();

        sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_cancels_pending_firing() {
        let fired = Arc::new(AtomicU32::new(0));
        let timer = Timer::new();

        let first = Arc::clone(&fired);
        timer.start(Duration::from_millis(50), move || {
            first.fetch_add(1, Ordering::SeqCst);
        });

        sleep(Duration::from_millis(40)).await;
        let second = Arc::clone(&fired);
        timer.restart(Duration::from_millis(50), move || {
            second.fetch_add(10, Ordering::SeqCst);
        });

        // Original would have fired at 50ms; only the restarted one lands.
        sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn promise_timer_resolves_fired() {
        let timer = PromiseTimer::new(Duration::from_millis(100));
        let wait = tokio::spawn(async move { timer.start().await });

        advance(Duration::from_millis(101)).await;
        assert_eq!(wait.await.unwrap(), TimerLapse::Fired);
    }

    #[tokio::test(start_paused = true)]
    async fn promise_timer_clear_resolves_cleared() {
        let timer = Arc::new(PromiseTimer::new(Duration::from_secs(60)));
        let waiter = Arc::clone(&timer);
        let wait = tokio::spawn(async move { waiter.start().await });

        // Give the waiter a chance to register its cancel channel.
        sleep(Duration::from_millis(1)).await;
        timer.clear();
        assert_eq!(wait.await.unwrap(), TimerLapse::Cleared);
    }

    #[tokio::test(start_paused = true)]
    async fn racer_distinguishes_timeout_from_completion() {
        let timer = PromiseTimer::new(Duration::from_millis(100));
        let deadline = timer.start();
        tokio::pin!(deadline);

        let outcome = tokio::select! {
            value = async {
                sleep(Duration::from_millis(10)).await;
                42
            } => Ok(value),
            lapse = &mut deadline => Err(lapse),
        };
        assert_eq!(outcome, Ok(42));

        // The same pinned deadline still guards a second, slower race.
        let outcome = tokio::select! {
            value = async {
                sleep(Duration::from_secs(5)).await;
                43
            } => Ok(value),
            lapse = &mut deadline => Err(lapse),
        };
        assert_eq!(outcome, Err(TimerLapse::Fired));
    }
}
