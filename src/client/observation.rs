//! Ownership of the (at most one) live observe stream of a [`crate::client::Requestor`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, error};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

/// Lifecycle of a requestor's observe stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum ObserveState {
    #[default]
    Idle,
    Requesting,
    Observing,
    Closed,
}

/// Shared view of the [`ObserveState`]: written by the requestor and its exchange tasks, read
/// (or watched) by the application.  Only the most recently started exchange may change it.
#[derive(Debug, Clone)]
pub(crate) struct StateTracker {
    tx: Arc<watch::Sender<ObserveState>>,
    latest: Arc<AtomicU64>,
}

impl Default for StateTracker {
    fn default() -> Self {
        let (tx, _) = watch::channel(ObserveState::Idle);
        Self {
            tx: Arc::new(tx),
            latest: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl StateTracker {
    /// Make `exchange` the latest one and move to [`ObserveState::Requesting`].
    pub fn begin(&self, exchange: u64) {
        self.latest.store(exchange, Ordering::SeqCst);
        self.tx.send_replace(ObserveState::Requesting);
    }

    /// Ignored unless `exchange` is still the latest one.
    pub fn set(&self, exchange: u64, state: ObserveState) {
        self.tx.send_if_modified(|current| {
            if self.latest.load(Ordering::SeqCst) != exchange || *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    pub fn get(&self) -> ObserveState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ObserveState> {
        self.tx.subscribe()
    }
}

/// Handle to an exchange task that keeps receiving notifications.  Closing (or dropping) it asks
/// the task to deregister from the server and end its event stream.
#[derive(Debug)]
pub(crate) struct Observation {
    id: u64,
    termination_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Observation {
    pub fn new(id: u64, termination_tx: oneshot::Sender<()>, task: JoinHandle<()>) -> Self {
        Self {
            id,
            termination_tx: Some(termination_tx),
            task: Some(task),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Signal termination and wait for the exchange task to wind down.
    pub async fn close(mut self) {
        debug!("Closing observation #{}", self.id);
        self.signal();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!("Observation #{} task panicked: {e}", self.id);
                }
            }
        }
    }

    fn signal(&mut self) {
        if let Some(tx) = self.termination_tx.take() {
            // The task may already have ended on its own (timeout, transport error).
            let _ = tx.send(());
        }
    }
}

impl Drop for Observation {
    fn drop(&mut self) {
        self.signal();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_close_signals_and_joins() {
        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            rx.await.unwrap();
        });
        let observation = Observation::new(3, tx, task);
        assert_eq!(observation.id(), 3);
        observation.close().await;
    }

    #[tokio::test]
    async fn test_drop_signals() {
        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(async move { rx.await.is_ok() });
        drop(Observation::new(1, tx, tokio::spawn(async {})));
        // The termination was delivered to the receiver of the dropped observation.
        assert!(task.await.unwrap());
    }

    #[test]
    fn test_state_tracker() {
        let tracker = StateTracker::default();
        let rx = tracker.subscribe();
        assert_eq!(tracker.get(), ObserveState::Idle);
        tracker.begin(0);
        tracker.clone().set(0, ObserveState::Observing);
        assert_eq!(*rx.borrow(), ObserveState::Observing);
    }

    #[test]
    fn test_stale_exchange_cannot_change_state() {
        let tracker = StateTracker::default();
        tracker.begin(1);
        tracker.begin(2);
        tracker.set(1, ObserveState::Idle);
        assert_eq!(tracker.get(), ObserveState::Requesting);
        tracker.set(2, ObserveState::Idle);
        assert_eq!(tracker.get(), ObserveState::Idle);
    }
}
