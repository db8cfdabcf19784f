use std::sync::Arc;

use rand::Rng;
use tokio::sync::watch;

/// Observe sequence numbers are 24-bit values (RFC 7641 §3.4).
pub(crate) const MAX_SEQUENCE: u32 = 0x00ff_ffff;

/// Handle that the application uses to inform the server that an observable resource changed.
/// Each call to [`Observers::notify_change`] re-runs the resource's handler for every registered
/// observer and delivers the result as a notification.
///
/// Cheap to clone; all clones share the same sequence counter.
#[derive(Debug, Clone)]
pub struct Observers {
    notify_change_tx: Arc<watch::Sender<u32>>,
}

impl Default for Observers {
    fn default() -> Self {
        Self::new()
    }
}

impl Observers {
    pub fn new() -> Self {
        let initial = rand::thread_rng().gen_range(0..=MAX_SEQUENCE);
        let (notify_change_tx, _) = watch::channel(initial);
        Self {
            notify_change_tx: Arc::new(notify_change_tx),
        }
    }

    /// Note that spurious notifications will be delivered if this is spammed, so callers should
    /// only invoke it when a genuine change occurred.
    pub fn notify_change(&self) {
        self.notify_change_tx
            .send_modify(|sequence| *sequence = sequence.wrapping_add(1) & MAX_SEQUENCE);
    }

    /// Sequence number that the next registration or notification will carry.
    pub fn sequence(&self) -> u32 {
        *self.notify_change_tx.borrow()
    }

    /// Number of currently registered observers across all peers.
    pub fn observer_count(&self) -> usize {
        self.notify_change_tx.receiver_count()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<u32> {
        self.notify_change_tx.subscribe()
    }
}
