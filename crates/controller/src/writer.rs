//! Ordered write queue between the controller and the store.
//!
//! The controller loop never awaits the store: it enqueues writes here and a
//! single drain task applies them in submission order. Writes are tagged with
//! the mode epoch current at submission; once the epoch advances (a mode
//! change), anything still queued from the old epoch is dropped instead of
//! racing the new mode's writes.
//!
//! The drain is serial, so one stalled write holds back every later one for
//! up to the write timeout. While the store stays unreachable the backlog is
//! capped at [`MAX_PENDING`] writes; anything beyond that is dropped and
//! logged, and the next push from the store corrects the local mirror.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::store::StateStore;

/// Writes allowed to wait in the queue at once.
pub const MAX_PENDING: usize = 256;

enum Job {
    Write {
        /// `None` for writes that outlive mode changes (alerts).
        epoch: Option<u64>,
        key: String,
        value: Value,
    },
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct WriteQueue {
    tx: mpsc::UnboundedSender<Job>,
    epoch: Arc<AtomicU64>,
    pending: Arc<AtomicUsize>,
}

impl WriteQueue {
    /// Start the drain task. It ends once every `WriteQueue` clone is dropped.
    pub fn spawn<S: StateStore>(store: S, timeout: Duration) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let epoch = Arc::new(AtomicU64::new(0));
        let pending = Arc::new(AtomicUsize::new(0));
        let handle = tokio::spawn(drain(
            store,
            rx,
            Arc::clone(&epoch),
            Arc::clone(&pending),
            timeout,
        ));
        (
            Self {
                tx,
                epoch,
                pending,
            },
            handle,
        )
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Start a new mode epoch; queued writes from earlier epochs are dropped.
    pub fn advance_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Queue a write scoped to the current mode epoch.
    pub fn submit(&self, key: &str, value: impl Into<Value>) {
        self.enqueue(Some(self.epoch()), key, value.into());
    }

    /// Queue a write that is applied regardless of later mode changes.
    pub fn submit_unscoped(&self, key: &str, value: impl Into<Value>) {
        self.enqueue(None, key, value.into());
    }

    /// Wait until everything queued before this call has been processed.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(Job::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }

    fn enqueue(&self, epoch: Option<u64>, key: &str, value: Value) {
        let backlog = self.pending.fetch_add(1, Ordering::SeqCst);
        if backlog >= MAX_PENDING {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            error!(key, backlog, "write queue full; dropping write");
            return;
        }
        let job = Job::Write {
            epoch,
            key: key.to_string(),
            value,
        };
        if self.tx.send(job).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            warn!(key, "write queue closed; dropping write");
        }
    }
}

async fn drain<S: StateStore>(
    store: S,
    mut rx: mpsc::UnboundedReceiver<Job>,
    epoch: Arc<AtomicU64>,
    pending: Arc<AtomicUsize>,
    timeout: Duration,
) {
    while let Some(job) = rx.recv().await {
        match job {
            Job::Write { epoch: tag, key, value } => {
                pending.fetch_sub(1, Ordering::SeqCst);
                if let Some(tag) = tag {
                    let current = epoch.load(Ordering::SeqCst);
                    if tag < current {
                        debug!(key = %key, tag, current, "dropping write from superseded mode epoch");
                        continue;
                    }
                }

                match tokio::time::timeout(timeout, store.write(&key, value)).await {
                    Ok(Ok(())) => debug!(key = %key, "store write applied"),
                    Ok(Err(e)) => error!(key = %key, "store write failed: {e:#}"),
                    Err(_) => error!(key = %key, ?timeout, "store write timed out"),
                }
            }
            Job::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn queue(store: &MemoryStore) -> WriteQueue {
        WriteQueue::spawn(store.clone(), Duration::from_secs(1)).0
    }

    #[tokio::test]
    async fn writes_apply_in_submission_order() {
        let store = MemoryStore::new();
        let q = queue(&store);

        q.submit("motor_1", false);
        q.submit("isCounting", false);
        q.submit("timer", 0);
        q.submit("operation_mode", "Auto");
        q.flush().await;

        let keys: Vec<String> = store.writes().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["motor_1", "isCounting", "timer", "operation_mode"]);
    }

    #[tokio::test]
    async fn advancing_epoch_drops_queued_stale_writes() {
        let store = MemoryStore::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let epoch = Arc::new(AtomicU64::new(0));
        let pending = Arc::new(AtomicUsize::new(0));
        let q = WriteQueue {
            tx,
            epoch: Arc::clone(&epoch),
            pending: Arc::clone(&pending),
        };

        // Queue an old-epoch write before the drain task exists, then move on.
        q.submit("motor_2", true);
        q.advance_epoch();
        q.submit("motor_2", false);
        q.submit_unscoped("low_moisture_alert", json!({"plants": [2]}));

        tokio::spawn(drain(store.clone(), rx, epoch, pending, Duration::from_secs(1)));
        q.flush().await;

        assert_eq!(store.writes_to("motor_2"), vec![json!(false)]);
        assert_eq!(store.writes_to("low_moisture_alert").len(), 1);
    }

    #[tokio::test]
    async fn failed_write_does_not_block_later_writes() {
        let store = MemoryStore::new();
        store.fail_writes_to("motor_1");
        let q = queue(&store);

        q.submit("motor_1", true);
        q.submit("motor_2", true);
        q.flush().await;

        assert!(store.writes_to("motor_1").is_empty());
        assert_eq!(store.writes_to("motor_2"), vec![json!(true)]);
    }

    #[test]
    fn advance_epoch_returns_new_value() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let q = WriteQueue {
            tx,
            epoch: Arc::new(AtomicU64::new(0)),
            pending: Arc::new(AtomicUsize::new(0)),
        };
        assert_eq!(q.advance_epoch(), 1);
        assert_eq!(q.advance_epoch(), 2);
        assert_eq!(q.epoch(), 2);
    }

    #[tokio::test]
    async fn backlog_is_capped_while_store_is_stalled() {
        let store = MemoryStore::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let epoch = Arc::new(AtomicU64::new(0));
        let pending = Arc::new(AtomicUsize::new(0));
        let q = WriteQueue {
            tx,
            epoch: Arc::clone(&epoch),
            pending: Arc::clone(&pending),
        };

        // Nothing drains yet, as with a store that stopped answering.
        for n in 0..MAX_PENDING + 10 {
            q.submit("timer", n);
        }
        assert_eq!(pending.load(Ordering::SeqCst), MAX_PENDING);

        tokio::spawn(drain(
            store.clone(),
            rx,
            epoch,
            Arc::clone(&pending),
            Duration::from_secs(1),
        ));
        q.flush().await;
        assert_eq!(store.writes_to("timer").len(), MAX_PENDING);
        assert_eq!(pending.load(Ordering::SeqCst), 0);

        // Room again once the backlog drained.
        q.submit("timer", 0);
        q.flush().await;
        assert_eq!(store.writes_to("timer").last(), Some(&json!(0)));
    }
}
