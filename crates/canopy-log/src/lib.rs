//! In-memory replication log.
//!
//! Stands in for the durable, totally-ordered consensus log: accepts
//! opaque payload bytes with an ordering-only batch hint and delivers
//! consensus outcomes to subscribers in submission order. A paused log
//! models the open-ended pending state of an undecided submission — there
//! is no negative acknowledgement path, a submission either reaches
//! consensus eventually or stays pending forever.

pub mod error;
pub mod payload;

pub use error::{Error, Result};
pub use payload::{Payload, PayloadKey};

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A consensus outcome delivered to subscribers.
#[derive(Debug, Clone)]
pub struct Replicated {
    /// Position in the log, starting at 1.
    pub index: u64,
    pub payload: Payload,
}

/// Handle to the in-memory log. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct ReplicationLog {
    inner: Arc<Mutex<Inner>>,
}

impl Default for ReplicationLog {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct Inner {
    entries: Vec<Entry>,
    pending: VecDeque<Entry>,
    next_index: u64,
    paused: bool,
    subscribers: Vec<mpsc::UnboundedSender<Replicated>>,
}

struct Entry {
    index: u64,
    bytes: Vec<u8>,
    batch_hint: bool,
}

impl ReplicationLog {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_index: 1,
                ..Inner::default()
            })),
        }
    }

    /// Submit a payload for replication. Returns the log index the entry
    /// will occupy once consensus is reached. `batch_hint` signals that
    /// another submission is expected immediately; the log only records
    /// it.
    pub fn submit(&self, payload: &Payload, batch_hint: bool) -> Result<u64> {
        let bytes = payload.encode()?;
        let mut inner = self.inner.lock();
        let index = inner.next_index;
        inner.next_index += 1;

        let entry = Entry {
            index,
            bytes,
            batch_hint,
        };

        if inner.paused {
            tracing::debug!("log: holding {} at index {} (paused)", payload, index);
            inner.pending.push_back(entry);
        } else {
            tracing::debug!("log: consensus on {} at index {}", payload, index);
            inner.deliver(entry);
        }
        Ok(index)
    }

    /// Subscribe to consensus outcomes. Entries already decided are
    /// replayed first, then live outcomes follow in order.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Replicated> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        for entry in &inner.entries {
            let payload = match Payload::decode(&entry.bytes) {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::error!("log: undecodable entry at index {}: {}", entry.index, e);
                    continue;
                }
            };
            let _ = tx.send(Replicated {
                index: entry.index,
                payload,
            });
        }
        inner.subscribers.push(tx);
        rx
    }

    /// Stop reaching consensus; submissions accumulate undecided.
    pub fn pause(&self) {
        self.inner.lock().paused = true;
    }

    /// Resume consensus, deciding held submissions in order.
    pub fn release(&self) {
        let mut inner = self.inner.lock();
        inner.paused = false;
        while let Some(entry) = inner.pending.pop_front() {
            inner.deliver(entry);
        }
    }

    /// Number of decided entries.
    pub fn decided_len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Batch hints of decided entries, in log order. For tests.
    pub fn decided_hints(&self) -> Vec<bool> {
        self.inner
            .lock()
            .entries
            .iter()
            .map(|entry| entry.batch_hint)
            .collect()
    }
}

impl Inner {
    fn deliver(&mut self, entry: Entry) {
        match Payload::decode(&entry.bytes) {
            Ok(payload) => {
                self.subscribers.retain(|subscriber| {
                    subscriber
                        .send(Replicated {
                            index: entry.index,
                            payload: payload.clone(),
                        })
                        .is_ok()
                });
            }
            Err(e) => {
                tracing::error!("log: undecodable entry at index {}: {}", entry.index, e);
            }
        }
        self.entries.push(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_common::{ClientId, FrontendId, LocalHistoryId, TransactionId};

    fn tx_id(n: u64) -> TransactionId {
        let client = ClientId::new(FrontendId::new("member-1"), 0);
        TransactionId::new(LocalHistoryId::standalone(client), n)
    }

    #[tokio::test]
    async fn test_submit_and_subscribe() {
        let log = ReplicationLog::new();
        let mut rx = log.subscribe();

        let index = log
            .submit(&Payload::AbortTransaction { id: tx_id(1) }, false)
            .unwrap();
        assert_eq!(index, 1);

        let replicated = rx.recv().await.unwrap();
        assert_eq!(replicated.index, 1);
        assert!(matches!(
            replicated.payload,
            Payload::AbortTransaction { .. }
        ));
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_history() {
        let log = ReplicationLog::new();
        log.submit(&Payload::AbortTransaction { id: tx_id(1) }, false)
            .unwrap();
        log.submit(&Payload::PurgeTransaction { id: tx_id(1) }, false)
            .unwrap();

        let mut rx = log.subscribe();
        assert_eq!(rx.recv().await.unwrap().index, 1);
        assert_eq!(rx.recv().await.unwrap().index, 2);
    }

    #[tokio::test]
    async fn test_pause_holds_consensus() {
        let log = ReplicationLog::new();
        let mut rx = log.subscribe();

        log.pause();
        log.submit(&Payload::AbortTransaction { id: tx_id(1) }, false)
            .unwrap();
        assert_eq!(log.decided_len(), 0);
        assert!(rx.try_recv().is_err());

        log.release();
        assert_eq!(log.decided_len(), 1);
        assert_eq!(rx.recv().await.unwrap().index, 1);
    }

    #[tokio::test]
    async fn test_ordering_preserved_across_release() {
        let log = ReplicationLog::new();
        let mut rx = log.subscribe();

        log.pause();
        for n in 1..=3 {
            log.submit(&Payload::PurgeTransaction { id: tx_id(n) }, false)
                .unwrap();
        }
        log.release();

        for expected in 1..=3 {
            assert_eq!(rx.recv().await.unwrap().index, expected);
        }
    }

    #[test]
    fn test_batch_hints_recorded() {
        let log = ReplicationLog::new();
        log.submit(&Payload::AbortTransaction { id: tx_id(1) }, true)
            .unwrap();
        log.submit(&Payload::AbortTransaction { id: tx_id(2) }, false)
            .unwrap();
        assert_eq!(log.decided_hints(), vec![true, false]);
    }
}
