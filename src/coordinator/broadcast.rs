//! Snapshot fan-out with replay
//!
//! Live delivery goes through a `tokio::sync::broadcast` channel, whose
//! bounded ring drops the oldest entries for a subscriber that falls behind.
//! The last few snapshots are also kept in a replay buffer so a late
//! subscriber starts with recent history instead of nothing.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::debug;

use super::state::RouteSnapshot;

/// Default number of snapshots replayed to a new subscriber
pub const DEFAULT_REPLAY: usize = 10;

/// Default live buffer per subscriber
pub const DEFAULT_BUFFER: usize = 200;

/// Single-producer, multi-consumer snapshot publisher
#[derive(Debug)]
pub struct SnapshotBroadcaster {
    tx: broadcast::Sender<RouteSnapshot>,
    /// Most recent snapshots, oldest first. Publishing and subscribing both
    /// hold this lock so a subscriber sees no gap and no duplicate between
    /// replay and live delivery.
    history: Mutex<VecDeque<RouteSnapshot>>,
    replay: usize,
}

impl Default for SnapshotBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_REPLAY, DEFAULT_BUFFER)
    }
}

impl SnapshotBroadcaster {
    /// Create a broadcaster
    ///
    /// `buffer` is clamped to at least one slot.
    #[must_use]
    pub fn new(replay: usize, buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer.max(1));
        Self {
            tx,
            history: Mutex::new(VecDeque::with_capacity(replay)),
            replay,
        }
    }

    /// Publish a snapshot to every subscriber
    pub fn publish(&self, snapshot: RouteSnapshot) {
        let mut history = self.history.lock();
        if self.replay > 0 {
            if history.len() == self.replay {
                history.pop_front();
            }
            history.push_back(snapshot.clone());
        }
        // No receivers is fine; history still records it
        let _ = self.tx.send(snapshot);
    }

    /// Subscribe: replayed history first, then live snapshots
    #[must_use]
    pub fn subscribe(&self) -> SnapshotSubscription {
        let history = self.history.lock();
        SnapshotSubscription {
            pending: history.clone(),
            rx: self.tx.subscribe(),
        }
    }

    /// Most recent snapshot, if any was published
    #[must_use]
    pub fn latest(&self) -> Option<RouteSnapshot> {
        self.history.lock().back().cloned()
    }

    /// Number of live subscribers
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Receiving end of a [`SnapshotBroadcaster`]
#[derive(Debug)]
pub struct SnapshotSubscription {
    pending: VecDeque<RouteSnapshot>,
    rx: broadcast::Receiver<RouteSnapshot>,
}

impl SnapshotSubscription {
    /// Next snapshot
    ///
    /// Returns `None` once the broadcaster is gone. Snapshots overwritten
    /// while this subscriber lagged are skipped.
    pub async fn recv(&mut self) -> Option<RouteSnapshot> {
        if let Some(snapshot) = self.pending.pop_front() {
            return Some(snapshot);
        }
        loop {
            match self.rx.recv().await {
                Ok(snapshot) => return Some(snapshot),
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "snapshot subscriber lagged, oldest dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next snapshot if one is ready now
    pub fn try_recv(&mut self) -> Option<RouteSnapshot> {
        if let Some(snapshot) = self.pending.pop_front() {
            return Some(snapshot);
        }
        loop {
            match self.rx.try_recv() {
                Ok(snapshot) => return Some(snapshot),
                Err(TryRecvError::Lagged(skipped)) => {
                    debug!(skipped, "snapshot subscriber lagged, oldest dropped");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }
}
