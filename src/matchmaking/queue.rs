//! Matchmaking queue implementation

use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::ws::protocol::{Fighter, QueueClass};
use crate::ws::session::Transport;

/// A session waiting for an opponent
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub session_id: Uuid,
    pub wallet: String,
    pub fighter: Fighter,
    /// Always 0 in the tutorial class
    pub wager: u64,
    pub class: QueueClass,
    pub transport: Transport,
    pub enqueued_at: Instant,
}

impl QueueEntry {
    pub fn new(
        session_id: Uuid,
        wallet: impl Into<String>,
        fighter: Fighter,
        wager: u64,
        class: QueueClass,
        transport: Transport,
    ) -> Self {
        Self {
            session_id,
            wallet: wallet.into(),
            fighter,
            wager: if class.ignores_wager() { 0 } else { wager },
            class,
            transport,
            enqueued_at: Instant::now(),
        }
    }

    /// How long this entry has been waiting
    pub fn wait_time(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.enqueued_at)
    }

    fn pairs_with(&self, other: &QueueEntry) -> bool {
        self.class == other.class && (self.class.ignores_wager() || self.wager == other.wager)
    }
}

/// Result of adding an entry
#[derive(Debug)]
pub enum QueueJoin {
    /// No compatible opponent; 1-based position within the class
    Enqueued { position: usize },
    /// Both entries have left the queue
    Paired {
        waiting: QueueEntry,
        arriving: QueueEntry,
    },
}

/// FIFO queues partitioned by class
#[derive(Default)]
pub struct MatchmakingQueue {
    classes: HashMap<QueueClass, VecDeque<QueueEntry>>,
}

impl MatchmakingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry, pairing it with the oldest compatible waiter if there is one.
    /// A session already queued has its old entry replaced.
    pub fn join(&mut self, entry: QueueEntry) -> QueueJoin {
        self.leave(entry.session_id);

        let waiters = self.classes.entry(entry.class).or_default();
        if let Some(index) = waiters.iter().position(|w| w.pairs_with(&entry)) {
            if let Some(waiting) = waiters.remove(index) {
                return QueueJoin::Paired {
                    waiting,
                    arriving: entry,
                };
            }
        }

        waiters.push_back(entry);
        QueueJoin::Enqueued {
            position: waiters.len(),
        }
    }

    /// Remove a session's entry. Not being queued is a no-op.
    pub fn leave(&mut self, session_id: Uuid) -> Option<QueueEntry> {
        for waiters in self.classes.values_mut() {
            if let Some(pos) = waiters.iter().position(|e| e.session_id == session_id) {
                return waiters.remove(pos);
            }
        }
        None
    }

    /// Put an entry back at the head of its class, keeping its original wait time
    pub fn requeue_front(&mut self, entry: QueueEntry) {
        self.leave(entry.session_id);
        self.classes.entry(entry.class).or_default().push_front(entry);
    }

    /// Remove every entry of `class` that has waited at least `wait`
    pub fn take_waited(&mut self, class: QueueClass, wait: Duration, now: Instant) -> Vec<QueueEntry> {
        let Some(waiters) = self.classes.get_mut(&class) else {
            return Vec::new();
        };
        let (ready, still_waiting): (VecDeque<_>, VecDeque<_>) = waiters
            .drain(..)
            .partition(|e| e.wait_time(now) >= wait);
        *waiters = still_waiting;
        ready.into()
    }

    /// Point a queued session at its newest connection
    pub fn update_transport(&mut self, session_id: Uuid, transport: Transport) -> bool {
        match self
            .classes
            .values_mut()
            .flat_map(|w| w.iter_mut())
            .find(|e| e.session_id == session_id)
        {
            Some(entry) => {
                entry.transport = transport;
                true
            }
            None => false,
        }
    }

    /// Check if a session is queued
    pub fn contains(&self, session_id: &Uuid) -> bool {
        self.classes
            .values()
            .any(|w| w.iter().any(|e| &e.session_id == session_id))
    }

    /// Get total queue length
    pub fn len(&self) -> usize {
        self.classes.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Non-empty classes and their sizes
    pub fn class_sizes(&self) -> Vec<(QueueClass, usize)> {
        self.classes
            .iter()
            .filter(|(_, w)| !w.is_empty())
            .map(|(class, w)| (*class, w.len()))
            .collect()
    }
}
