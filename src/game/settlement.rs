//! Delivery of resolved match results to the profile store and the escrow

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::payments::escrow::EscrowError;
use crate::store::supabase::SupabaseError;
use crate::ws::protocol::MatchResult;

/// Collaborator failures during settlement
#[derive(Debug, thiserror::Error)]
pub enum SettlementError {
    #[error("profile store: {0}")]
    Store(#[from] SupabaseError),

    #[error("escrow: {0}")]
    Escrow(#[from] EscrowError),
}

/// Persists finished matches (implemented by the profile store)
pub trait MatchRecorder: Send + Sync {
    fn record_match<'a>(&'a self, result: &'a MatchResult)
        -> BoxFuture<'a, Result<(), SettlementError>>;
}

/// Moves the wager according to a result (implemented by the escrow client).
/// Must be idempotent per room id.
pub trait WagerEscrow: Send + Sync {
    fn settle<'a>(&'a self, result: &'a MatchResult) -> BoxFuture<'a, Result<(), SettlementError>>;
}

/// What happened when a result was delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettlementReport {
    pub recorded: bool,
    /// None when escrow was not needed (zero wager)
    pub escrow_settled: Option<bool>,
}

/// Rooms remembered as delivered before the oldest is forgotten
const SETTLED_CAPACITY: usize = 4_096;

/// Recently delivered room ids, oldest evicted first
struct SettledRooms {
    members: HashSet<Uuid>,
    order: VecDeque<Uuid>,
    capacity: usize,
}

impl SettledRooms {
    fn new(capacity: usize) -> Self {
        Self {
            members: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// False when the room is already remembered
    fn insert(&mut self, room_id: Uuid) -> bool {
        if !self.members.insert(room_id) {
            return false;
        }
        self.order.push_back(room_id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        true
    }

    fn len(&self) -> usize {
        self.members.len()
    }
}

/// Runs collaborator delivery exactly once per room, with bounded retries.
///
/// Only the most recent rooms are remembered; the escrow call carries the
/// room id as its idempotency key, so a forgotten room can never pay twice.
pub struct Settlement {
    recorder: Arc<dyn MatchRecorder>,
    escrow: Arc<dyn WagerEscrow>,
    settled: Mutex<SettledRooms>,
    max_attempts: u32,
    base_backoff: Duration,
}

impl Settlement {
    pub fn new(recorder: Arc<dyn MatchRecorder>, escrow: Arc<dyn WagerEscrow>) -> Self {
        Self {
            recorder,
            escrow,
            settled: Mutex::new(SettledRooms::new(SETTLED_CAPACITY)),
            max_attempts: 3,
            base_backoff: Duration::from_millis(250),
        }
    }

    pub fn with_retry(mut self, max_attempts: u32, base_backoff: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.base_backoff = base_backoff;
        self
    }

    pub fn with_settled_capacity(mut self, capacity: usize) -> Self {
        self.settled = Mutex::new(SettledRooms::new(capacity));
        self
    }

    /// Number of room ids currently remembered as delivered
    pub fn tracked_rooms(&self) -> usize {
        self.settled.lock().len()
    }

    /// Deliver a result. A second delivery for the same room is skipped.
    pub async fn deliver(&self, result: &MatchResult) -> Option<SettlementReport> {
        if !self.settled.lock().insert(result.room_id) {
            warn!(room_id = %result.room_id, "Result already delivered, skipping");
            return None;
        }

        let recorded = self
            .with_retries(result.room_id, "record_match", || {
                self.recorder.record_match(result)
            })
            .await;

        let escrow_settled = if result.wager > 0 {
            Some(
                self.with_retries(result.room_id, "escrow_settle", || self.escrow.settle(result))
                    .await,
            )
        } else {
            None
        };

        info!(
            room_id = %result.room_id,
            reason = ?result.reason,
            recorded,
            escrow_settled = ?escrow_settled,
            "Match result delivered"
        );

        Some(SettlementReport {
            recorded,
            escrow_settled,
        })
    }

    async fn with_retries<'a, F>(&self, room_id: Uuid, operation: &'static str, mut call: F) -> bool
    where
        F: FnMut() -> BoxFuture<'a, Result<(), SettlementError>>,
    {
        let mut backoff = self.base_backoff;
        for attempt in 1..=self.max_attempts {
            match call().await {
                Ok(()) => return true,
                Err(e) if attempt < self.max_attempts => {
                    warn!(room_id = %room_id, operation, attempt, error = %e, "Settlement call failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => {
                    error!(room_id = %room_id, operation, attempt, error = %e, "Settlement call failed, giving up");
                }
            }
        }
        false
    }
}
