//! Matchmaking service - manages the queue and room creation

use serde::Serialize;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::game::arena::Entrant;
use crate::game::{Contender, RoomSpawner};
use crate::ws::protocol::{Fighter, QueueClass, ServerMsg};
use crate::ws::session::{Session, Transport};

use super::queue::{MatchmakingQueue, QueueEntry, QueueJoin};

/// How often the tutorial fallback sweep runs
const SWEEP_INTERVAL: Duration = Duration::from_millis(500);

const MAX_FIGHTER_NAME: usize = 32;
const MAX_FIGHTER_HEALTH: u32 = 1_000;

/// Reasons a join request is refused
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("already playing in a room")]
    AlreadyInRoom,

    #[error("invalid fighter: {0}")]
    InvalidFighter(&'static str),

    #[error("wager must be between {min} and {max}")]
    InvalidWager { min: u64, max: u64 },
}

impl QueueError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::AlreadyInRoom => "already_in_room",
            Self::InvalidFighter(_) => "invalid_fighter",
            Self::InvalidWager { .. } => "invalid_wager",
        }
    }
}

/// What a successful join led to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Queued { position: usize },
    Matched { room_id: Uuid },
}

/// Queue sizes for the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub queued: usize,
    pub classes: Vec<ClassStatus>,
    pub active_rooms: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassStatus {
    pub queue_class: QueueClass,
    pub waiting: usize,
}

/// Matchmaking service
pub struct MatchmakingService {
    queue: Mutex<MatchmakingQueue>,
    spawner: RoomSpawner,
}

impl MatchmakingService {
    pub fn new(spawner: RoomSpawner) -> Self {
        Self {
            queue: Mutex::new(MatchmakingQueue::new()),
            spawner,
        }
    }

    /// Join matchmaking queue. Pairing, the room spawn and the membership
    /// reservation all happen while the queue lock is held.
    pub async fn join(
        &self,
        session: &Session,
        fighter: Fighter,
        wager: u64,
        class: QueueClass,
    ) -> Result<JoinOutcome, QueueError> {
        validate_fighter(&fighter)?;
        if !class.ignores_wager() {
            let config = self.spawner.config();
            if !(config.min_wager..=config.max_wager).contains(&wager) {
                return Err(QueueError::InvalidWager {
                    min: config.min_wager,
                    max: config.max_wager,
                });
            }
        }

        let mut queue = self.queue.lock().await;
        if self.spawner.registry().room_of(&session.id).is_some() {
            return Err(QueueError::AlreadyInRoom);
        }

        let entry = QueueEntry::new(
            session.id,
            session.wallet.clone(),
            fighter,
            wager,
            class,
            session.transport.clone(),
        );

        match queue.join(entry) {
            QueueJoin::Enqueued { position } => {
                info!(session_id = %session.id, queue_class = ?class, wager, position, "Session joined matchmaking queue");
                session.send(ServerMsg::QueueJoined {
                    queue_class: class,
                    position,
                });
                Ok(JoinOutcome::Queued { position })
            }
            QueueJoin::Paired { waiting, arriving } => {
                Ok(self.start_pair(&mut queue, waiting, arriving))
            }
        }
    }

    /// Spawn a room for a fresh pair, or void the pairing when either side
    /// has already lost its connection
    fn start_pair(
        &self,
        queue: &mut MatchmakingQueue,
        waiting: QueueEntry,
        arriving: QueueEntry,
    ) -> JoinOutcome {
        let arriving_id = arriving.session_id;

        match (waiting.transport.is_open(), arriving.transport.is_open()) {
            (true, true) => {
                let wager = waiting.wager;
                let handle = self
                    .spawner
                    .spawn([contender(waiting), contender(arriving)], wager);
                info!(
                    room_id = %handle.id,
                    first = %handle.participants[0],
                    second = %handle.participants[1],
                    wager,
                    "Paired sessions into a new room"
                );
                JoinOutcome::Matched { room_id: handle.id }
            }
            (waiting_open, arriving_open) => {
                warn!(
                    waiting = %waiting.session_id,
                    arriving = %arriving_id,
                    waiting_open,
                    arriving_open,
                    "Match voided: transport closed at pairing"
                );
                let survivor = [(waiting, waiting_open), (arriving, arriving_open)]
                    .into_iter()
                    .find_map(|(entry, open)| open.then_some(entry));

                let mut outcome = JoinOutcome::Queued { position: 0 };
                if let Some(entry) = survivor {
                    let class = entry.class;
                    let is_caller = entry.session_id == arriving_id;
                    entry.transport.send(ServerMsg::QueueJoined {
                        queue_class: class,
                        position: 1,
                    });
                    queue.requeue_front(entry);
                    if is_caller {
                        outcome = JoinOutcome::Queued { position: 1 };
                    }
                }
                outcome
            }
        }
    }

    /// Leave matchmaking queue. Not being queued is a no-op.
    pub async fn leave(&self, session_id: Uuid) -> bool {
        let removed = self.queue.lock().await.leave(session_id).is_some();
        if removed {
            info!(session_id = %session_id, "Session left matchmaking queue");
        }
        removed
    }

    /// Route a queued session's future messages to its newest connection
    pub async fn update_transport(&self, session_id: Uuid, transport: Transport) -> bool {
        self.queue
            .lock()
            .await
            .update_transport(session_id, transport)
    }

    /// Give long-waiting tutorial entries a bot opponent
    pub async fn sweep_tutorial(&self) -> usize {
        let wait = self.spawner.config().tutorial_bot_wait;
        let mut queue = self.queue.lock().await;
        let ready = queue.take_waited(QueueClass::Tutorial, wait, Instant::now());

        let mut spawned = 0;
        for entry in ready {
            if !entry.transport.is_open() {
                debug!(session_id = %entry.session_id, "Dropping tutorial entry with closed transport");
                continue;
            }
            if self.spawner.registry().room_of(&entry.session_id).is_some() {
                continue;
            }
            let bot = Contender {
                entrant: Entrant::bot(&entry.fighter),
                transport: None,
            };
            let session_id = entry.session_id;
            let handle = self.spawner.spawn([contender(entry), bot], 0);
            info!(room_id = %handle.id, session_id = %session_id, "Tutorial entry matched against bot");
            spawned += 1;
        }
        spawned
    }

    /// Run the matchmaking service (periodic tutorial sweep)
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);

        loop {
            interval.tick().await;
            self.sweep_tutorial().await;
        }
    }

    /// Get current queue size
    pub async fn queue_size(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Check if a session is queued
    pub async fn is_in_queue(&self, session_id: &Uuid) -> bool {
        self.queue.lock().await.contains(session_id)
    }

    pub async fn status(&self) -> QueueStatus {
        let queue = self.queue.lock().await;
        let mut classes: Vec<ClassStatus> = queue
            .class_sizes()
            .into_iter()
            .map(|(queue_class, waiting)| ClassStatus {
                queue_class,
                waiting,
            })
            .collect();
        classes.sort_by_key(|c| match c.queue_class {
            QueueClass::Tier(tier) => u64::from(tier),
            QueueClass::Tutorial => u64::MAX,
        });

        QueueStatus {
            queued: queue.len(),
            classes,
            active_rooms: self.spawner.registry().active_rooms(),
        }
    }
}

fn contender(entry: QueueEntry) -> Contender {
    Contender {
        entrant: Entrant::human(entry.session_id, entry.wallet, entry.fighter),
        transport: Some(entry.transport),
    }
}

fn validate_fighter(fighter: &Fighter) -> Result<(), QueueError> {
    let name = fighter.name.trim();
    if name.is_empty() {
        return Err(QueueError::InvalidFighter("name is empty"));
    }
    if name.chars().count() > MAX_FIGHTER_NAME {
        return Err(QueueError::InvalidFighter("name is too long"));
    }
    if fighter.max_health == 0 || fighter.max_health > MAX_FIGHTER_HEALTH {
        return Err(QueueError::InvalidFighter("max health out of range"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GameConfig;
    use crate::game::settlement::testing::settlement;
    use crate::game::spectators::SpectatorIndex;
    use crate::game::{RoomContext, RoomRegistry};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn service() -> MatchmakingService {
        let (settlement, _, _) = settlement();
        let ctx = RoomContext {
            config: Arc::new(GameConfig::default()),
            registry: Arc::new(RoomRegistry::new()),
            spectator_index: Arc::new(SpectatorIndex::new()),
            settlement,
        };
        MatchmakingService::new(RoomSpawner::new(ctx))
    }

    fn session() -> (Session, mpsc::Receiver<ServerMsg>) {
        let (transport, rx) = Transport::channel();
        let id = Uuid::new_v4();
        (Session::new(id, format!("wallet-{id}"), transport), rx)
    }

    fn fighter() -> Fighter {
        Fighter {
            name: "Rex".to_string(),
            max_health: 100,
        }
    }

    #[tokio::test]
    async fn equal_wagers_pair_into_a_room() {
        let mm = service();
        let (a, mut a_rx) = session();
        let (b, mut b_rx) = session();

        let outcome = mm.join(&a, fighter(), 100, QueueClass::Tier(1)).await.unwrap();
        assert_eq!(outcome, JoinOutcome::Queued { position: 1 });
        assert!(matches!(a_rx.recv().await, Some(ServerMsg::QueueJoined { position: 1, .. })));

        let JoinOutcome::Matched { room_id } =
            mm.join(&b, fighter(), 100, QueueClass::Tier(1)).await.unwrap()
        else {
            panic!("expected a match");
        };

        let registry = mm.spawner.registry();
        assert_eq!(registry.room_of(&a.id), Some(room_id));
        assert_eq!(registry.room_of(&b.id), Some(room_id));
        assert_eq!(mm.queue_size().await, 0);

        assert!(matches!(
            a_rx.recv().await,
            Some(ServerMsg::MatchFound { is_first_participant: true, .. })
        ));
        assert!(matches!(
            b_rx.recv().await,
            Some(ServerMsg::MatchFound { is_first_participant: false, .. })
        ));

        // a participant cannot queue again while its room is live
        assert_eq!(
            mm.join(&a, fighter(), 100, QueueClass::Tier(1)).await,
            Err(QueueError::AlreadyInRoom)
        );
    }

    #[tokio::test]
    async fn different_wagers_stay_queued() {
        let mm = service();
        let (a, _a_rx) = session();
        let (b, _b_rx) = session();

        mm.join(&a, fighter(), 100, QueueClass::Tier(1)).await.unwrap();
        let outcome = mm.join(&b, fighter(), 50, QueueClass::Tier(1)).await.unwrap();
        assert_eq!(outcome, JoinOutcome::Queued { position: 2 });
        assert_eq!(mm.spawner.registry().active_rooms(), 0);

        let status = mm.status().await;
        assert_eq!(status.queued, 2);
        assert_eq!(status.classes.len(), 1);
    }

    #[tokio::test]
    async fn invalid_requests_are_refused() {
        let mm = service();
        let (a, _rx) = session();

        let err = mm.join(&a, fighter(), 0, QueueClass::Tier(1)).await.unwrap_err();
        assert_eq!(err.code(), "invalid_wager");

        let nameless = Fighter {
            name: "  ".to_string(),
            max_health: 100,
        };
        let err = mm.join(&a, nameless, 100, QueueClass::Tier(1)).await.unwrap_err();
        assert_eq!(err.code(), "invalid_fighter");

        // tutorial ignores the wager bounds entirely
        assert!(mm.join(&a, fighter(), 0, QueueClass::Tutorial).await.is_ok());
        assert!(mm.is_in_queue(&a.id).await);
    }

    #[tokio::test]
    async fn closed_waiter_voids_pairing_and_requeues_survivor() {
        let mm = service();
        let (a, a_rx) = session();
        let (b, _b_rx) = session();

        mm.join(&a, fighter(), 100, QueueClass::Tier(1)).await.unwrap();
        drop(a_rx);

        let outcome = mm.join(&b, fighter(), 100, QueueClass::Tier(1)).await.unwrap();
        assert_eq!(outcome, JoinOutcome::Queued { position: 1 });
        assert_eq!(mm.spawner.registry().active_rooms(), 0);
        assert!(mm.is_in_queue(&b.id).await);
        assert!(!mm.is_in_queue(&a.id).await);
    }

    #[tokio::test]
    async fn leave_is_idempotent() {
        let mm = service();
        let (a, _rx) = session();
        mm.join(&a, fighter(), 100, QueueClass::Tier(1)).await.unwrap();

        assert!(mm.leave(a.id).await);
        assert!(!mm.leave(a.id).await);
        assert_eq!(mm.queue_size().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn tutorial_entry_gets_bot_after_waiting() {
        let mm = service();
        let (a, mut a_rx) = session();
        mm.join(&a, fighter(), 0, QueueClass::Tutorial).await.unwrap();
        let _ = a_rx.recv().await;

        tokio::time::advance(Duration::from_secs(14)).await;
        assert_eq!(mm.sweep_tutorial().await, 0);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(mm.sweep_tutorial().await, 1);
        assert!(mm.spawner.registry().room_of(&a.id).is_some());

        match a_rx.recv().await {
            Some(ServerMsg::MatchFound { opponent, .. }) => assert!(opponent.is_bot),
            other => panic!("expected MatchFound, got {other:?}"),
        }
    }
}
