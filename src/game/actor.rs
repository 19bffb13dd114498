//! Per-room actor and authoritative tick loop
//!
//! Every room runs as its own task. Commands from transports are queued on an
//! mpsc channel and drained in arrival order at the start of each tick, so a
//! room never has more than one writer and rooms never share mutable state.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::GameConfig;
use crate::util::time::{tick_duration, unix_millis, SNAPSHOT_EVERY_TICKS};
use crate::ws::protocol::{
    OpponentSummary, PhaseKind, Rejection, RoomSnapshot, ServerMsg,
};
use crate::ws::session::Transport;

use super::arena::{Entrant, ParticipantKind, Seat};
use super::bot;
use super::events::{outbound_messages, Audience, RoomEvent};
use super::registry::{RoomHandle, RoomRegistry};
use super::room::BattleRoom;
use super::settlement::Settlement;
use super::spectators::{SpectateError, SpectatorIndex, Spectators};
use super::ActionRequest;

/// Commands capacity per room
const COMMAND_BUFFER: usize = 256;

/// Input to a room actor
#[derive(Debug)]
pub enum RoomCommand {
    Action {
        session_id: Uuid,
        request: ActionRequest,
    },
    Disconnect {
        session_id: Uuid,
    },
    Reconnect {
        session_id: Uuid,
        transport: Transport,
        reply: oneshot::Sender<Result<RoomSnapshot, Rejection>>,
    },
    Spectate {
        spectator: Uuid,
        transport: Transport,
        reply: oneshot::Sender<Result<RoomSnapshot, SpectateError>>,
    },
    StopSpectating {
        spectator: Uuid,
    },
}

/// Shared services every room needs
#[derive(Clone)]
pub struct RoomContext {
    pub config: Arc<GameConfig>,
    pub registry: Arc<RoomRegistry>,
    pub spectator_index: Arc<SpectatorIndex>,
    pub settlement: Arc<Settlement>,
}

/// One side of a new room: who fights and where to reach them
pub struct Contender {
    pub entrant: Entrant,
    pub transport: Option<Transport>,
}

/// Creates rooms and starts their actors
#[derive(Clone)]
pub struct RoomSpawner {
    ctx: RoomContext,
}

impl RoomSpawner {
    pub fn new(ctx: RoomContext) -> Self {
        Self { ctx }
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.ctx.registry
    }

    pub fn config(&self) -> &GameConfig {
        &self.ctx.config
    }

    /// Register a room for two contenders and spawn its actor task
    pub fn spawn(&self, contenders: [Contender; 2], wager: u64) -> RoomHandle {
        let (actor, handle) = RoomActor::new(self.ctx.clone(), contenders, wager, rand::random());
        self.ctx.registry.insert(handle.clone());
        tokio::spawn(actor.run());
        handle
    }
}

/// The authoritative owner of one battle room
pub struct RoomActor {
    room: BattleRoom,
    commands: mpsc::Receiver<RoomCommand>,
    /// Participant transports by seat; None for bots and while disconnected
    links: [Option<Transport>; 2],
    spectators: Spectators,
    ctx: RoomContext,
    log_cursor: usize,
    ticks_since_snapshot: u32,
}

impl RoomActor {
    pub fn new(
        ctx: RoomContext,
        contenders: [Contender; 2],
        wager: u64,
        seed: u64,
    ) -> (Self, RoomHandle) {
        let id = Uuid::new_v4();
        let (command_tx, commands) = mpsc::channel(COMMAND_BUFFER);

        let [first, second] = contenders;
        let participants = [first.entrant.session_id, second.entrant.session_id];
        let links = [first.transport, second.transport];
        let room = BattleRoom::new(id, seed, wager, [first.entrant, second.entrant], &ctx.config);

        let handle = RoomHandle {
            id,
            participants,
            wager,
            created_at: unix_millis(),
            command_tx,
        };

        let actor = Self {
            room,
            commands,
            links,
            spectators: Spectators::new(),
            ctx,
            log_cursor: 0,
            ticks_since_snapshot: 0,
        };

        (actor, handle)
    }

    /// Run the room until it resolves and its result is delivered
    pub async fn run(mut self) {
        let room_id = self.room.id();
        info!(room_id = %room_id, "Room created");

        self.announce();

        let mut tick_interval = interval(tick_duration());
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tick_interval.tick().await;

            self.drain_commands();
            if !self.room.is_resolved() {
                self.run_bots();
                self.room.advance();
            }
            self.flush();

            if self.room.is_resolved() {
                break;
            }
        }

        self.finish().await;
    }

    /// Tell each human its pairing and the countdown
    fn announce(&mut self) {
        let snapshot = self.snapshot();
        let countdown_secs = self.ctx.config.countdown.as_secs() as u32;

        for seat in Seat::BOTH {
            let Some(link) = &self.links[seat.index()] else {
                continue;
            };
            let opponent = self.room.participant(seat.opponent());
            link.send(ServerMsg::MatchFound {
                room_id: self.room.id(),
                opponent: OpponentSummary {
                    session_id: opponent.session_id,
                    wallet: opponent.wallet.clone(),
                    fighter: opponent.fighter.clone(),
                    is_bot: opponent.is_bot(),
                },
                snapshot: snapshot.clone(),
                is_first_participant: seat == Seat::First,
            });
            link.send(ServerMsg::MatchCountdown {
                seconds_remaining: countdown_secs,
            });
        }
        self.log_cursor = self.room.log_len();
    }

    /// Apply queued commands in arrival order
    fn drain_commands(&mut self) {
        loop {
            match self.commands.try_recv() {
                Ok(command) => self.handle_command(command),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.room.void("command channel closed");
                    break;
                }
            }
        }
    }

    fn handle_command(&mut self, command: RoomCommand) {
        match command {
            RoomCommand::Action {
                session_id,
                request,
            } => {
                if let Err(reason) = self.room.submit_action(session_id, &request) {
                    debug!(
                        room_id = %self.room.id(),
                        session_id = %session_id,
                        kind = ?reason.kind(),
                        client_timestamp = ?request.client_timestamp,
                        reason = %reason,
                        "Action rejected"
                    );
                    self.send_to(session_id, ServerMsg::Rejected { reason });
                }
            }
            RoomCommand::Disconnect { session_id } => {
                if self.room.handle_disconnect(session_id) {
                    if let Some(seat) = self.room.seat_of(session_id) {
                        self.links[seat.index()] = None;
                    }
                    info!(room_id = %self.room.id(), session_id = %session_id, "Participant disconnected, grace period started");
                }
            }
            RoomCommand::Reconnect {
                session_id,
                transport,
                reply,
            } => {
                let outcome = self.room.handle_reconnect(session_id).map(|()| {
                    let snapshot = self.snapshot();
                    // resume notice goes out ahead of any snapshot on the new link
                    transport.send(ServerMsg::MatchResumed {
                        room_id: self.room.id(),
                        snapshot: snapshot.clone(),
                    });
                    if let Some(seat) = self.room.seat_of(session_id) {
                        self.links[seat.index()] = Some(transport);
                    }
                    snapshot
                });
                if outcome.is_ok() {
                    info!(room_id = %self.room.id(), session_id = %session_id, "Participant reconnected");
                }
                let _ = reply.send(outcome);
            }
            RoomCommand::Spectate {
                spectator,
                transport,
                reply,
            } => {
                let outcome = if self.room.seat_of(spectator).is_some() {
                    Err(SpectateError::ParticipantCannotSpectate)
                } else if self.room.is_resolved() {
                    Err(SpectateError::RoomResolved)
                } else {
                    let link = transport.clone();
                    self.spectators.subscribe(spectator, transport);
                    let snapshot = self.snapshot();
                    // join snapshot goes out ahead of anything this tick flushes
                    link.send(ServerMsg::RoomSnapshot {
                        snapshot: snapshot.clone(),
                    });
                    Ok(snapshot)
                };
                let _ = reply.send(outcome);
            }
            RoomCommand::StopSpectating { spectator } => {
                self.spectators.unsubscribe(spectator);
            }
        }
    }

    /// Bot decisions go through the same validation as human actions
    fn run_bots(&mut self) {
        for seat in Seat::BOTH {
            let participant = self.room.participant(seat);
            if participant.kind != ParticipantKind::Bot {
                continue;
            }
            let session_id = participant.session_id;
            let Some(request) =
                bot::next_action(self.room.arena(), seat, self.room.clock_ms(), self.room.rules())
            else {
                continue;
            };
            if let Err(reason) = self.room.submit_action(session_id, &request) {
                debug!(room_id = %self.room.id(), reason = %reason, "Bot action rejected");
            }
        }
    }

    /// Translate new log entries into messages and push snapshots
    fn flush(&mut self) {
        let events: Vec<RoomEvent> = self.room.events_since(self.log_cursor).to_vec();
        self.log_cursor = self.room.log_len();

        for (audience, msg) in outbound_messages(&events) {
            self.deliver(audience, msg);
        }

        self.ticks_since_snapshot += 1;
        let changed = events.iter().any(RoomEvent::changes_state);
        let periodic = self.ticks_since_snapshot >= SNAPSHOT_EVERY_TICKS
            && self.room.phase().kind() != PhaseKind::Resolved;
        if changed || periodic {
            self.ticks_since_snapshot = 0;
            let msg = ServerMsg::RoomSnapshot {
                snapshot: self.snapshot(),
            };
            self.deliver(Audience::Everyone, msg);
        }
    }

    fn deliver(&mut self, audience: Audience, msg: ServerMsg) {
        match audience {
            Audience::Participants => self.send_participants(&msg),
            Audience::Participant(session_id) => self.send_to(session_id, msg),
            Audience::OpponentOf(session_id) => {
                if let Some(seat) = self.room.seat_of(session_id) {
                    let opponent = self.room.participant(seat.opponent()).session_id;
                    self.send_to(opponent, msg);
                }
            }
            Audience::Everyone => {
                self.send_participants(&msg);
                self.spectators.publish(&msg);
            }
        }
    }

    fn send_participants(&self, msg: &ServerMsg) {
        for link in self.links.iter().flatten() {
            link.send(msg.clone());
        }
    }

    fn send_to(&self, session_id: Uuid, msg: ServerMsg) {
        if let Some(link) = self
            .room
            .seat_of(session_id)
            .and_then(|seat| self.links[seat.index()].as_ref())
        {
            link.send(msg);
        }
    }

    fn snapshot(&self) -> RoomSnapshot {
        self.room.snapshot(self.spectators.len())
    }

    /// Release everything the room holds, then hand the result to collaborators
    async fn finish(mut self) {
        let room_id = self.room.id();
        self.commands.close();

        self.ctx.registry.release_members(&room_id);
        for spectator in self.spectators.drain() {
            self.ctx
                .spectator_index
                .remove_if_watching(&spectator, &room_id);
        }

        match self.room.result().cloned() {
            Some(result) => {
                info!(
                    room_id = %room_id,
                    reason = ?result.reason,
                    winner = ?result.winner,
                    duration_ms = result.duration_ms,
                    "Room resolved"
                );
                self.ctx.settlement.deliver(&result).await;
            }
            None => warn!(room_id = %room_id, "Room finished without a result"),
        }

        self.ctx.registry.remove(&room_id);
        info!(room_id = %room_id, "Room removed from registry");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::rules::CombatRules;
    use crate::game::settlement::testing::{settlement, FakeEscrow, FakeRecorder};
    use crate::ws::protocol::{ActionKind, Fighter, ResultReason};
    use std::time::Duration;

    struct Harness {
        ctx: RoomContext,
        recorder: Arc<FakeRecorder>,
        escrow: Arc<FakeEscrow>,
    }

    fn harness() -> Harness {
        let (settlement, recorder, escrow) = settlement();
        let config = GameConfig {
            countdown: Duration::from_secs(3),
            match_duration: Duration::from_secs(60),
            reconnect_grace: Duration::from_secs(10),
            combat: CombatRules::certain_hits(),
            ..GameConfig::default()
        };
        Harness {
            ctx: RoomContext {
                config: Arc::new(config),
                registry: Arc::new(RoomRegistry::new()),
                spectator_index: Arc::new(SpectatorIndex::new()),
                settlement,
            },
            recorder,
            escrow,
        }
    }

    fn fighter() -> Fighter {
        Fighter {
            name: "Rex".to_string(),
            max_health: 100,
        }
    }

    fn human(id: Uuid) -> (Contender, mpsc::Receiver<ServerMsg>) {
        let (transport, rx) = Transport::channel();
        let contender = Contender {
            entrant: Entrant::human(id, format!("wallet-{id}"), fighter()),
            transport: Some(transport),
        };
        (contender, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<ServerMsg>) -> Vec<ServerMsg> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    async fn wait_for_removal(registry: &RoomRegistry, room_id: Uuid) {
        for _ in 0..1_000 {
            if registry.get(&room_id).is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("room {room_id} never left the registry");
    }

    #[tokio::test(start_paused = true)]
    async fn pairing_countdown_hit_and_spectator_snapshot() {
        let h = harness();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let (first, mut a_rx) = human(a);
        let (second, mut b_rx) = human(b);
        let handle = RoomSpawner::new(h.ctx.clone()).spawn([first, second], 100);

        tokio::time::sleep(Duration::from_millis(10)).await;
        let a_msgs = drain(&mut a_rx);
        assert!(matches!(
            &a_msgs[0],
            ServerMsg::MatchFound { is_first_participant: true, opponent, .. } if opponent.session_id == b
        ));
        assert!(matches!(a_msgs[1], ServerMsg::MatchCountdown { seconds_remaining: 3 }));

        // actions during countdown are rejected
        handle
            .send(RoomCommand::Action {
                session_id: a,
                request: ActionRequest {
                    kind: ActionKind::Attack,
                    target: None,
                    client_timestamp: None,
                },
            })
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(drain(&mut a_rx).iter().any(|m| matches!(
            m,
            ServerMsg::Rejected { reason: Rejection::RoomNotActive }
        )));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(drain(&mut b_rx)
            .iter()
            .any(|m| matches!(m, ServerMsg::MatchStarted { .. })));

        handle
            .send(RoomCommand::Action {
                session_id: a,
                request: ActionRequest {
                    kind: ActionKind::Attack,
                    target: None,
                    client_timestamp: None,
                },
            })
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let b_msgs = drain(&mut b_rx);
        assert!(b_msgs.iter().any(|m| matches!(
            m,
            ServerMsg::ActionResult { event, battle_over: false, .. }
                if event.hit && event.target_health == Some(85)
        )));

        // late spectator gets the latest state in full
        let (spectator_transport, mut spectator_rx) = Transport::channel();
        let (reply, response) = oneshot::channel();
        handle
            .send(RoomCommand::Spectate {
                spectator: Uuid::new_v4(),
                transport: spectator_transport,
                reply,
            })
            .await;
        let snapshot = response.await.unwrap().unwrap();
        assert_eq!(snapshot.phase, PhaseKind::Active);
        assert_eq!(snapshot.spectators, 1);
        let b_state = snapshot.participants.iter().find(|p| p.session_id == b).unwrap();
        assert_eq!(b_state.health, 85);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(drain(&mut spectator_rx)
            .iter()
            .any(|m| matches!(m, ServerMsg::RoomSnapshot { .. })));

        // a participant cannot spectate its own room
        let (t, _rx) = Transport::channel();
        let (reply, response) = oneshot::channel();
        handle
            .send(RoomCommand::Spectate {
                spectator: a,
                transport: t,
                reply,
            })
            .await;
        assert_eq!(
            response.await.unwrap().unwrap_err(),
            SpectateError::ParticipantCannotSpectate
        );
    }

    fn snapshot_ticks(rx: &mut mpsc::Receiver<ServerMsg>) -> Vec<u64> {
        drain(rx)
            .into_iter()
            .filter_map(|m| match m {
                ServerMsg::RoomSnapshot { snapshot } => Some(snapshot.tick),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn late_spectators_never_see_snapshot_ticks_go_backwards() {
        let h = harness();
        let (first, _a_rx) = human(Uuid::new_v4());
        let (second, _b_rx) = human(Uuid::new_v4());
        let handle = RoomSpawner::new(h.ctx.clone()).spawn([first, second], 100);

        let mut watchers = Vec::new();
        for i in 0..10u64 {
            tokio::time::sleep(Duration::from_millis(170 + i * 30)).await;
            let (transport, rx) = Transport::channel();
            let (reply, response) = oneshot::channel();
            handle
                .send(RoomCommand::Spectate {
                    spectator: Uuid::new_v4(),
                    transport,
                    reply,
                })
                .await;
            let joined = response.await.unwrap().unwrap();
            watchers.push((joined.tick, rx));
        }

        tokio::time::sleep(Duration::from_millis(600)).await;
        for (joined_tick, mut rx) in watchers {
            let ticks = snapshot_ticks(&mut rx);
            assert_eq!(ticks.first(), Some(&joined_tick));
            assert!(ticks.len() > 1);
            assert!(
                ticks.windows(2).all(|w| w[0] <= w[1]),
                "snapshot ticks went backwards: {ticks:?}"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn queued_actions_apply_in_arrival_order_within_a_tick() {
        let h = harness();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let low = Fighter {
            name: "Glass".to_string(),
            max_health: 15,
        };
        let (a_transport, mut a_rx) = Transport::channel();
        let (b_transport, mut b_rx) = Transport::channel();
        let contenders = [
            Contender {
                entrant: Entrant::human(a, "wallet-a", low.clone()),
                transport: Some(a_transport),
            },
            Contender {
                entrant: Entrant::human(b, "wallet-b", low),
                transport: Some(b_transport),
            },
        ];
        let (actor, handle) = RoomActor::new(h.ctx.clone(), contenders, 100, 7);
        h.ctx.registry.insert(handle.clone());

        // both strikes are queued before the actor runs a single active tick
        let attack = || ActionRequest {
            kind: ActionKind::Attack,
            target: None,
            client_timestamp: None,
        };
        tokio::spawn(actor.run());
        tokio::time::sleep(Duration::from_millis(3_110)).await;
        drain(&mut a_rx);
        drain(&mut b_rx);
        handle
            .send(RoomCommand::Action {
                session_id: b,
                request: attack(),
            })
            .await;
        handle
            .send(RoomCommand::Action {
                session_id: a,
                request: attack(),
            })
            .await;

        wait_for_removal(&h.ctx.registry, handle.id).await;

        let results = h.recorder.results.lock().clone();
        assert_eq!(results[0].reason, ResultReason::Elimination);
        assert_eq!(results[0].winner, Some(b));
        assert!(drain(&mut a_rx).iter().any(|m| matches!(
            m,
            ServerMsg::Rejected { reason: Rejection::Eliminated | Rejection::RoomNotActive }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_without_return_forfeits_after_grace() {
        let h = harness();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let (first, _a_rx) = human(a);
        let (second, mut b_rx) = human(b);
        let handle = RoomSpawner::new(h.ctx.clone()).spawn([first, second], 100);
        let room_id = handle.id;

        // countdown plus 5s of active play
        tokio::time::sleep(Duration::from_millis(8_000)).await;
        handle.send(RoomCommand::Disconnect { session_id: a }).await;

        tokio::time::sleep(Duration::from_millis(9_000)).await;
        assert!(h.recorder.results.lock().is_empty());
        let b_msgs = drain(&mut b_rx);
        assert!(b_msgs
            .iter()
            .any(|m| matches!(m, ServerMsg::OpponentConnectionLost { grace_remaining_ms: 10_000 })));

        wait_for_removal(&h.ctx.registry, room_id).await;

        let results = h.recorder.results.lock().clone();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].reason, ResultReason::Disconnect);
        assert_eq!(results[0].winner, Some(b));
        assert_eq!(h.escrow.settled.lock().as_slice(), &[room_id]);

        let b_msgs = drain(&mut b_rx);
        assert!(b_msgs.iter().any(|m| matches!(m, ServerMsg::OpponentDisconnected)));
        assert!(b_msgs.iter().any(|m| matches!(m, ServerMsg::MatchEnded { .. })));
        assert!(h.ctx.registry.room_of(&a).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_inside_grace_resumes_room() {
        let h = harness();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let (first, _a_rx) = human(a);
        let (second, _b_rx) = human(b);
        let handle = RoomSpawner::new(h.ctx.clone()).spawn([first, second], 100);

        tokio::time::sleep(Duration::from_millis(4_000)).await;
        handle.send(RoomCommand::Disconnect { session_id: a }).await;
        tokio::time::sleep(Duration::from_millis(3_000)).await;

        let (transport, mut new_rx) = Transport::channel();
        let (reply, response) = oneshot::channel();
        handle
            .send(RoomCommand::Reconnect {
                session_id: a,
                transport,
                reply,
            })
            .await;
        let snapshot = response.await.unwrap().unwrap();
        let mine = snapshot.participants.iter().find(|p| p.session_id == a).unwrap();
        assert!(mine.connected);
        assert_eq!(mine.health, 100);

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(h.ctx.registry.get(&handle.id).is_some());
        assert!(drain(&mut new_rx)
            .iter()
            .any(|m| matches!(m, ServerMsg::RoomSnapshot { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn tutorial_bot_fights_and_room_resolves_without_escrow() {
        let h = harness();
        let a = Uuid::new_v4();
        let (first, mut a_rx) = human(a);
        let bot = Contender {
            entrant: Entrant::bot(&fighter()),
            transport: None,
        };
        let handle = RoomSpawner::new(h.ctx.clone()).spawn([first, bot], 0);

        wait_for_removal(&h.ctx.registry, handle.id).await;

        let results = h.recorder.results.lock().clone();
        assert_eq!(results.len(), 1);
        let result = &results[0];
        // the bot never misses in this rule set and the human never acts
        assert_eq!(result.reason, ResultReason::Elimination);
        assert_eq!(result.loser, Some(a));
        assert!(h.escrow.settled.lock().is_empty());
        assert!(drain(&mut a_rx)
            .iter()
            .any(|m| matches!(m, ServerMsg::MatchEnded { .. })));
    }
}
