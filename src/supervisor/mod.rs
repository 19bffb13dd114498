//! Connection lifecycle: routes transport loss and re-establishment to the
//! queue, the spectator hub and the owning room.

use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::game::{RoomCommand, RoomRegistry, SpectatorHub};
use crate::matchmaking::MatchmakingService;
use crate::ws::session::{Session, SessionRegistry};

/// What happened when a connection came up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Established {
    /// No live room for this session
    Fresh,
    /// The session was put back into its room
    Resumed { room_id: Uuid },
    /// The room refused the reconnect (grace expired or already resolved)
    ResumeRefused { room_id: Uuid },
}

pub struct Supervisor {
    sessions: Arc<SessionRegistry>,
    matchmaking: Arc<MatchmakingService>,
    rooms: Arc<RoomRegistry>,
    spectators: Arc<SpectatorHub>,
}

impl Supervisor {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        matchmaking: Arc<MatchmakingService>,
        rooms: Arc<RoomRegistry>,
        spectators: Arc<SpectatorHub>,
    ) -> Self {
        Self {
            sessions,
            matchmaking,
            rooms,
            spectators,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// A connection for `session` is up. A newer connection supersedes any older one.
    pub async fn on_transport_established(&self, session: &Session) -> Established {
        if let Some(previous) = self.sessions.attach(session.clone()) {
            info!(
                session_id = %session.id,
                old_connection = %previous.transport.connection_id(),
                new_connection = %session.transport.connection_id(),
                "Connection superseded"
            );
        }

        if self
            .matchmaking
            .update_transport(session.id, session.transport.clone())
            .await
        {
            debug!(session_id = %session.id, "Queued entry moved to new connection");
        }
        // subscriptions were bound to the old connection
        self.spectators.unsubscribe(session.id).await;

        let Some(handle) = self.rooms.handle_for_session(&session.id) else {
            return Established::Fresh;
        };
        let room_id = handle.id;

        let (reply, response) = oneshot::channel();
        let sent = handle
            .send(RoomCommand::Reconnect {
                session_id: session.id,
                transport: session.transport.clone(),
                reply,
            })
            .await;
        if !sent {
            return Established::ResumeRefused { room_id };
        }

        match response.await {
            Ok(Ok(_snapshot)) => {
                info!(session_id = %session.id, room_id = %room_id, "Session resumed its room");
                Established::Resumed { room_id }
            }
            Ok(Err(reason)) => {
                warn!(session_id = %session.id, room_id = %room_id, reason = %reason, "Reconnect refused");
                Established::ResumeRefused { room_id }
            }
            Err(_) => Established::ResumeRefused { room_id },
        }
    }

    /// A connection went away. Ignored when a newer connection owns the session.
    pub async fn on_transport_lost(&self, session_id: Uuid, connection_id: Uuid) -> bool {
        if !self.sessions.detach(session_id, connection_id) {
            debug!(session_id = %session_id, connection_id = %connection_id, "Ignoring loss of superseded connection");
            return false;
        }

        self.matchmaking.leave(session_id).await;
        self.spectators.unsubscribe(session_id).await;

        if let Some(handle) = self.rooms.handle_for_session(&session_id) {
            handle.send(RoomCommand::Disconnect { session_id }).await;
        }

        info!(session_id = %session_id, "Connection lost");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GameConfig;
    use crate::game::settlement::testing::settlement;
    use crate::game::spectators::SpectatorIndex;
    use crate::game::{RoomContext, RoomSpawner};
    use crate::ws::protocol::{Fighter, QueueClass, ServerMsg};
    use crate::ws::session::Transport;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Harness {
        supervisor: Supervisor,
        matchmaking: Arc<MatchmakingService>,
        rooms: Arc<RoomRegistry>,
    }

    fn harness() -> Harness {
        let (settlement, _, _) = settlement();
        let rooms = Arc::new(RoomRegistry::new());
        let index = Arc::new(SpectatorIndex::new());
        let ctx = RoomContext {
            config: Arc::new(GameConfig::default()),
            registry: rooms.clone(),
            spectator_index: index.clone(),
            settlement,
        };
        let matchmaking = Arc::new(MatchmakingService::new(RoomSpawner::new(ctx)));
        let hub = Arc::new(SpectatorHub::new(rooms.clone(), index));
        let supervisor = Supervisor::new(
            Arc::new(SessionRegistry::new()),
            matchmaking.clone(),
            rooms.clone(),
            hub,
        );
        Harness {
            supervisor,
            matchmaking,
            rooms,
        }
    }

    fn connect(id: Uuid) -> (Session, mpsc::Receiver<ServerMsg>) {
        let (transport, rx) = Transport::channel();
        (Session::new(id, "wallet", transport), rx)
    }

    fn fighter() -> Fighter {
        Fighter {
            name: "Rex".to_string(),
            max_health: 100,
        }
    }

    fn drain(rx: &mut mpsc::Receiver<ServerMsg>) -> Vec<ServerMsg> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[tokio::test]
    async fn loss_removes_queued_entry() {
        let h = harness();
        let (a, _rx) = connect(Uuid::new_v4());
        h.supervisor.on_transport_established(&a).await;
        h.matchmaking
            .join(&a, fighter(), 100, QueueClass::Tier(1))
            .await
            .unwrap();

        assert!(h.supervisor.on_transport_lost(a.id, a.transport.connection_id()).await);
        assert!(!h.matchmaking.is_in_queue(&a.id).await);
        assert_eq!(h.supervisor.sessions().connected(), 0);
    }

    #[tokio::test]
    async fn superseded_connection_loss_is_ignored() {
        let h = harness();
        let id = Uuid::new_v4();
        let (old, _old_rx) = connect(id);
        let (new, _new_rx) = connect(id);

        h.supervisor.on_transport_established(&old).await;
        h.matchmaking
            .join(&old, fighter(), 100, QueueClass::Tier(1))
            .await
            .unwrap();
        h.supervisor.on_transport_established(&new).await;

        assert!(!h.supervisor.on_transport_lost(id, old.transport.connection_id()).await);
        assert!(h.matchmaking.is_in_queue(&id).await);
        assert_eq!(h.supervisor.sessions().connected(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_within_grace_resumes_room() {
        let h = harness();
        let (a_id, b_id) = (Uuid::new_v4(), Uuid::new_v4());
        let (a, _a_rx) = connect(a_id);
        let (b, mut b_rx) = connect(b_id);
        for s in [&a, &b] {
            h.supervisor.on_transport_established(s).await;
            h.matchmaking
                .join(s, fighter(), 100, QueueClass::Tier(1))
                .await
                .unwrap();
        }
        let room_id = h.rooms.room_of(&a_id).unwrap();

        tokio::time::sleep(Duration::from_secs(4)).await;
        h.supervisor
            .on_transport_lost(a_id, a.transport.connection_id())
            .await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(drain(&mut b_rx)
            .iter()
            .any(|m| matches!(m, ServerMsg::OpponentConnectionLost { .. })));

        let (a2, mut a2_rx) = connect(a_id);
        let outcome = h.supervisor.on_transport_established(&a2).await;
        assert_eq!(outcome, Established::Resumed { room_id });
        match a2_rx.recv().await {
            Some(ServerMsg::MatchResumed { room_id: resumed, snapshot }) => {
                assert_eq!(resumed, room_id);
                assert!(snapshot.participants.iter().all(|p| p.connected));
            }
            other => panic!("expected MatchResumed, got {other:?}"),
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(drain(&mut b_rx)
            .iter()
            .any(|m| matches!(m, ServerMsg::OpponentReconnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_after_grace_is_refused() {
        let h = harness();
        let (a_id, b_id) = (Uuid::new_v4(), Uuid::new_v4());
        let (a, _a_rx) = connect(a_id);
        let (b, _b_rx) = connect(b_id);
        for s in [&a, &b] {
            h.supervisor.on_transport_established(s).await;
            h.matchmaking
                .join(s, fighter(), 100, QueueClass::Tier(1))
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_secs(4)).await;
        h.supervisor
            .on_transport_lost(a_id, a.transport.connection_id())
            .await;
        tokio::time::sleep(Duration::from_secs(11)).await;

        let (a2, _a2_rx) = connect(a_id);
        assert_eq!(
            h.supervisor.on_transport_established(&a2).await,
            Established::Fresh
        );
        assert!(h.rooms.room_of(&a_id).is_none());
    }
}
