//! WebSocket upgrade handler

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use std::fmt::Display;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::game::{ActionRequest, RoomCommand};
use crate::http::middleware::{verify_jwt, JwtClaims};
use crate::util::rate_limit::SessionRateLimiter;
use crate::util::time::unix_millis;
use crate::ws::protocol::{ClientMsg, Rejection, ServerMsg};
use crate::ws::session::{Session, Transport};

/// A connection silent for this long is treated as lost
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Server pings keep quiet browsers answering well inside the idle timeout
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

/// Query parameters for WebSocket connection
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// JWT token for authentication
    pub token: String,
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    // Verify JWT token before upgrading
    match verify_jwt(&query.token, &state.config.supabase_jwt_secret) {
        Ok(claims) => {
            info!(session_id = %claims.sub, "WebSocket upgrade for authenticated session");
            ws.on_upgrade(move |socket| handle_socket(socket, claims, state))
        }
        Err(e) => {
            warn!(error = %e, "WebSocket auth failed");
            (StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
        }
    }
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(socket: WebSocket, claims: JwtClaims, state: AppState) {
    let session_id = claims.sub;
    let (ws_sink, ws_stream) = socket.split();

    let (transport, outbound_rx) = Transport::channel();
    let connection_id = transport.connection_id();
    let session = Session::new(session_id, claims.wallet(), transport);
    info!(session_id = %session_id, connection_id = %connection_id, "New WebSocket connection");

    let display_name = display_name(&claims);
    session.send(ServerMsg::Welcome {
        session_id,
        display_name,
        server_time: unix_millis(),
    });

    // Spawn writer task: outbound channel -> WebSocket
    let writer_handle = tokio::spawn(write_loop(ws_sink, outbound_rx, session_id));

    state.supervisor.on_transport_established(&session).await;

    read_loop(ws_stream, &state, &session).await;

    state
        .supervisor
        .on_transport_lost(session_id, connection_id)
        .await;
    writer_handle.abort();

    info!(session_id = %session_id, connection_id = %connection_id, "WebSocket connection closed");
}

/// Forward outbound messages and heartbeat pings until the socket fails
async fn write_loop<S>(mut sink: S, mut outbound_rx: mpsc::Receiver<ServerMsg>, session_id: Uuid)
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;

    loop {
        let sent = tokio::select! {
            msg = outbound_rx.recv() => match msg {
                Some(msg) => send_msg(&mut sink, &msg).await,
                None => break,
            },
            _ = heartbeat.tick() => sink
                .send(Message::Ping(Vec::new()))
                .await
                .map_err(|e| e.to_string()),
        };
        if let Err(e) = sent {
            debug!(session_id = %session_id, error = %e, "WebSocket send failed");
            break;
        }
    }
}

/// Read client frames until close, error or idle timeout
async fn read_loop<S, E>(mut stream: S, state: &AppState, session: &Session)
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let session_id = session.id;
    let rate_limiter = SessionRateLimiter::new();

    loop {
        // any frame, pongs included, counts as activity
        let next = match tokio::time::timeout(IDLE_TIMEOUT, stream.next()).await {
            Ok(Some(next)) => next,
            Ok(None) => break,
            Err(_) => {
                info!(session_id = %session_id, "Connection idle, closing");
                break;
            }
        };

        match next {
            Ok(Message::Text(text)) => {
                if !rate_limiter.check_input() {
                    warn!(session_id = %session_id, "Rate limited input message");
                    session.send(ServerMsg::Rejected {
                        reason: Rejection::RateLimited,
                    });
                    continue;
                }

                match serde_json::from_str::<ClientMsg>(&text) {
                    Ok(msg) => dispatch(state, session, &rate_limiter, msg).await,
                    Err(e) => {
                        warn!(session_id = %session_id, error = %e, "Failed to parse client message");
                        session.send(ServerMsg::Error {
                            code: "bad_message".to_string(),
                            message: e.to_string(),
                        });
                    }
                }
            }
            Ok(Message::Binary(_)) => {
                warn!(session_id = %session_id, "Received binary message, ignoring");
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                info!(session_id = %session_id, "Client initiated close");
                break;
            }
            Err(e) => {
                error!(session_id = %session_id, error = %e, "WebSocket error");
                break;
            }
        }
    }
}

/// Name shown to the player, taken from the token claims
fn display_name(claims: &JwtClaims) -> String {
    claims
        .user_metadata
        .display_name
        .clone()
        .unwrap_or_else(|| format!("Player_{}", &claims.sub.simple().to_string()[..8]))
}

/// Route one client message
pub(crate) async fn dispatch(
    state: &AppState,
    session: &Session,
    rate_limiter: &SessionRateLimiter,
    msg: ClientMsg,
) {
    match msg {
        ClientMsg::JoinQueue {
            fighter,
            wager_amount,
            queue_class,
        } => {
            if !rate_limiter.check_join() {
                session.send(ServerMsg::Rejected {
                    reason: Rejection::RateLimited,
                });
                return;
            }
            if let Err(e) = state
                .matchmaking
                .join(session, fighter, wager_amount, queue_class)
                .await
            {
                debug!(session_id = %session.id, error = %e, "Queue join refused");
                session.send(ServerMsg::Error {
                    code: e.code().to_string(),
                    message: e.to_string(),
                });
            }
        }

        ClientMsg::LeaveQueue => {
            state.matchmaking.leave(session.id).await;
            session.send(ServerMsg::QueueLeft);
        }

        ClientMsg::SubmitAction {
            action,
            target,
            client_timestamp,
        } => {
            if state.spectators.is_spectating(&session.id) {
                session.send(ServerMsg::Rejected {
                    reason: Rejection::SpectatorReadOnly,
                });
                return;
            }
            let Some(handle) = state.rooms.handle_for_session(&session.id) else {
                session.send(ServerMsg::Rejected {
                    reason: Rejection::NotInRoom,
                });
                return;
            };
            let command = RoomCommand::Action {
                session_id: session.id,
                request: ActionRequest {
                    kind: action,
                    target,
                    client_timestamp,
                },
            };
            if !handle.send(command).await {
                session.send(ServerMsg::Rejected {
                    reason: Rejection::RoomNotActive,
                });
            }
        }

        ClientMsg::SpectateMatch { room_id } => {
            // on success the room itself pushed the join snapshot
            if let Err(e) = state.spectators.subscribe(session, room_id).await {
                session.send(ServerMsg::Error {
                    code: e.code().to_string(),
                    message: e.to_string(),
                });
            }
        }

        ClientMsg::StopSpectating => {
            state.spectators.unsubscribe(session.id).await;
        }

        ClientMsg::Ping { t } => {
            session.send(ServerMsg::Pong { t });
        }
    }
}

/// Send a message over WebSocket
async fn send_msg<S>(sink: &mut S, msg: &ServerMsg) -> Result<(), String>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let json = serde_json::to_string(msg).map_err(|e| e.to_string())?;
    sink.send(Message::Text(json))
        .await
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::ws::protocol::{ActionKind, Fighter, QueueClass};
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn state() -> AppState {
        AppState::new(Config::for_tests())
    }

    fn new_session(state: &AppState) -> (Session, mpsc::Receiver<ServerMsg>) {
        let (transport, rx) = Transport::channel();
        let session = Session::new(Uuid::new_v4(), "wallet", transport);
        state.sessions.attach(session.clone());
        (session, rx)
    }

    fn fighter() -> Fighter {
        Fighter {
            name: "Rex".to_string(),
            max_health: 100,
        }
    }

    fn attack() -> ClientMsg {
        ClientMsg::SubmitAction {
            action: ActionKind::Attack,
            target: None,
            client_timestamp: Some(1),
        }
    }

    #[tokio::test]
    async fn ping_and_orphan_action() {
        let state = state();
        let limiter = SessionRateLimiter::new();
        let (session, mut rx) = new_session(&state);

        dispatch(&state, &session, &limiter, ClientMsg::Ping { t: 42 }).await;
        assert!(matches!(rx.recv().await, Some(ServerMsg::Pong { t: 42 })));

        dispatch(&state, &session, &limiter, attack()).await;
        assert!(matches!(
            rx.recv().await,
            Some(ServerMsg::Rejected { reason: Rejection::NotInRoom })
        ));

        dispatch(&state, &session, &limiter, ClientMsg::LeaveQueue).await;
        assert!(matches!(rx.recv().await, Some(ServerMsg::QueueLeft)));
    }

    #[tokio::test]
    async fn invalid_join_reports_error_code() {
        let state = state();
        let limiter = SessionRateLimiter::new();
        let (session, mut rx) = new_session(&state);

        let join = ClientMsg::JoinQueue {
            fighter: fighter(),
            wager_amount: 0,
            queue_class: QueueClass::Tier(1),
        };
        dispatch(&state, &session, &limiter, join).await;
        match rx.recv().await {
            Some(ServerMsg::Error { code, .. }) => assert_eq!(code, "invalid_wager"),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn spectator_is_read_only() {
        let state = state();
        let limiter = SessionRateLimiter::new();
        let (a, _a_rx) = new_session(&state);
        let (b, _b_rx) = new_session(&state);
        let (watcher, mut watcher_rx) = new_session(&state);

        for s in [&a, &b] {
            let join = ClientMsg::JoinQueue {
                fighter: fighter(),
                wager_amount: 100,
                queue_class: QueueClass::Tier(1),
            };
            dispatch(&state, s, &limiter, join).await;
        }
        let room_id = state.rooms.room_of(&a.id).unwrap();

        dispatch(&state, &watcher, &limiter, ClientMsg::SpectateMatch { room_id }).await;
        match watcher_rx.recv().await {
            Some(ServerMsg::RoomSnapshot { snapshot }) => assert_eq!(snapshot.room_id, room_id),
            other => panic!("expected snapshot, got {other:?}"),
        }

        dispatch(&state, &watcher, &limiter, attack()).await;
        let rejected = loop {
            match watcher_rx.recv().await {
                Some(ServerMsg::Rejected { reason }) => break reason,
                Some(_) => continue,
                None => panic!("channel closed"),
            }
        };
        assert_eq!(rejected, Rejection::SpectatorReadOnly);

        // participants cannot spectate their own room
        dispatch(&state, &a, &limiter, ClientMsg::SpectateMatch { room_id }).await;
        assert!(!state.spectators.is_spectating(&a.id));
    }

    fn tier_join() -> ClientMsg {
        ClientMsg::JoinQueue {
            fighter: fighter(),
            wager_amount: 100,
            queue_class: QueueClass::Tier(1),
        }
    }

    type Frames = futures::channel::mpsc::UnboundedSender<Result<Message, axum::Error>>;

    fn spawn_reader(state: &AppState, session: &Session) -> (Frames, tokio::task::JoinHandle<()>) {
        let (client, frames) = futures::channel::mpsc::unbounded();
        let (state, session) = (state.clone(), session.clone());
        let reader = tokio::spawn(async move { read_loop(frames, &state, &session).await });
        (client, reader)
    }

    #[test]
    fn display_name_comes_from_claims() {
        let sub = Uuid::new_v4();
        let mut claims = JwtClaims {
            sub,
            exp: 0,
            iat: 0,
            role: None,
            wallet: None,
            user_metadata: Default::default(),
        };
        assert_eq!(display_name(&claims), format!("Player_{}", &sub.simple().to_string()[..8]));

        claims.user_metadata.display_name = Some("Nova".to_string());
        assert_eq!(display_name(&claims), "Nova");
    }

    #[tokio::test(start_paused = true)]
    async fn writer_pings_while_outbound_is_quiet() {
        let (sink, mut frames) = futures::channel::mpsc::unbounded::<Message>();
        let (outbound, rx) = mpsc::channel::<ServerMsg>(8);
        let writer = tokio::spawn(write_loop(sink, rx, Uuid::new_v4()));

        tokio::time::sleep(Duration::from_secs(45)).await;
        outbound.send(ServerMsg::QueueLeft).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut pings = 0;
        let mut texts = 0;
        while let Ok(Some(frame)) = frames.try_next() {
            match frame {
                Message::Ping(_) => pings += 1,
                Message::Text(_) => texts += 1,
                other => panic!("unexpected frame {other:?}"),
            }
        }
        assert_eq!((pings, texts), (2, 1));

        // dropping the outbound side ends the writer
        drop(outbound);
        writer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_queued_client_answering_pings_stays_connected() {
        let state = state();
        let limiter = SessionRateLimiter::new();
        let (session, _rx) = new_session(&state);
        dispatch(&state, &session, &limiter, tier_join()).await;

        let (client, reader) = spawn_reader(&state, &session);
        // the browser only answers server pings for ninety seconds
        for _ in 0..4 {
            tokio::time::sleep(HEARTBEAT_INTERVAL).await;
            client.unbounded_send(Ok(Message::Pong(Vec::new()))).unwrap();
        }
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(!reader.is_finished());
        assert!(state.matchmaking.is_in_queue(&session.id).await);

        drop(client);
        reader.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_is_dropped_after_idle_timeout() {
        let state = state();
        let (session, _rx) = new_session(&state);

        let (_client, reader) = spawn_reader(&state, &session);
        tokio::time::sleep(IDLE_TIMEOUT + Duration::from_secs(1)).await;
        assert!(reader.is_finished());
    }
}
