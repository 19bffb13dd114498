//! Per-connection transport handles and the session registry
//!
//! A [`Session`] is one authenticated player; its [`Transport`] is the outbound
//! side of the connection it currently holds. Reconnecting swaps the transport
//! but keeps the session id, so queue and room membership survive.

use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;
use uuid::Uuid;

use crate::ws::protocol::ServerMsg;

/// Outbound buffer per connection. A client that falls this far behind
/// starts losing messages instead of slowing down rooms.
pub const OUTBOUND_BUFFER: usize = 128;

/// Outbound half of one live connection
#[derive(Debug, Clone)]
pub struct Transport {
    connection_id: Uuid,
    tx: mpsc::Sender<ServerMsg>,
}

impl Transport {
    pub fn new(tx: mpsc::Sender<ServerMsg>) -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            tx,
        }
    }

    /// Create a transport together with the receiver its writer task drains
    pub fn channel() -> (Self, mpsc::Receiver<ServerMsg>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        (Self::new(tx), rx)
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// Liveness: the writer side still holds the receiver
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Fire-and-forget send. Each message is delivered at most once; a full
    /// or closed channel drops it.
    pub fn send(&self, msg: ServerMsg) -> bool {
        match self.tx.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!(connection_id = %self.connection_id, "Outbound buffer full, dropping message");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// An authenticated player and its current connection
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    /// Opaque wallet identifier from the auth token
    pub wallet: String,
    pub transport: Transport,
}

impl Session {
    pub fn new(id: Uuid, wallet: impl Into<String>, transport: Transport) -> Self {
        Self {
            id,
            wallet: wallet.into(),
            transport,
        }
    }

    pub fn send(&self, msg: ServerMsg) -> bool {
        self.transport.send(msg)
    }
}

/// All sessions with a live connection
pub struct SessionRegistry {
    sessions: DashMap<Uuid, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Attach a connection to a session, returning the one it supersedes
    pub fn attach(&self, session: Session) -> Option<Session> {
        self.sessions.insert(session.id, session)
    }

    /// Detach a connection. Ignored (returns false) when a newer connection
    /// has already taken over the session.
    pub fn detach(&self, session_id: Uuid, connection_id: Uuid) -> bool {
        self.sessions
            .remove_if(&session_id, |_, s| s.transport.connection_id() == connection_id)
            .is_some()
    }

    pub fn get(&self, session_id: &Uuid) -> Option<Session> {
        self.sessions.get(session_id).map(|s| s.value().clone())
    }

    pub fn connected(&self) -> usize {
        self.sessions.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_is_at_most_once_and_drops_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let transport = Transport::new(tx);

        assert!(transport.send(ServerMsg::QueueLeft));
        assert!(!transport.send(ServerMsg::Pong { t: 1 }));

        assert!(matches!(rx.try_recv(), Ok(ServerMsg::QueueLeft)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn closed_transport_reports_not_open() {
        let (transport, rx) = Transport::channel();
        assert!(transport.is_open());
        drop(rx);
        assert!(!transport.is_open());
        assert!(!transport.send(ServerMsg::QueueLeft));
    }

    #[test]
    fn stale_connection_cannot_detach_newer_one() {
        let registry = SessionRegistry::new();
        let id = Uuid::new_v4();
        let (old, _old_rx) = Transport::channel();
        let (new, _new_rx) = Transport::channel();
        let old_conn = old.connection_id();

        registry.attach(Session::new(id, "wallet", old));
        let superseded = registry.attach(Session::new(id, "wallet", new));
        assert_eq!(superseded.map(|s| s.transport.connection_id()), Some(old_conn));

        assert!(!registry.detach(id, old_conn));
        assert_eq!(registry.connected(), 1);

        let current = registry.get(&id).unwrap().transport.connection_id();
        assert!(registry.detach(id, current));
        assert_eq!(registry.connected(), 0);
    }
}
