//! Application state shared across routes

use std::sync::Arc;

use crate::config::Config;
use crate::game::spectators::SpectatorIndex;
use crate::game::{RoomContext, RoomRegistry, RoomSpawner, Settlement, SpectatorHub};
use crate::matchmaking::MatchmakingService;
use crate::payments::EscrowService;
use crate::store::{ProfileStore, SupabaseClient};
use crate::supervisor::Supervisor;
use crate::ws::session::SessionRegistry;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub sessions: Arc<SessionRegistry>,
    pub rooms: Arc<RoomRegistry>,
    pub matchmaking: Arc<MatchmakingService>,
    pub spectators: Arc<SpectatorHub>,
    pub supervisor: Arc<Supervisor>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);

        // Initialize Supabase client and stores
        let supabase = SupabaseClient::new(&config);
        let profile_store = ProfileStore::new(supabase);

        // Result delivery: profile store first, then escrow
        let escrow = EscrowService::new(&config);
        let settlement = Arc::new(Settlement::new(
            Arc::new(profile_store),
            Arc::new(escrow),
        ));

        let rooms = Arc::new(RoomRegistry::new());
        let spectator_index = Arc::new(SpectatorIndex::new());
        let spawner = RoomSpawner::new(RoomContext {
            config: Arc::new(config.game.clone()),
            registry: rooms.clone(),
            spectator_index: spectator_index.clone(),
            settlement,
        });

        // Initialize matchmaking service (Arc for sharing across cloned AppState)
        let matchmaking = Arc::new(MatchmakingService::new(spawner));
        let spectators = Arc::new(SpectatorHub::new(rooms.clone(), spectator_index));
        let sessions = Arc::new(SessionRegistry::new());
        let supervisor = Arc::new(Supervisor::new(
            sessions.clone(),
            matchmaking.clone(),
            rooms.clone(),
            spectators.clone(),
        ));

        Self {
            config,
            sessions,
            rooms,
            matchmaking,
            spectators,
            supervisor,
        }
    }
}
