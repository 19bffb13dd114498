//! Profile store: the match history each player's profile is built from

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use uuid::Uuid;

use crate::game::settlement::{MatchRecorder, SettlementError};
use crate::ws::protocol::{MatchResult, ResultReason};

use super::supabase::{SupabaseClient, SupabaseError};

/// One row of the `match_results` table, keyed by room id
#[derive(Debug, Clone, Serialize)]
pub struct MatchRecord {
    pub room_id: Uuid,
    pub winner_id: Option<Uuid>,
    pub loser_id: Option<Uuid>,
    pub winner_wallet: Option<String>,
    pub reason: ResultReason,
    pub duration_ms: u64,
    pub wager: u64,
    pub against_bot: bool,
    /// Full result as delivered, for auditing
    pub result: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

impl MatchRecord {
    pub fn from_result(result: &MatchResult, recorded_at: DateTime<Utc>) -> Self {
        Self {
            room_id: result.room_id,
            winner_id: result.winner,
            loser_id: result.loser,
            winner_wallet: result
                .winner
                .and_then(|w| result.wallet_of(w))
                .map(str::to_string),
            reason: result.reason,
            duration_ms: result.duration_ms,
            wager: result.wager,
            against_bot: result.participants.iter().any(|p| p.is_bot),
            result: serde_json::to_value(result).unwrap_or(serde_json::Value::Null),
            recorded_at,
        }
    }
}

/// Profile store collaborator: persists finished matches
#[derive(Clone)]
pub struct ProfileStore {
    client: SupabaseClient,
}

impl ProfileStore {
    pub fn new(client: SupabaseClient) -> Self {
        Self { client }
    }

    /// Persist a finished match. Safe to repeat for the same room.
    pub async fn record_result(&self, result: &MatchResult) -> Result<(), SupabaseError> {
        let record = MatchRecord::from_result(result, Utc::now());
        self.client
            .upsert("match_results", &record, "room_id")
            .await
    }
}

impl MatchRecorder for ProfileStore {
    fn record_match<'a>(
        &'a self,
        result: &'a MatchResult,
    ) -> BoxFuture<'a, Result<(), SettlementError>> {
        Box::pin(async move {
            self.record_result(result)
                .await
                .map_err(SettlementError::from)
        })
    }
}
