//! Wager escrow settlement client

use futures::future::BoxFuture;
use hmac::{Hmac, Mac};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use sha2::Sha256;
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::game::settlement::{SettlementError, WagerEscrow};
use crate::ws::protocol::{MatchResult, ResultReason};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Escrow-Signature";
pub const TIMESTAMP_HEADER: &str = "X-Escrow-Timestamp";

/// How the escrowed stakes move
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disbursement {
    /// Both stakes go to the winner
    Payout,
    /// Each side gets its stake back (draw or void)
    Refund,
}

/// Body of a settlement request
#[derive(Debug, Clone, Serialize)]
pub struct SettlementRequest {
    pub room_id: Uuid,
    pub disbursement: Disbursement,
    pub winner_wallet: Option<String>,
    pub loser_wallet: Option<String>,
    pub wallets: Vec<String>,
    pub wager: u64,
    pub reason: ResultReason,
}

impl SettlementRequest {
    pub fn from_result(result: &MatchResult) -> Self {
        let wallet = |id: Option<Uuid>| id.and_then(|id| result.wallet_of(id)).map(str::to_string);
        let disbursement = match (result.reason, result.winner) {
            (ResultReason::Voided, _) | (_, None) => Disbursement::Refund,
            (_, Some(_)) => Disbursement::Payout,
        };
        Self {
            room_id: result.room_id,
            disbursement,
            winner_wallet: wallet(result.winner),
            loser_wallet: wallet(result.loser),
            wallets: result
                .participants
                .iter()
                .filter(|p| !p.is_bot)
                .map(|p| p.wallet.clone())
                .collect(),
            wager: result.wager,
            reason: result.reason,
        }
    }
}

/// Escrow service client
#[derive(Clone)]
pub struct EscrowService {
    client: Client,
    url: String,
    api_key: String,
    signing_secret: String,
}

impl EscrowService {
    pub fn new(config: &Config) -> Self {
        Self {
            client: Client::new(),
            url: config.escrow_url.clone(),
            api_key: config.escrow_api_key.clone(),
            signing_secret: config.escrow_signing_secret.clone(),
        }
    }

    /// Settle the wager for one room. The room id is the idempotency key, so
    /// retries and replays never move funds twice.
    pub async fn settle_result(&self, result: &MatchResult) -> Result<(), EscrowError> {
        let request = SettlementRequest::from_result(result);
        let body = serde_json::to_string(&request).map_err(EscrowError::Encode)?;
        let timestamp = chrono::Utc::now().timestamp();
        let signature = sign(&self.signing_secret, timestamp, &body)?;

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .header("Content-Type", "application/json")
            .header("Idempotency-Key", result.room_id.to_string())
            .header(TIMESTAMP_HEADER, timestamp.to_string())
            .header(SIGNATURE_HEADER, signature)
            .body(body)
            .send()
            .await
            .map_err(EscrowError::Request)?;

        let status = response.status();
        // 409: already settled under this idempotency key
        if status.is_success() || status == StatusCode::CONFLICT {
            info!(
                room_id = %result.room_id,
                disbursement = ?request.disbursement,
                status = status.as_u16(),
                "Escrow settled"
            );
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(EscrowError::Api {
            status: status.as_u16(),
            body,
        })
    }
}

impl WagerEscrow for EscrowService {
    fn settle<'a>(&'a self, result: &'a MatchResult) -> BoxFuture<'a, Result<(), SettlementError>> {
        Box::pin(async move {
            self.settle_result(result)
                .await
                .map_err(SettlementError::from)
        })
    }
}

/// Hex HMAC-SHA256 over `"{timestamp}.{body}"`
pub fn sign(secret: &str, timestamp: i64, body: &str) -> Result<String, EscrowError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| EscrowError::InvalidKey)?;
    mac.update(format!("{}.{}", timestamp, body).as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Escrow-related errors
#[derive(Debug, thiserror::Error)]
pub enum EscrowError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Escrow API error (status {status}): {body}")]
    Api { status: u16, body: String },

    #[error("Failed to encode settlement: {0}")]
    Encode(serde_json::Error),

    #[error("Invalid signing key")]
    InvalidKey,
}
