//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::game::rules::CombatRules;

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Supabase project URL
    pub supabase_url: String,
    /// Supabase service role key (bypasses RLS - server only!)
    pub supabase_service_role_key: String,
    /// Supabase JWT secret for token verification
    pub supabase_jwt_secret: String,

    /// Escrow settlement endpoint
    pub escrow_url: String,
    pub escrow_api_key: String,
    /// HMAC key for escrow request signatures
    pub escrow_signing_secret: String,

    /// Allowed client origin for CORS
    pub client_origin: String,

    pub game: GameConfig,
}

/// Match and queue tuning
#[derive(Clone, Debug)]
pub struct GameConfig {
    pub countdown: Duration,
    pub match_duration: Duration,
    pub reconnect_grace: Duration,
    /// How long a tutorial entry waits before it gets a bot opponent
    pub tutorial_bot_wait: Duration,
    pub min_wager: u64,
    pub max_wager: u64,
    pub combat: CombatRules,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            countdown: Duration::from_secs(3),
            match_duration: Duration::from_secs(90),
            reconnect_grace: Duration::from_secs(10),
            tutorial_bot_wait: Duration::from_secs(15),
            min_wager: 1,
            max_wager: 1_000_000,
            combat: CombatRules::default(),
        }
    }
}

impl GameConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let game = Self {
            countdown: secs_or("COUNTDOWN_SECS", defaults.countdown)?,
            match_duration: secs_or("MATCH_DURATION_SECS", defaults.match_duration)?,
            reconnect_grace: secs_or("RECONNECT_GRACE_SECS", defaults.reconnect_grace)?,
            tutorial_bot_wait: secs_or("TUTORIAL_BOT_WAIT_SECS", defaults.tutorial_bot_wait)?,
            min_wager: parse_or("MIN_WAGER", defaults.min_wager)?,
            max_wager: parse_or("MAX_WAGER", defaults.max_wager)?,
            combat: defaults.combat,
        };

        if game.min_wager > game.max_wager {
            return Err(ConfigError::Invalid("MIN_WAGER"));
        }
        if game.match_duration.is_zero() {
            return Err(ConfigError::Invalid("MATCH_DURATION_SECS"));
        }
        Ok(game)
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Render provides PORT env var, fall back to SERVER_ADDR or default
        let server_addr = if let Ok(port) = env::var("PORT") {
            format!("0.0.0.0:{}", port)
        } else {
            env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        };

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,

            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),

            supabase_url: env::var("SUPABASE_URL")
                .map_err(|_| ConfigError::Missing("SUPABASE_URL"))?,
            supabase_service_role_key: env::var("SUPABASE_SERVICE_ROLE_KEY")
                .map_err(|_| ConfigError::Missing("SUPABASE_SERVICE_ROLE_KEY"))?,
            supabase_jwt_secret: env::var("SUPABASE_JWT_SECRET")
                .map_err(|_| ConfigError::Missing("SUPABASE_JWT_SECRET"))?,

            escrow_url: env::var("ESCROW_URL").map_err(|_| ConfigError::Missing("ESCROW_URL"))?,
            escrow_api_key: env::var("ESCROW_API_KEY")
                .map_err(|_| ConfigError::Missing("ESCROW_API_KEY"))?,
            escrow_signing_secret: env::var("ESCROW_SIGNING_SECRET")
                .map_err(|_| ConfigError::Missing("ESCROW_SIGNING_SECRET"))?,

            client_origin: env::var("CLIENT_ORIGIN")
                .map_err(|_| ConfigError::Missing("CLIENT_ORIGIN"))?,

            game: GameConfig::from_env()?,
        })
    }
}

#[cfg(test)]
impl Config {
    /// Local-only settings; collaborators point at unroutable hosts
    pub fn for_tests() -> Self {
        Self {
            server_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            log_level: "debug".to_string(),
            supabase_url: "http://127.0.0.1:9".to_string(),
            supabase_service_role_key: "service-role".to_string(),
            supabase_jwt_secret: "jwt-secret".to_string(),
            escrow_url: "http://127.0.0.1:9/settle".to_string(),
            escrow_api_key: "escrow-key".to_string(),
            escrow_signing_secret: "escrow-secret".to_string(),
            client_origin: "http://localhost:5173".to_string(),
            game: GameConfig::default(),
        }
    }
}

fn parse_or<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid(key)),
        Err(_) => Ok(default),
    }
}

fn secs_or(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    parse_or(key, default.as_secs()).map(Duration::from_secs)
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),

    #[error("Invalid server address format")]
    InvalidAddress,
}
