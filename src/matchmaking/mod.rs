//! Matchmaking queue and room creation

pub mod queue;
pub mod service;

pub use service::{JoinOutcome, MatchmakingService, QueueError, QueueStatus};
