//! Wager settlement against the external escrow service

pub mod escrow;

pub use escrow::EscrowService;
