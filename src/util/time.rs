//! Time utilities for room simulation

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Get current Unix timestamp in milliseconds
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// Server start time for uptime tracking
static SERVER_START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

/// Initialize server start time (call once at startup)
pub fn init_server_time() {
    SERVER_START.get_or_init(Instant::now);
}

/// Get server uptime in seconds
pub fn uptime_secs() -> u64 {
    SERVER_START
        .get()
        .map(|start| start.elapsed().as_secs())
        .unwrap_or(0)
}

/// Tick rate configuration
pub const SIMULATION_TPS: u32 = 20; // 20 room ticks per second
pub const TICK_MILLIS: u64 = 1_000 / SIMULATION_TPS as u64;
/// Periodic spectator snapshot cadence while nothing else changes
pub const SNAPSHOT_EVERY_TICKS: u32 = 5;

/// Wall-clock duration of one room tick
pub fn tick_duration() -> Duration {
    Duration::from_millis(TICK_MILLIS)
}

/// Round a duration up to whole ticks, expressed on the room clock
pub fn ticks_to_millis(duration: Duration) -> u64 {
    let ms = duration.as_millis() as u64;
    ms.div_ceil(TICK_MILLIS) * TICK_MILLIS
}
