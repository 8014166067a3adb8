//! Channel IDs carried in every frame header.

/// Configuration handshake and session control (completion).
pub const CONTROL: u16 = 0;

/// Correlated process requests and responses.
pub const PROCESS: u16 = 1;

/// Returns a human-readable name for a channel ID.
pub fn channel_name(id: u16) -> &'static str {
    match id {
        CONTROL => "CONTROL",
        PROCESS => "PROCESS",
        _ => "UNKNOWN",
    }
}
