//! Protocol version range
//!
//! Channels negotiate downward only: every outbound operation is stamped
//! with the channel's current version, and a peer answering
//! `InvalidVersion`/`IncompatibleService` makes the client retry one
//! version lower until the floor is reached.

/// Oldest protocol version this build can speak.
pub const LOWEST_SUPPORTED_VERSION: u64 = 1;

/// Newest protocol version this build can speak.
pub const HIGHEST_SUPPORTED_VERSION: u64 = 3;

/// The version fresh channels start at.
pub const fn current_version() -> u64 {
    HIGHEST_SUPPORTED_VERSION
}

/// Clamp a requested version into the supported range.
pub fn clamp(version: u64) -> u64 {
    version.clamp(LOWEST_SUPPORTED_VERSION.max(1), HIGHEST_SUPPORTED_VERSION)
}
