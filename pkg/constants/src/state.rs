//! State store / registry constants.

/// Root prefix under which every object is stored.
pub const REGISTRY_PREFIX: &str = "/registry/";

/// Capacity of the broadcast channel feeding live watchers.
pub const EVENT_BROADCAST_CAPACITY: usize = 1024;
