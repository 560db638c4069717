//! Conventional message keys shared across collaborators.

/// Delivery acknowledgement. Handled internally, never surfaced to listens.
pub const CONFIRM: &str = "CONFIRM";
/// Batched stream wrapper carrying `inner_key` and `payload`.
pub const STREAM: &str = "STREAM";
/// Graceful shutdown of a router.
pub const KILL: &str = "KILL";
/// Liveness / status change.
pub const STATE: &str = "STATE";
/// Liveness probe.
pub const PING: &str = "PING";
/// Trial data.
pub const DATA: &str = "DATA";
/// High-rate sensor data, relayed with decimation.
pub const CONTINUOUS: &str = "CONTINUOUS";
/// First-contact announcement with address metadata.
pub const HANDSHAKE: &str = "HANDSHAKE";
/// Pull (or deliver) a named resource.
pub const FILE: &str = "FILE";
/// Ask the coordinator to probe every known peer.
pub const HEALTH: &str = "HEALTH";
