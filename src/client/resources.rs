//! Host-provided clock, transport, and blob store.

use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("state write failed: {reason}")]
pub struct StateWriteError {
    pub reason: String,
}

/// Everything the engine needs from its host.
///
/// The engine never reads a system clock, spawns a thread, or blocks: time
/// comes from `now_ms`, sends are fire-and-forget, and persistence writes
/// are issued without waiting. Hosts report delivery problems through
/// [`InvalidationClient::network_status`], not through `send`.
///
/// [`InvalidationClient::network_status`]: super::engine::InvalidationClient::network_status
pub trait SystemResources {
    /// Current wall-clock time in milliseconds. Must be monotone enough
    /// that scheduled deadlines eventually come due.
    fn now_ms(&self) -> u64;

    /// Hand one encoded message to the transport.
    fn send(&mut self, bytes: Bytes);

    /// The persisted state blob, if one exists.
    fn read_state(&mut self) -> Option<Bytes>;

    /// Replace the persisted state blob.
    fn write_state(&mut self, bytes: Bytes) -> Result<(), StateWriteError>;

    /// Remove the persisted state blob. Failures are the host's to log;
    /// the engine behaves as if the blob were gone either way.
    fn delete_state(&mut self);
}
