use thiserror::Error;

use crate::config::ConfigError;

use super::proto::{ProtoDecodeError, ProtoEncodeError};
use super::validator::InvalidReason;

/// Fatal engine-side failures. Anything here means a bug in this crate or
/// its configuration, never a misbehaving peer.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("engine built an invalid outbound message: {0}")]
    InternalInvariant(#[from] InvalidReason),

    #[error("outbound encode failed: {0}")]
    Encode(#[from] ProtoEncodeError),
}

/// Why an inbound message was dropped. All variants recover locally.
#[derive(Debug, Error)]
pub enum InboundError {
    #[error("undecodable message: {0}")]
    Decode(#[from] ProtoDecodeError),

    #[error("structurally invalid message: {0}")]
    Invalid(#[from] InvalidReason),

    #[error("message addressed to a different client token")]
    TokenMismatch,
}
