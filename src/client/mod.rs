//! The client protocol engine.

mod backoff;
mod engine;
pub mod error;
mod listener;
mod persistence;
pub mod proto;
mod protocol;
mod registration;
mod resources;
mod scheduler;
mod smear;
mod statistics;
mod throttle;
mod validator;

pub use backoff::ExponentialBackoff;
pub use engine::InvalidationClient;
pub use error::{EngineError, InboundError};
pub use listener::{AckHandle, InvalidationListener};
pub use persistence::{DigestFn, PersistentState, Sha256Mac, decode_state, encode_state};
pub use proto::{
    ClientHeader, ClientMessage, InfoMessage, InfoType, InitializeMessage, InvalidationSection,
    PROTOCOL_VERSION, ProtoLimits, RegistrationStatus, ServerError, ServerErrorCode, ServerHeader,
    ServerMessage, TokenControl, TokenStatus, WireInvalidation, decode_client_message,
    encode_server_message,
};
pub use registration::{RegistrationEvent, RegistrationManager};
pub use resources::{StateWriteError, SystemResources};
pub use scheduler::{OpId, OperationScheduler};
pub use smear::Smearer;
pub use statistics::Statistics;
pub use throttle::{RateLimiter, ThrottleDecision};
pub use validator::{InvalidReason, validate_client_message, validate_server_message};
