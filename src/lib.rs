//! Client engine for a push-based cache-invalidation protocol.
//!
//! A [`client::InvalidationClient`] keeps an authenticated session with an
//! invalidation service, registers interest in opaque object ids, and
//! delivers server-pushed version invalidations to an application
//! listener, acking each one to the server only after the application
//! acknowledges it. Outbound traffic is batched, throttled, and smeared so
//! fleets of clients never synchronize.
//!
//! The engine is sans-network: the host supplies a clock, a transport, and
//! a blob store through [`client::SystemResources`], feeds inbound bytes to
//! `receive`, and calls `advance` whenever `next_deadline_ms` comes due.

#![forbid(unsafe_code)]

pub mod client;
pub mod config;
pub mod core;

pub use crate::client::{
    AckHandle, InvalidationClient, InvalidationListener, StateWriteError, SystemResources,
};
pub use crate::config::{ClientConfig, ThrottleRule};
pub use crate::core::{
    ApplicationClientId, ClientToken, CoreError, Invalidation, Nonce, ObjectId, RegOpKind,
    RegistrationOp, RegistrationState, RegistrationSummary,
};
