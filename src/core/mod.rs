//! Domain atoms shared across the protocol engine.

pub mod error;
mod identity;
mod invalidation;
mod registration;
mod summary;

pub use error::{CoreError, InvalidObject, InvalidVersion};
pub use identity::{
    ApplicationClientId, ClientToken, MAX_OBJECT_NAME_BYTES, NONCE_LEN, Nonce, ObjectId,
};
pub use invalidation::Invalidation;
pub use registration::{
    RegOpKind, RegistrationOp, RegistrationState, RegistrationSubtree, StatusCode,
};
pub use summary::{RegistrationSummary, SUMMARY_DIGEST_LEN};
