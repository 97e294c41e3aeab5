//! Structural validation of protocol messages.
//!
//! The codec only enforces CBOR shape; the predicates here own semantic
//! structure. Inbound messages that fail are dropped with a warning by the
//! caller. An outbound message that fails was built by this engine, which
//! is an unrecoverable internal bug.

use thiserror::Error;

use crate::core::SUMMARY_DIGEST_LEN;

use super::proto::{ClientMessage, ServerMessage, TokenStatus};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidReason {
    #[error("message carries neither a token nor an initialize request")]
    MissingToken,
    #[error("initialize request must not carry a header token")]
    TokenWithInitialize,
    #[error("registration op {index} has an empty object name")]
    EmptyRegistrationObject { index: usize },
    #[error("sync subtree {index} is empty")]
    EmptySyncSubtree { index: usize },
    #[error("invalidation {index} has negative version {version}")]
    NegativeVersion { index: usize, version: i64 },
    #[error("invalidation {index} has an empty object name")]
    EmptyInvalidationObject { index: usize },
    #[error("token assignment without a correlating nonce")]
    TokenAssignmentWithoutNonce,
    #[error("registration summary count {num} disagrees with an all-zero digest")]
    SummaryCountMismatch { num: u32 },
    #[error("message id 0 is reserved")]
    ZeroMessageId,
    #[error("encoded message is {got} bytes, limit {max}")]
    Oversized { got: usize, max: usize },
}

pub fn validate_client_message(msg: &ClientMessage) -> Result<(), InvalidReason> {
    match (&msg.header.client_token, &msg.initialize) {
        (None, None) => return Err(InvalidReason::MissingToken),
        (Some(_), Some(_)) => return Err(InvalidReason::TokenWithInitialize),
        _ => {}
    }
    if msg.header.message_id == 0 {
        return Err(InvalidReason::ZeroMessageId);
    }
    validate_summary(
        msg.header.registration_summary.num_registrations(),
        msg.header.registration_summary.digest(),
    )?;
    for (index, op) in msg.registrations.iter().enumerate() {
        if op.object.name().is_empty() {
            return Err(InvalidReason::EmptyRegistrationObject { index });
        }
    }
    for (index, subtree) in msg.sync_subtrees.iter().enumerate() {
        if subtree.objects.is_empty() {
            return Err(InvalidReason::EmptySyncSubtree { index });
        }
    }
    validate_invalidations(msg.invalidation_acks.iter().map(|ack| &ack.invalidation))?;
    Ok(())
}

pub fn validate_server_message(msg: &ServerMessage) -> Result<(), InvalidReason> {
    if let Some(tc) = &msg.token_control {
        // A successful assignment must be correlatable to our request;
        // rejections may arrive without one.
        if tc.status == TokenStatus::Success && tc.new_token.is_some() && tc.nonce.is_none() {
            return Err(InvalidReason::TokenAssignmentWithoutNonce);
        }
    }
    if let Some(summary) = &msg.header.registration_summary {
        validate_summary(summary.num_registrations(), summary.digest())?;
    }
    if let Some(section) = &msg.invalidations {
        validate_invalidations(section.invalidations.iter().map(|inv| &inv.invalidation))?;
    }
    for (index, status) in msg.registration_statuses.iter().enumerate() {
        if status.op.object.name().is_empty() {
            return Err(InvalidReason::EmptyRegistrationObject { index });
        }
    }
    Ok(())
}

pub fn validate_encoded_size(encoded_len: usize, max: usize) -> Result<(), InvalidReason> {
    if encoded_len > max {
        return Err(InvalidReason::Oversized {
            got: encoded_len,
            max,
        });
    }
    Ok(())
}

fn validate_summary(num: u32, digest: &[u8; SUMMARY_DIGEST_LEN]) -> Result<(), InvalidReason> {
    // A non-empty set XORs at least one SHA-256 output into the digest;
    // all zeroes with a nonzero count means someone fabricated the summary.
    if num > 0 && digest.iter().all(|b| *b == 0) {
        return Err(InvalidReason::SummaryCountMismatch { num });
    }
    Ok(())
}

fn validate_invalidations<'a>(
    invalidations: impl Iterator<Item = &'a crate::core::Invalidation>,
) -> Result<(), InvalidReason> {
    for (index, inv) in invalidations.enumerate() {
        if inv.version() < 0 {
            return Err(InvalidReason::NegativeVersion {
                index,
                version: inv.version(),
            });
        }
        if inv.object().name().is_empty() {
            return Err(InvalidReason::EmptyInvalidationObject { index });
        }
    }
    Ok(())
}
