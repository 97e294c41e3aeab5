//! Durable session identity with MAC integrity.
//!
//! Only identity survives a restart: the client token and a message-id
//! floor. The blob is wrapped in an envelope carrying a MAC over the inner
//! encoding; a blob that fails to parse or fails the MAC check is treated
//! as if no state had ever been written.

use std::convert::Infallible;

use bytes::Bytes;
use minicbor::{Decoder, Encoder};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::core::ClientToken;

/// Session identity carried across restarts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PersistentState {
    pub client_token: ClientToken,
    pub last_message_id: u64,
}

/// Digest function for the persistence MAC, injected so deployments can
/// swap the algorithm in lockstep with whatever wrote their existing blobs.
pub trait DigestFn {
    fn digest(&self, bytes: &[u8]) -> Vec<u8>;
}

/// Default MAC digest.
#[derive(Clone, Copy, Debug, Default)]
pub struct Sha256Mac;

impl DigestFn for Sha256Mac {
    fn digest(&self, bytes: &[u8]) -> Vec<u8> {
        Sha256::digest(bytes).to_vec()
    }
}

#[derive(Debug, Error)]
pub enum PersistEncodeError {
    #[error("cbor encode: {0}")]
    Cbor(#[from] minicbor::encode::Error<Infallible>),
}

pub fn encode_state(
    state: &PersistentState,
    digest: &impl DigestFn,
) -> Result<Bytes, PersistEncodeError> {
    let mut inner = Vec::new();
    let mut enc = Encoder::new(&mut inner);
    enc.map(2)?;
    enc.str("token")?;
    enc.bytes(state.client_token.as_bytes())?;
    enc.str("last_message_id")?;
    enc.u64(state.last_message_id)?;

    let mac = digest.digest(&inner);
    let mut outer = Vec::new();
    let mut enc = Encoder::new(&mut outer);
    enc.map(2)?;
    enc.str("state")?;
    enc.bytes(&inner)?;
    enc.str("mac")?;
    enc.bytes(&mac)?;
    Ok(Bytes::from(outer))
}

/// Parses a persisted blob. Any structural failure or MAC mismatch yields
/// `None`; callers start unassigned in that case.
pub fn decode_state(bytes: &[u8], digest: &impl DigestFn) -> Option<PersistentState> {
    match try_decode(bytes, digest) {
        Ok(state) => Some(state),
        Err(reason) => {
            tracing::warn!("discarding persisted client state: {reason}");
            None
        }
    }
}

fn try_decode(bytes: &[u8], digest: &impl DigestFn) -> Result<PersistentState, String> {
    let (inner, mac) = decode_envelope(bytes).map_err(|err| err.to_string())?;
    let expected = digest.digest(&inner);
    if expected != mac {
        return Err("mac mismatch".to_string());
    }
    decode_inner(&inner).map_err(|err| err.to_string())
}

fn decode_envelope(bytes: &[u8]) -> Result<(Vec<u8>, Vec<u8>), minicbor::decode::Error> {
    let mut dec = Decoder::new(bytes);
    let len = dec
        .map()?
        .ok_or_else(|| minicbor::decode::Error::message("indefinite map"))?;
    let mut state = None;
    let mut mac = None;
    for _ in 0..len {
        match dec.str()? {
            "state" => state = Some(dec.bytes()?.to_vec()),
            "mac" => mac = Some(dec.bytes()?.to_vec()),
            _ => dec.skip()?,
        }
    }
    if dec.datatype().is_ok() {
        return Err(minicbor::decode::Error::message("trailing bytes"));
    }
    match (state, mac) {
        (Some(state), Some(mac)) => Ok((state, mac)),
        _ => Err(minicbor::decode::Error::message("missing envelope field")),
    }
}

fn decode_inner(bytes: &[u8]) -> Result<PersistentState, minicbor::decode::Error> {
    let mut dec = Decoder::new(bytes);
    let len = dec
        .map()?
        .ok_or_else(|| minicbor::decode::Error::message("indefinite map"))?;
    let mut token = None;
    let mut last_message_id = None;
    for _ in 0..len {
        match dec.str()? {
            "token" => token = Some(Bytes::copy_from_slice(dec.bytes()?)),
            "last_message_id" => last_message_id = Some(dec.u64()?),
            _ => dec.skip()?,
        }
    }
    let token = token.ok_or_else(|| minicbor::decode::Error::message("missing token"))?;
    let client_token = ClientToken::new(token)
        .map_err(|_| minicbor::decode::Error::message("empty token"))?;
    let last_message_id =
        last_message_id.ok_or_else(|| minicbor::decode::Error::message("missing message id"))?;
    Ok(PersistentState {
        client_token,
        last_message_id,
    })
}
