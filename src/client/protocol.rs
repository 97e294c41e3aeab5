//! Low-level message plumbing: headers, ids, throttling, codec glue.
//!
//! The handler owns everything a message needs regardless of session
//! state: the monotonic message id, the high-water mark of server time,
//! the pending invalidation acks, and the outbound throttle. The engine
//! decides *what* to send; this type gets it onto (and off of) the wire.

use std::collections::BTreeSet;

use crate::config::ThrottleRule;
use crate::core::{ClientToken, RegistrationSummary};

use super::error::{EngineError, InboundError};
use super::proto::{
    ClientHeader, ClientMessage, ProtoLimits, ServerMessage, WireInvalidation,
    decode_server_message, encode_client_message,
};
use super::resources::SystemResources;
use super::throttle::{RateLimiter, ThrottleDecision};
use super::validator::{validate_client_message, validate_encoded_size, validate_server_message};

#[derive(Debug)]
pub struct ProtocolHandler {
    client_type: i32,
    /// Last assigned outbound message id; strictly increasing for the
    /// engine's lifetime and floored from persistence across restarts.
    message_id: u64,
    max_known_server_time_ms: u64,
    pending_acks: BTreeSet<WireInvalidation>,
    limiter: RateLimiter,
    limits: ProtoLimits,
}

impl ProtocolHandler {
    pub fn new(client_type: i32, throttle_rules: &[ThrottleRule], limits: ProtoLimits) -> Self {
        Self {
            client_type,
            message_id: 0,
            max_known_server_time_ms: 0,
            pending_acks: BTreeSet::new(),
            limiter: RateLimiter::new(throttle_rules),
            limits,
        }
    }

    /// Raises the message-id floor after restoring persisted state.
    pub fn seed_message_id(&mut self, floor: u64) {
        self.message_id = self.message_id.max(floor);
    }

    pub fn last_message_id(&self) -> u64 {
        self.message_id
    }

    pub fn max_known_server_time_ms(&self) -> u64 {
        self.max_known_server_time_ms
    }

    pub fn queue_ack(&mut self, ack: WireInvalidation) {
        self.pending_acks.insert(ack);
    }

    pub fn has_pending_acks(&self) -> bool {
        !self.pending_acks.is_empty()
    }

    pub fn drain_acks(&mut self, max: usize) -> Vec<WireInvalidation> {
        let mut acks = Vec::new();
        while acks.len() < max {
            match self.pending_acks.pop_first() {
                Some(ack) => acks.push(ack),
                None => break,
            }
        }
        acks
    }

    /// Acks from a dead session are meaningless to the replacement session.
    pub fn clear_acks(&mut self) {
        self.pending_acks.clear();
    }

    pub fn check_throttle(&mut self, now_ms: u64) -> ThrottleDecision {
        self.limiter.try_fire(now_ms)
    }

    /// Builds the header for the next outbound message, consuming one
    /// message id.
    pub fn next_header(
        &mut self,
        token: Option<&ClientToken>,
        summary: RegistrationSummary,
        now_ms: u64,
    ) -> ClientHeader {
        self.message_id += 1;
        ClientHeader {
            client_type: self.client_type,
            client_token: token.cloned(),
            registration_summary: summary,
            client_time_ms: now_ms,
            message_id: self.message_id,
            max_known_server_time_ms: self.max_known_server_time_ms,
            message_id_debug: None,
        }
    }

    /// Validates, encodes, and hands one message to the transport. A
    /// validation failure here is an engine bug and is returned as fatal.
    pub fn send(
        &mut self,
        msg: &ClientMessage,
        resources: &mut impl SystemResources,
        max_message_bytes: usize,
    ) -> Result<usize, EngineError> {
        validate_client_message(msg)?;
        let bytes = encode_client_message(msg)?;
        validate_encoded_size(bytes.len(), max_message_bytes)?;
        let len = bytes.len();
        resources.send(bytes);
        Ok(len)
    }

    /// Decodes and validates one inbound message, rejects cross-talk from
    /// other client incarnations, and tracks the server time high-water
    /// mark.
    pub fn handle_inbound(
        &mut self,
        bytes: &[u8],
        current_token: Option<&ClientToken>,
    ) -> Result<ServerMessage, InboundError> {
        let msg = decode_server_message(bytes, &self.limits)?;
        validate_server_message(&msg)?;
        if let Some(msg_token) = &msg.header.client_token
            && current_token != Some(msg_token)
        {
            return Err(InboundError::TokenMismatch);
        }
        self.max_known_server_time_ms = self
            .max_known_server_time_ms
            .max(msg.header.server_time_ms);
        Ok(msg)
    }
}
