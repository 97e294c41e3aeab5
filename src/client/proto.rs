//! Wire message schemas and CBOR encoding.
//!
//! Both directions share an envelope map `{v, type, header, body}` with
//! definite lengths only. Bodies are maps of optional sections: the batcher
//! merges every drained category into one client message, and a server
//! message may carry several kinds at once. Unknown map keys are skipped
//! for forward compatibility; indefinite-length items and trailing bytes
//! are rejected outright.

use std::convert::Infallible;

use bytes::Bytes;
use minicbor::data::Type;
use minicbor::{Decoder, Encoder};
use thiserror::Error;

use crate::core::{
    ApplicationClientId, ClientToken, Invalidation, Nonce, ObjectId, RegOpKind, RegistrationOp,
    RegistrationSubtree, RegistrationSummary, StatusCode, SUMMARY_DIGEST_LEN,
};

pub const PROTOCOL_VERSION: u32 = 1;

const TYPE_CLIENT: &str = "CLIENT";
const TYPE_SERVER: &str = "SERVER";

/// Decode-side limits; oversized collections and blobs are rejected before
/// allocation.
#[derive(Clone, Debug)]
pub struct ProtoLimits {
    pub max_message_bytes: usize,
    pub max_blob_bytes: usize,
    pub max_text_bytes: usize,
    pub max_collection_len: usize,
}

impl Default for ProtoLimits {
    fn default() -> Self {
        Self {
            max_message_bytes: 64 * 1024,
            max_blob_bytes: 8 * 1024,
            max_text_bytes: 1024,
            max_collection_len: 4096,
        }
    }
}

/// Header on every client-to-server message. The protocol version rides in
/// the envelope `v` field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientHeader {
    pub client_type: i32,
    pub client_token: Option<ClientToken>,
    pub registration_summary: RegistrationSummary,
    pub client_time_ms: u64,
    pub message_id: u64,
    pub max_known_server_time_ms: u64,
    pub message_id_debug: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InitializeMessage {
    pub nonce: Nonce,
    pub application_client_id: ApplicationClientId,
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct InfoMessage {
    pub performance_counters: Vec<(String, i64)>,
    pub config_params: Vec<(String, i64)>,
}

/// An invalidation as it travels on the wire: the value plus whether the
/// version is known to the server. Unknown-version invalidations surface
/// through a dedicated listener upcall and are acked with the flag intact.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct WireInvalidation {
    pub invalidation: Invalidation,
    pub known_version: bool,
}

/// One outbound message: header plus every pending section the batcher
/// drained. `initialize` never coexists with a header token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientMessage {
    pub header: ClientHeader,
    pub initialize: Option<InitializeMessage>,
    pub registrations: Vec<RegistrationOp>,
    pub sync_subtrees: Vec<RegistrationSubtree>,
    pub invalidation_acks: Vec<WireInvalidation>,
    pub info: Option<InfoMessage>,
}

impl ClientMessage {
    pub fn header_only(header: ClientHeader) -> Self {
        Self {
            header,
            initialize: None,
            registrations: Vec::new(),
            sync_subtrees: Vec::new(),
            invalidation_acks: Vec::new(),
            info: None,
        }
    }

    pub fn is_header_only(&self) -> bool {
        self.initialize.is_none()
            && self.registrations.is_empty()
            && self.sync_subtrees.is_empty()
            && self.invalidation_acks.is_empty()
            && self.info.is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct ServerHeader {
    pub client_token: Option<ClientToken>,
    pub registration_summary: Option<RegistrationSummary>,
    pub server_time_ms: u64,
    pub next_heartbeat_interval_ms: Option<u64>,
    pub next_poll_interval_ms: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenStatus {
    Success,
    TransientFailure,
    AuthFailure,
    UnknownClient,
}

impl TokenStatus {
    fn as_str(self) -> &'static str {
        match self {
            TokenStatus::Success => "SUCCESS",
            TokenStatus::TransientFailure => "TRANSIENT_FAILURE",
            TokenStatus::AuthFailure => "AUTH_FAILURE",
            TokenStatus::UnknownClient => "UNKNOWN_CLIENT",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "SUCCESS" => Some(TokenStatus::Success),
            "TRANSIENT_FAILURE" => Some(TokenStatus::TransientFailure),
            "AUTH_FAILURE" => Some(TokenStatus::AuthFailure),
            "UNKNOWN_CLIENT" => Some(TokenStatus::UnknownClient),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenControl {
    pub new_token: Option<ClientToken>,
    pub nonce: Option<Nonce>,
    pub status: TokenStatus,
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct InvalidationSection {
    /// Drop everything: every cached object is stale.
    pub invalidate_all: bool,
    pub invalidations: Vec<WireInvalidation>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistrationStatus {
    pub op: RegistrationOp,
    pub status: StatusCode,
    pub description: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InfoType {
    PerformanceCounters,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerErrorCode {
    AuthFailure,
    UnknownClient,
    Internal,
}

impl ServerErrorCode {
    fn as_str(self) -> &'static str {
        match self {
            ServerErrorCode::AuthFailure => "AUTH_FAILURE",
            ServerErrorCode::UnknownClient => "UNKNOWN_CLIENT",
            ServerErrorCode::Internal => "INTERNAL",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "AUTH_FAILURE" => Some(ServerErrorCode::AuthFailure),
            "UNKNOWN_CLIENT" => Some(ServerErrorCode::UnknownClient),
            "INTERNAL" => Some(ServerErrorCode::Internal),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerError {
    pub code: ServerErrorCode,
    pub description: String,
}

/// One inbound message: header plus whichever sections the server chose to
/// bundle.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct ServerMessage {
    pub header: ServerHeader,
    pub token_control: Option<TokenControl>,
    pub invalidations: Option<InvalidationSection>,
    pub registration_statuses: Vec<RegistrationStatus>,
    pub sync_request: bool,
    pub info_request: Vec<InfoType>,
    pub error: Option<ServerError>,
}

#[derive(Debug, Error)]
pub enum ProtoEncodeError {
    #[error("cbor encode: {0}")]
    Cbor(#[from] minicbor::encode::Error<Infallible>),
}

#[derive(Debug, Error)]
pub enum ProtoDecodeError {
    #[error("decode limit exceeded: {0}")]
    DecodeLimit(&'static str),
    #[error("indefinite-length CBOR not allowed")]
    IndefiniteLength,
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid field {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),
    #[error("trailing bytes after message body")]
    TrailingBytes,
    #[error("cbor decode: {0}")]
    Cbor(#[from] minicbor::decode::Error),
}

type EncodeResult = Result<(), ProtoEncodeError>;
type Enc<'a> = Encoder<&'a mut Vec<u8>>;

pub fn encode_client_message(msg: &ClientMessage) -> Result<Bytes, ProtoEncodeError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    enc.map(4)?;
    enc.str("v")?;
    enc.u32(PROTOCOL_VERSION)?;
    enc.str("type")?;
    enc.str(TYPE_CLIENT)?;
    enc.str("header")?;
    encode_client_header(&mut enc, &msg.header)?;
    enc.str("body")?;
    encode_client_body(&mut enc, msg)?;
    Ok(Bytes::from(buf))
}

pub fn encode_server_message(msg: &ServerMessage) -> Result<Bytes, ProtoEncodeError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    enc.map(4)?;
    enc.str("v")?;
    enc.u32(PROTOCOL_VERSION)?;
    enc.str("type")?;
    enc.str(TYPE_SERVER)?;
    enc.str("header")?;
    encode_server_header(&mut enc, &msg.header)?;
    enc.str("body")?;
    encode_server_body(&mut enc, msg)?;
    Ok(Bytes::from(buf))
}

fn encode_client_header(enc: &mut Enc<'_>, header: &ClientHeader) -> EncodeResult {
    let mut len = 5;
    if header.client_token.is_some() {
        len += 1;
    }
    if header.message_id_debug.is_some() {
        len += 1;
    }
    enc.map(len)?;
    enc.str("client_type")?;
    enc.i32(header.client_type)?;
    if let Some(token) = &header.client_token {
        enc.str("token")?;
        enc.bytes(token.as_bytes())?;
    }
    enc.str("summary")?;
    encode_summary(enc, &header.registration_summary)?;
    enc.str("client_time_ms")?;
    enc.u64(header.client_time_ms)?;
    enc.str("message_id")?;
    enc.u64(header.message_id)?;
    enc.str("max_server_time_ms")?;
    enc.u64(header.max_known_server_time_ms)?;
    if let Some(debug) = &header.message_id_debug {
        enc.str("debug_id")?;
        enc.str(debug)?;
    }
    Ok(())
}

fn encode_client_body(enc: &mut Enc<'_>, msg: &ClientMessage) -> EncodeResult {
    let mut len = 0;
    if msg.initialize.is_some() {
        len += 1;
    }
    if !msg.registrations.is_empty() {
        len += 1;
    }
    if !msg.sync_subtrees.is_empty() {
        len += 1;
    }
    if !msg.invalidation_acks.is_empty() {
        len += 1;
    }
    if msg.info.is_some() {
        len += 1;
    }
    enc.map(len)?;
    if let Some(init) = &msg.initialize {
        enc.str("initialize")?;
        enc.map(3)?;
        enc.str("nonce")?;
        enc.bytes(init.nonce.as_bytes())?;
        enc.str("client_type")?;
        enc.i32(init.application_client_id.client_type)?;
        enc.str("client_name")?;
        enc.bytes(&init.application_client_id.client_name)?;
    }
    if !msg.registrations.is_empty() {
        enc.str("registrations")?;
        enc.array(msg.registrations.len() as u64)?;
        for op in &msg.registrations {
            enc.map(2)?;
            enc.str("object")?;
            encode_object_id(enc, &op.object)?;
            enc.str("op")?;
            enc.str(op_kind_str(op.kind))?;
        }
    }
    if !msg.sync_subtrees.is_empty() {
        enc.str("sync")?;
        enc.array(msg.sync_subtrees.len() as u64)?;
        for subtree in &msg.sync_subtrees {
            enc.map(1)?;
            enc.str("objects")?;
            enc.array(subtree.objects.len() as u64)?;
            for object in &subtree.objects {
                encode_object_id(enc, object)?;
            }
        }
    }
    if !msg.invalidation_acks.is_empty() {
        enc.str("acks")?;
        enc.array(msg.invalidation_acks.len() as u64)?;
        for ack in &msg.invalidation_acks {
            encode_wire_invalidation(enc, ack)?;
        }
    }
    if let Some(info) = &msg.info {
        enc.str("info")?;
        enc.map(2)?;
        enc.str("counters")?;
        encode_named_values(enc, &info.performance_counters)?;
        enc.str("config")?;
        encode_named_values(enc, &info.config_params)?;
    }
    Ok(())
}

fn encode_server_header(enc: &mut Enc<'_>, header: &ServerHeader) -> EncodeResult {
    let mut len = 1;
    if header.client_token.is_some() {
        len += 1;
    }
    if header.registration_summary.is_some() {
        len += 1;
    }
    if header.next_heartbeat_interval_ms.is_some() {
        len += 1;
    }
    if header.next_poll_interval_ms.is_some() {
        len += 1;
    }
    enc.map(len)?;
    if let Some(token) = &header.client_token {
        enc.str("token")?;
        enc.bytes(token.as_bytes())?;
    }
    if let Some(summary) = &header.registration_summary {
        enc.str("summary")?;
        encode_summary(enc, summary)?;
    }
    enc.str("server_time_ms")?;
    enc.u64(header.server_time_ms)?;
    if let Some(interval) = header.next_heartbeat_interval_ms {
        enc.str("heartbeat_interval_ms")?;
        enc.u64(interval)?;
    }
    if let Some(interval) = header.next_poll_interval_ms {
        enc.str("poll_interval_ms")?;
        enc.u64(interval)?;
    }
    Ok(())
}

fn encode_server_body(enc: &mut Enc<'_>, msg: &ServerMessage) -> EncodeResult {
    let mut len = 0;
    if msg.token_control.is_some() {
        len += 1;
    }
    if msg.invalidations.is_some() {
        len += 1;
    }
    if !msg.registration_statuses.is_empty() {
        len += 1;
    }
    if msg.sync_request {
        len += 1;
    }
    if !msg.info_request.is_empty() {
        len += 1;
    }
    if msg.error.is_some() {
        len += 1;
    }
    enc.map(len)?;
    if let Some(tc) = &msg.token_control {
        enc.str("token_control")?;
        let mut tc_len = 1;
        if tc.new_token.is_some() {
            tc_len += 1;
        }
        if tc.nonce.is_some() {
            tc_len += 1;
        }
        enc.map(tc_len)?;
        if let Some(token) = &tc.new_token {
            enc.str("new_token")?;
            enc.bytes(token.as_bytes())?;
        }
        if let Some(nonce) = &tc.nonce {
            enc.str("nonce")?;
            enc.bytes(nonce.as_bytes())?;
        }
        enc.str("status")?;
        enc.str(tc.status.as_str())?;
    }
    if let Some(section) = &msg.invalidations {
        enc.str("invalidations")?;
        enc.map(2)?;
        enc.str("all")?;
        enc.bool(section.invalidate_all)?;
        enc.str("list")?;
        enc.array(section.invalidations.len() as u64)?;
        for inv in &section.invalidations {
            encode_wire_invalidation(enc, inv)?;
        }
    }
    if !msg.registration_statuses.is_empty() {
        enc.str("reg_statuses")?;
        enc.array(msg.registration_statuses.len() as u64)?;
        for status in &msg.registration_statuses {
            let mut st_len = 3;
            if status.description.is_some() {
                st_len += 1;
            }
            enc.map(st_len)?;
            enc.str("object")?;
            encode_object_id(enc, &status.op.object)?;
            enc.str("op")?;
            enc.str(op_kind_str(status.op.kind))?;
            enc.str("status")?;
            enc.str(status_code_str(status.status))?;
            if let Some(description) = &status.description {
                enc.str("description")?;
                enc.str(description)?;
            }
        }
    }
    if msg.sync_request {
        enc.str("sync_request")?;
        enc.bool(true)?;
    }
    if !msg.info_request.is_empty() {
        enc.str("info_request")?;
        enc.array(msg.info_request.len() as u64)?;
        for info_type in &msg.info_request {
            enc.str(match info_type {
                InfoType::PerformanceCounters => "PERFORMANCE_COUNTERS",
            })?;
        }
    }
    if let Some(error) = &msg.error {
        enc.str("error")?;
        enc.map(2)?;
        enc.str("code")?;
        enc.str(error.code.as_str())?;
        enc.str("description")?;
        enc.str(&error.description)?;
    }
    Ok(())
}

fn encode_object_id(enc: &mut Enc<'_>, object: &ObjectId) -> EncodeResult {
    enc.map(2)?;
    enc.str("source")?;
    enc.i32(object.source())?;
    enc.str("name")?;
    enc.bytes(object.name())?;
    Ok(())
}

fn encode_summary(enc: &mut Enc<'_>, summary: &RegistrationSummary) -> EncodeResult {
    enc.map(2)?;
    enc.str("num")?;
    enc.u32(summary.num_registrations())?;
    enc.str("digest")?;
    enc.bytes(summary.digest())?;
    Ok(())
}

fn encode_wire_invalidation(enc: &mut Enc<'_>, inv: &WireInvalidation) -> EncodeResult {
    let mut len = 3;
    if inv.invalidation.payload().is_some() {
        len += 1;
    }
    enc.map(len)?;
    enc.str("object")?;
    encode_object_id(enc, inv.invalidation.object())?;
    enc.str("version")?;
    enc.i64(inv.invalidation.version())?;
    enc.str("known")?;
    enc.bool(inv.known_version)?;
    if let Some(payload) = inv.invalidation.payload() {
        enc.str("payload")?;
        enc.bytes(payload)?;
    }
    Ok(())
}

fn encode_named_values(enc: &mut Enc<'_>, values: &[(String, i64)]) -> EncodeResult {
    enc.map(values.len() as u64)?;
    for (name, value) in values {
        enc.str(name)?;
        enc.i64(*value)?;
    }
    Ok(())
}

fn op_kind_str(kind: RegOpKind) -> &'static str {
    match kind {
        RegOpKind::Register => "R",
        RegOpKind::Unregister => "U",
    }
}

fn parse_op_kind(raw: &str) -> Option<RegOpKind> {
    match raw {
        "R" => Some(RegOpKind::Register),
        "U" => Some(RegOpKind::Unregister),
        _ => None,
    }
}

fn status_code_str(status: StatusCode) -> &'static str {
    match status {
        StatusCode::Success => "SUCCESS",
        StatusCode::TransientFailure => "TRANSIENT_FAILURE",
        StatusCode::PermanentFailure => "PERMANENT_FAILURE",
    }
}

fn parse_status_code(raw: &str) -> Option<StatusCode> {
    match raw {
        "SUCCESS" => Some(StatusCode::Success),
        "TRANSIENT_FAILURE" => Some(StatusCode::TransientFailure),
        "PERMANENT_FAILURE" => Some(StatusCode::PermanentFailure),
        _ => None,
    }
}

struct EnvelopeSpans {
    header: (usize, usize),
    body: (usize, usize),
}

fn decode_envelope(
    bytes: &[u8],
    expected_type: &'static str,
    limits: &ProtoLimits,
) -> Result<EnvelopeSpans, ProtoDecodeError> {
    if bytes.len() > limits.max_message_bytes {
        return Err(ProtoDecodeError::DecodeLimit("max_message_bytes"));
    }
    let mut dec = Decoder::new(bytes);
    let len = decode_map_len(&mut dec, limits)?;
    let mut version = None;
    let mut msg_type = None;
    let mut header_span = None;
    let mut body_span = None;
    for _ in 0..len {
        match decode_text(&mut dec, limits)? {
            "v" => version = Some(dec.u32()?),
            "type" => {
                let raw = decode_text(&mut dec, limits)?;
                if raw != TYPE_CLIENT && raw != TYPE_SERVER {
                    return Err(ProtoDecodeError::UnknownMessageType(raw.to_string()));
                }
                msg_type = Some(raw.to_string());
            }
            "header" => header_span = Some(skip_span(&mut dec)?),
            "body" => body_span = Some(skip_span(&mut dec)?),
            _ => {
                reject_indefinite(&dec)?;
                dec.skip()?;
            }
        }
    }
    if dec.datatype().is_ok() {
        return Err(ProtoDecodeError::TrailingBytes);
    }
    let version = version.ok_or(ProtoDecodeError::MissingField("v"))?;
    if version != PROTOCOL_VERSION {
        return Err(ProtoDecodeError::InvalidField {
            field: "v",
            reason: format!("unsupported protocol version {version}"),
        });
    }
    let msg_type = msg_type.ok_or(ProtoDecodeError::MissingField("type"))?;
    if msg_type != expected_type {
        return Err(ProtoDecodeError::InvalidField {
            field: "type",
            reason: format!("expected {expected_type}, got {msg_type}"),
        });
    }
    Ok(EnvelopeSpans {
        header: header_span.ok_or(ProtoDecodeError::MissingField("header"))?,
        body: body_span.ok_or(ProtoDecodeError::MissingField("body"))?,
    })
}

pub fn decode_server_message(
    bytes: &[u8],
    limits: &ProtoLimits,
) -> Result<ServerMessage, ProtoDecodeError> {
    let spans = decode_envelope(bytes, TYPE_SERVER, limits)?;
    let header = decode_server_header(&bytes[spans.header.0..spans.header.1], limits)?;
    let mut msg = decode_server_body(&bytes[spans.body.0..spans.body.1], limits)?;
    msg.header = header;
    Ok(msg)
}

pub fn decode_client_message(
    bytes: &[u8],
    limits: &ProtoLimits,
) -> Result<ClientMessage, ProtoDecodeError> {
    let spans = decode_envelope(bytes, TYPE_CLIENT, limits)?;
    let header = decode_client_header(&bytes[spans.header.0..spans.header.1], limits)?;
    decode_client_body(&bytes[spans.body.0..spans.body.1], header, limits)
}

fn decode_client_header(
    bytes: &[u8],
    limits: &ProtoLimits,
) -> Result<ClientHeader, ProtoDecodeError> {
    let mut dec = Decoder::new(bytes);
    let len = decode_map_len(&mut dec, limits)?;
    let mut client_type = None;
    let mut client_token = None;
    let mut summary = None;
    let mut client_time_ms = None;
    let mut message_id = None;
    let mut max_server_time_ms = None;
    let mut message_id_debug = None;
    for _ in 0..len {
        match decode_text(&mut dec, limits)? {
            "client_type" => client_type = Some(dec.i32()?),
            "token" => client_token = Some(decode_token(&mut dec, limits, "token")?),
            "summary" => summary = Some(decode_summary(&mut dec, limits)?),
            "client_time_ms" => client_time_ms = Some(dec.u64()?),
            "message_id" => message_id = Some(dec.u64()?),
            "max_server_time_ms" => max_server_time_ms = Some(dec.u64()?),
            "debug_id" => message_id_debug = Some(decode_text(&mut dec, limits)?.to_string()),
            _ => {
                reject_indefinite(&dec)?;
                dec.skip()?;
            }
        }
    }
    Ok(ClientHeader {
        client_type: client_type.ok_or(ProtoDecodeError::MissingField("client_type"))?,
        client_token,
        registration_summary: summary.ok_or(ProtoDecodeError::MissingField("summary"))?,
        client_time_ms: client_time_ms.ok_or(ProtoDecodeError::MissingField("client_time_ms"))?,
        message_id: message_id.ok_or(ProtoDecodeError::MissingField("message_id"))?,
        max_known_server_time_ms: max_server_time_ms
            .ok_or(ProtoDecodeError::MissingField("max_server_time_ms"))?,
        message_id_debug,
    })
}

fn decode_client_body(
    bytes: &[u8],
    header: ClientHeader,
    limits: &ProtoLimits,
) -> Result<ClientMessage, ProtoDecodeError> {
    let mut dec = Decoder::new(bytes);
    let len = decode_map_len(&mut dec, limits)?;
    let mut msg = ClientMessage::header_only(header);
    for _ in 0..len {
        match decode_text(&mut dec, limits)? {
            "initialize" => {
                let init_len = decode_map_len(&mut dec, limits)?;
                let mut nonce = None;
                let mut client_type = None;
                let mut client_name = None;
                for _ in 0..init_len {
                    match decode_text(&mut dec, limits)? {
                        "nonce" => {
                            let raw = decode_blob(&mut dec, limits)?;
                            nonce = Some(Nonce::from_bytes(&raw).map_err(|err| {
                                ProtoDecodeError::InvalidField {
                                    field: "nonce",
                                    reason: err.to_string(),
                                }
                            })?);
                        }
                        "client_type" => client_type = Some(dec.i32()?),
                        "client_name" => client_name = Some(decode_blob(&mut dec, limits)?),
                        _ => {
                            reject_indefinite(&dec)?;
                            dec.skip()?;
                        }
                    }
                }
                msg.initialize = Some(InitializeMessage {
                    nonce: nonce.ok_or(ProtoDecodeError::MissingField("nonce"))?,
                    application_client_id: ApplicationClientId {
                        client_type: client_type
                            .ok_or(ProtoDecodeError::MissingField("client_type"))?,
                        client_name: client_name
                            .ok_or(ProtoDecodeError::MissingField("client_name"))?,
                    },
                });
            }
            "registrations" => {
                let count = decode_array_len(&mut dec, limits)?;
                for _ in 0..count {
                    msg.registrations.push(decode_registration_op(&mut dec, limits)?);
                }
            }
            "sync" => {
                let count = decode_array_len(&mut dec, limits)?;
                for _ in 0..count {
                    let sub_len = decode_map_len(&mut dec, limits)?;
                    let mut objects = Vec::new();
                    for _ in 0..sub_len {
                        match decode_text(&mut dec, limits)? {
                            "objects" => {
                                let obj_count = decode_array_len(&mut dec, limits)?;
                                for _ in 0..obj_count {
                                    objects.push(decode_object_id(&mut dec, limits)?);
                                }
                            }
                            _ => {
                                reject_indefinite(&dec)?;
                                dec.skip()?;
                            }
                        }
                    }
                    msg.sync_subtrees.push(RegistrationSubtree { objects });
                }
            }
            "acks" => {
                let count = decode_array_len(&mut dec, limits)?;
                for _ in 0..count {
                    msg.invalidation_acks
                        .push(decode_wire_invalidation(&mut dec, limits)?);
                }
            }
            "info" => {
                let info_len = decode_map_len(&mut dec, limits)?;
                let mut info = InfoMessage::default();
                for _ in 0..info_len {
                    match decode_text(&mut dec, limits)? {
                        "counters" => {
                            info.performance_counters = decode_named_values(&mut dec, limits)?;
                        }
                        "config" => info.config_params = decode_named_values(&mut dec, limits)?,
                        _ => {
                            reject_indefinite(&dec)?;
                            dec.skip()?;
                        }
                    }
                }
                msg.info = Some(info);
            }
            _ => {
                reject_indefinite(&dec)?;
                dec.skip()?;
            }
        }
    }
    if dec.datatype().is_ok() {
        return Err(ProtoDecodeError::TrailingBytes);
    }
    Ok(msg)
}

fn decode_server_header(
    bytes: &[u8],
    limits: &ProtoLimits,
) -> Result<ServerHeader, ProtoDecodeError> {
    let mut dec = Decoder::new(bytes);
    let len = decode_map_len(&mut dec, limits)?;
    let mut header = ServerHeader::default();
    let mut server_time = None;
    for _ in 0..len {
        match decode_text(&mut dec, limits)? {
            "token" => header.client_token = Some(decode_token(&mut dec, limits, "token")?),
            "summary" => header.registration_summary = Some(decode_summary(&mut dec, limits)?),
            "server_time_ms" => server_time = Some(dec.u64()?),
            "heartbeat_interval_ms" => header.next_heartbeat_interval_ms = Some(dec.u64()?),
            "poll_interval_ms" => header.next_poll_interval_ms = Some(dec.u64()?),
            _ => {
                reject_indefinite(&dec)?;
                dec.skip()?;
            }
        }
    }
    header.server_time_ms =
        server_time.ok_or(ProtoDecodeError::MissingField("server_time_ms"))?;
    Ok(header)
}

fn decode_server_body(
    bytes: &[u8],
    limits: &ProtoLimits,
) -> Result<ServerMessage, ProtoDecodeError> {
    let mut dec = Decoder::new(bytes);
    let len = decode_map_len(&mut dec, limits)?;
    let mut msg = ServerMessage::default();
    for _ in 0..len {
        match decode_text(&mut dec, limits)? {
            "token_control" => {
                let tc_len = decode_map_len(&mut dec, limits)?;
                let mut new_token = None;
                let mut nonce = None;
                let mut status = None;
                for _ in 0..tc_len {
                    match decode_text(&mut dec, limits)? {
                        "new_token" => {
                            new_token = Some(decode_token(&mut dec, limits, "new_token")?);
                        }
                        "nonce" => {
                            let raw = decode_blob(&mut dec, limits)?;
                            nonce = Some(Nonce::from_bytes(&raw).map_err(|err| {
                                ProtoDecodeError::InvalidField {
                                    field: "nonce",
                                    reason: err.to_string(),
                                }
                            })?);
                        }
                        "status" => {
                            let raw = decode_text(&mut dec, limits)?;
                            status = Some(TokenStatus::parse(raw).ok_or_else(|| {
                                ProtoDecodeError::InvalidField {
                                    field: "status",
                                    reason: format!("unknown token status {raw}"),
                                }
                            })?);
                        }
                        _ => {
                            reject_indefinite(&dec)?;
                            dec.skip()?;
                        }
                    }
                }
                msg.token_control = Some(TokenControl {
                    new_token,
                    nonce,
                    status: status.ok_or(ProtoDecodeError::MissingField("status"))?,
                });
            }
            "invalidations" => {
                let inv_len = decode_map_len(&mut dec, limits)?;
                let mut section = InvalidationSection::default();
                for _ in 0..inv_len {
                    match decode_text(&mut dec, limits)? {
                        "all" => section.invalidate_all = dec.bool()?,
                        "list" => {
                            let count = decode_array_len(&mut dec, limits)?;
                            for _ in 0..count {
                                section
                                    .invalidations
                                    .push(decode_wire_invalidation(&mut dec, limits)?);
                            }
                        }
                        _ => {
                            reject_indefinite(&dec)?;
                            dec.skip()?;
                        }
                    }
                }
                msg.invalidations = Some(section);
            }
            "reg_statuses" => {
                let count = decode_array_len(&mut dec, limits)?;
                for _ in 0..count {
                    let st_len = decode_map_len(&mut dec, limits)?;
                    let mut object = None;
                    let mut kind = None;
                    let mut status = None;
                    let mut description = None;
                    for _ in 0..st_len {
                        match decode_text(&mut dec, limits)? {
                            "object" => object = Some(decode_object_id(&mut dec, limits)?),
                            "op" => {
                                let raw = decode_text(&mut dec, limits)?;
                                kind = Some(parse_op_kind(raw).ok_or_else(|| {
                                    ProtoDecodeError::InvalidField {
                                        field: "op",
                                        reason: format!("unknown op {raw}"),
                                    }
                                })?);
                            }
                            "status" => {
                                let raw = decode_text(&mut dec, limits)?;
                                status = Some(parse_status_code(raw).ok_or_else(|| {
                                    ProtoDecodeError::InvalidField {
                                        field: "status",
                                        reason: format!("unknown status {raw}"),
                                    }
                                })?);
                            }
                            "description" => {
                                description = Some(decode_text(&mut dec, limits)?.to_string());
                            }
                            _ => {
                                reject_indefinite(&dec)?;
                                dec.skip()?;
                            }
                        }
                    }
                    msg.registration_statuses.push(RegistrationStatus {
                        op: RegistrationOp {
                            object: object.ok_or(ProtoDecodeError::MissingField("object"))?,
                            kind: kind.ok_or(ProtoDecodeError::MissingField("op"))?,
                        },
                        status: status.ok_or(ProtoDecodeError::MissingField("status"))?,
                        description,
                    });
                }
            }
            "sync_request" => msg.sync_request = dec.bool()?,
            "info_request" => {
                let count = decode_array_len(&mut dec, limits)?;
                for _ in 0..count {
                    // Unknown info types are ignored for forward compatibility.
                    if decode_text(&mut dec, limits)? == "PERFORMANCE_COUNTERS" {
                        msg.info_request.push(InfoType::PerformanceCounters);
                    }
                }
            }
            "error" => {
                let err_len = decode_map_len(&mut dec, limits)?;
                let mut code = None;
                let mut description = None;
                for _ in 0..err_len {
                    match decode_text(&mut dec, limits)? {
                        "code" => {
                            let raw = decode_text(&mut dec, limits)?;
                            code = Some(ServerErrorCode::parse(raw).ok_or_else(|| {
                                ProtoDecodeError::InvalidField {
                                    field: "code",
                                    reason: format!("unknown error code {raw}"),
                                }
                            })?);
                        }
                        "description" => {
                            description = Some(decode_text(&mut dec, limits)?.to_string());
                        }
                        _ => {
                            reject_indefinite(&dec)?;
                            dec.skip()?;
                        }
                    }
                }
                msg.error = Some(ServerError {
                    code: code.ok_or(ProtoDecodeError::MissingField("code"))?,
                    description: description.unwrap_or_default(),
                });
            }
            _ => {
                reject_indefinite(&dec)?;
                dec.skip()?;
            }
        }
    }
    if dec.datatype().is_ok() {
        return Err(ProtoDecodeError::TrailingBytes);
    }
    Ok(msg)
}

fn decode_registration_op(
    dec: &mut Decoder<'_>,
    limits: &ProtoLimits,
) -> Result<RegistrationOp, ProtoDecodeError> {
    let len = decode_map_len(dec, limits)?;
    let mut object = None;
    let mut kind = None;
    for _ in 0..len {
        match decode_text(dec, limits)? {
            "object" => object = Some(decode_object_id(dec, limits)?),
            "op" => {
                let raw = decode_text(dec, limits)?;
                kind = Some(
                    parse_op_kind(raw).ok_or_else(|| ProtoDecodeError::InvalidField {
                        field: "op",
                        reason: format!("unknown op {raw}"),
                    })?,
                );
            }
            _ => {
                reject_indefinite(dec)?;
                dec.skip()?;
            }
        }
    }
    Ok(RegistrationOp {
        object: object.ok_or(ProtoDecodeError::MissingField("object"))?,
        kind: kind.ok_or(ProtoDecodeError::MissingField("op"))?,
    })
}

fn decode_object_id(
    dec: &mut Decoder<'_>,
    limits: &ProtoLimits,
) -> Result<ObjectId, ProtoDecodeError> {
    let len = decode_map_len(dec, limits)?;
    let mut source = None;
    let mut name = None;
    for _ in 0..len {
        match decode_text(dec, limits)? {
            "source" => source = Some(dec.i32()?),
            "name" => name = Some(decode_blob(dec, limits)?),
            _ => {
                reject_indefinite(dec)?;
                dec.skip()?;
            }
        }
    }
    Ok(ObjectId::from_wire(
        source.ok_or(ProtoDecodeError::MissingField("source"))?,
        name.ok_or(ProtoDecodeError::MissingField("name"))?,
    ))
}

fn decode_summary(
    dec: &mut Decoder<'_>,
    limits: &ProtoLimits,
) -> Result<RegistrationSummary, ProtoDecodeError> {
    let len = decode_map_len(dec, limits)?;
    let mut num = None;
    let mut digest = None;
    for _ in 0..len {
        match decode_text(dec, limits)? {
            "num" => num = Some(dec.u32()?),
            "digest" => {
                let raw = decode_blob(dec, limits)?;
                let arr: [u8; SUMMARY_DIGEST_LEN] =
                    raw.as_ref()
                        .try_into()
                        .map_err(|_| ProtoDecodeError::InvalidField {
                            field: "digest",
                            reason: format!("expected {SUMMARY_DIGEST_LEN} bytes, got {}", raw.len()),
                        })?;
                digest = Some(arr);
            }
            _ => {
                reject_indefinite(dec)?;
                dec.skip()?;
            }
        }
    }
    Ok(RegistrationSummary::from_wire(
        num.ok_or(ProtoDecodeError::MissingField("num"))?,
        digest.ok_or(ProtoDecodeError::MissingField("digest"))?,
    ))
}

fn decode_wire_invalidation(
    dec: &mut Decoder<'_>,
    limits: &ProtoLimits,
) -> Result<WireInvalidation, ProtoDecodeError> {
    let len = decode_map_len(dec, limits)?;
    let mut object = None;
    let mut version = None;
    let mut known_version = true;
    let mut payload = None;
    for _ in 0..len {
        match decode_text(dec, limits)? {
            "object" => object = Some(decode_object_id(dec, limits)?),
            "version" => version = Some(dec.i64()?),
            "known" => known_version = dec.bool()?,
            "payload" => payload = Some(decode_blob(dec, limits)?),
            _ => {
                reject_indefinite(dec)?;
                dec.skip()?;
            }
        }
    }
    Ok(WireInvalidation {
        invalidation: Invalidation::from_wire(
            object.ok_or(ProtoDecodeError::MissingField("object"))?,
            version.ok_or(ProtoDecodeError::MissingField("version"))?,
            payload,
        ),
        known_version,
    })
}

fn decode_named_values(
    dec: &mut Decoder<'_>,
    limits: &ProtoLimits,
) -> Result<Vec<(String, i64)>, ProtoDecodeError> {
    let len = decode_map_len(dec, limits)?;
    let mut out = Vec::with_capacity(len as usize);
    for _ in 0..len {
        let name = decode_text(dec, limits)?.to_string();
        let value = dec.i64()?;
        out.push((name, value));
    }
    Ok(out)
}

fn decode_map_len(dec: &mut Decoder<'_>, limits: &ProtoLimits) -> Result<u64, ProtoDecodeError> {
    match dec.map()? {
        Some(len) if len <= limits.max_collection_len as u64 => Ok(len),
        Some(_) => Err(ProtoDecodeError::DecodeLimit("max_collection_len")),
        None => Err(ProtoDecodeError::IndefiniteLength),
    }
}

fn decode_array_len(dec: &mut Decoder<'_>, limits: &ProtoLimits) -> Result<u64, ProtoDecodeError> {
    match dec.array()? {
        Some(len) if len <= limits.max_collection_len as u64 => Ok(len),
        Some(_) => Err(ProtoDecodeError::DecodeLimit("max_collection_len")),
        None => Err(ProtoDecodeError::IndefiniteLength),
    }
}

fn decode_text<'b>(
    dec: &mut Decoder<'b>,
    limits: &ProtoLimits,
) -> Result<&'b str, ProtoDecodeError> {
    reject_indefinite(dec)?;
    let text = dec.str()?;
    if text.len() > limits.max_text_bytes {
        return Err(ProtoDecodeError::DecodeLimit("max_text_bytes"));
    }
    Ok(text)
}

fn decode_blob(dec: &mut Decoder<'_>, limits: &ProtoLimits) -> Result<Bytes, ProtoDecodeError> {
    reject_indefinite(dec)?;
    let raw = dec.bytes()?;
    if raw.len() > limits.max_blob_bytes {
        return Err(ProtoDecodeError::DecodeLimit("max_blob_bytes"));
    }
    Ok(Bytes::copy_from_slice(raw))
}

fn decode_token(
    dec: &mut Decoder<'_>,
    limits: &ProtoLimits,
    field: &'static str,
) -> Result<ClientToken, ProtoDecodeError> {
    let raw = decode_blob(dec, limits)?;
    if raw.is_empty() {
        return Err(ProtoDecodeError::InvalidField {
            field,
            reason: "empty token".to_string(),
        });
    }
    Ok(ClientToken::from_wire(raw))
}

fn reject_indefinite(dec: &Decoder<'_>) -> Result<(), ProtoDecodeError> {
    match dec.datatype()? {
        Type::MapIndef | Type::ArrayIndef | Type::BytesIndef | Type::StringIndef => {
            Err(ProtoDecodeError::IndefiniteLength)
        }
        _ => Ok(()),
    }
}

fn skip_span(dec: &mut Decoder<'_>) -> Result<(usize, usize), ProtoDecodeError> {
    reject_indefinite(dec)?;
    let start = dec.position();
    dec.skip()?;
    Ok((start, dec.position()))
}
