//! Identity atoms for the invalidation protocol.
//!
//! ObjectId: application object named by (source, name)
//! ClientToken: opaque server-issued session identity
//! Nonce: correlates a token request with its response

use std::fmt;

use bytes::Bytes;

use super::error::{CoreError, InvalidObject};

/// Object names above this are rejected at the API boundary.
pub const MAX_OBJECT_NAME_BYTES: usize = 4096;

/// Identifier of an application object: a source space plus an opaque name.
///
/// Names are chosen by the application and never interpreted here. The pair
/// is compared structurally and keys all registration state.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId {
    source: i32,
    name: Bytes,
}

impl ObjectId {
    pub fn new(source: i32, name: impl Into<Bytes>) -> Result<Self, CoreError> {
        let name = name.into();
        if name.is_empty() {
            return Err(InvalidObject::EmptyName.into());
        }
        if name.len() > MAX_OBJECT_NAME_BYTES {
            return Err(InvalidObject::NameTooLong {
                got: name.len(),
                max: MAX_OBJECT_NAME_BYTES,
            }
            .into());
        }
        Ok(Self { source, name })
    }

    /// Wire-decoded object ids bypass construction checks; the message
    /// validator owns semantic rejection of inbound data.
    pub(crate) fn from_wire(source: i32, name: Bytes) -> Self {
        Self { source, name }
    }

    pub fn source(&self) -> i32 {
        self.source
    }

    pub fn name(&self) -> &[u8] {
        &self.name
    }

    /// Canonical encoding fed to the registration summary digest:
    /// big-endian source, then the raw name bytes.
    pub(crate) fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.name.len());
        out.extend_from_slice(&self.source.to_be_bytes());
        out.extend_from_slice(&self.name);
        out
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({}, {})", self.source, DisplayBytes(&self.name))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.source, DisplayBytes(&self.name))
    }
}

/// Opaque server-issued bytes authenticating the client for one session.
/// Absence of a token means the client is unassigned.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ClientToken(Bytes);

impl ClientToken {
    pub fn new(bytes: impl Into<Bytes>) -> Result<Self, CoreError> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(CoreError::EmptyToken);
        }
        Ok(Self(bytes))
    }

    pub(crate) fn from_wire(bytes: Bytes) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for ClientToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientToken({})", DisplayBytes(&self.0))
    }
}

pub const NONCE_LEN: usize = 8;

/// Single-use client-generated value pairing a token-assignment response
/// with the request that asked for it.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Nonce([u8; NONCE_LEN]);

impl Nonce {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CoreError> {
        let arr: [u8; NONCE_LEN] =
            bytes
                .try_into()
                .map_err(|_| CoreError::BadNonceLength {
                    expected: NONCE_LEN,
                    got: bytes.len(),
                })?;
        Ok(Self(arr))
    }

    pub fn generate(rng: &mut impl rand::Rng) -> Self {
        let mut arr = [0u8; NONCE_LEN];
        rng.fill(&mut arr);
        Self(arr)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nonce({})", DisplayBytes(&self.0))
    }
}

/// Application-chosen identity sent while requesting a token. The client
/// type is assigned by the service operator; the name distinguishes
/// instances of one application.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ApplicationClientId {
    pub client_type: i32,
    pub client_name: Bytes,
}

impl ApplicationClientId {
    pub fn new(client_type: i32, client_name: impl Into<Bytes>) -> Self {
        Self {
            client_type,
            client_name: client_name.into(),
        }
    }
}

struct DisplayBytes<'a>(&'a [u8]);

impl fmt::Display for DisplayBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(self.0) {
            Ok(s) => write!(f, "{s:?}"),
            Err(_) => {
                write!(f, "0x")?;
                for b in self.0 {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
        }
    }
}
