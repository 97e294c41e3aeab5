//! Commutative digest over a registration set.

use std::fmt;

use sha2::{Digest, Sha256};

use super::identity::ObjectId;

pub const SUMMARY_DIGEST_LEN: usize = 32;

/// Count plus order-independent digest of a registration set.
///
/// The digest XORs the SHA-256 of each object id's canonical encoding, so
/// any iteration order produces the same value; the server computes the same
/// digest over its view and a mismatch flags divergence. The empty set
/// digests to all zeroes.
#[derive(Clone, PartialEq, Eq)]
pub struct RegistrationSummary {
    num_registrations: u32,
    digest: [u8; SUMMARY_DIGEST_LEN],
}

impl RegistrationSummary {
    pub fn empty() -> Self {
        Self {
            num_registrations: 0,
            digest: [0u8; SUMMARY_DIGEST_LEN],
        }
    }

    pub fn of<'a>(objects: impl IntoIterator<Item = &'a ObjectId>) -> Self {
        let mut digest = [0u8; SUMMARY_DIGEST_LEN];
        let mut count = 0u32;
        for object in objects {
            let h = Sha256::digest(object.canonical_bytes());
            for (acc, byte) in digest.iter_mut().zip(h.iter()) {
                *acc ^= byte;
            }
            count += 1;
        }
        Self {
            num_registrations: count,
            digest,
        }
    }

    pub(crate) fn from_wire(num_registrations: u32, digest: [u8; SUMMARY_DIGEST_LEN]) -> Self {
        Self {
            num_registrations,
            digest,
        }
    }

    pub fn num_registrations(&self) -> u32 {
        self.num_registrations
    }

    pub fn digest(&self) -> &[u8; SUMMARY_DIGEST_LEN] {
        &self.digest
    }

    pub fn is_empty(&self) -> bool {
        self.num_registrations == 0
    }
}

impl fmt::Debug for RegistrationSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RegistrationSummary(n={}, ", self.num_registrations)?;
        for b in &self.digest[..4] {
            write!(f, "{b:02x}")?;
        }
        write!(f, "..)")
    }
}
