//! Version invalidations delivered to the application.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use bytes::Bytes;

use super::error::{CoreError, InvalidVersion};
use super::identity::ObjectId;

/// A statement that an object's cached data is stale at every version up to
/// and including `version`.
///
/// Equality, ordering, and hashing consider only `(object, version)`; the
/// optional payload rides along for the application and does not participate
/// in identity, so an acked invalidation matches its delivery regardless of
/// payload bytes.
#[derive(Clone)]
pub struct Invalidation {
    object: ObjectId,
    version: i64,
    payload: Option<Bytes>,
}

impl Invalidation {
    pub fn new(object: ObjectId, version: i64) -> Result<Self, CoreError> {
        if version < 0 {
            return Err(InvalidVersion(version).into());
        }
        Ok(Self {
            object,
            version,
            payload: None,
        })
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub(crate) fn from_wire(object: ObjectId, version: i64, payload: Option<Bytes>) -> Self {
        Self {
            object,
            version,
            payload,
        }
    }

    pub fn object(&self) -> &ObjectId {
        &self.object
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    pub fn is_newer_than(&self, other: &Invalidation) -> bool {
        self.object == other.object && self.version > other.version
    }
}

impl PartialEq for Invalidation {
    fn eq(&self, other: &Self) -> bool {
        self.object == other.object && self.version == other.version
    }
}

impl Eq for Invalidation {}

impl PartialOrd for Invalidation {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Invalidation {
    fn cmp(&self, other: &Self) -> Ordering {
        (&self.object, self.version).cmp(&(&other.object, other.version))
    }
}

impl Hash for Invalidation {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.object.hash(state);
        self.version.hash(state);
    }
}

impl fmt::Debug for Invalidation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalidation({:?}, v{})", self.object, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oid(name: &'static [u8]) -> ObjectId {
        ObjectId::new(1, Bytes::from_static(name)).unwrap()
    }

    #[test]
    fn rejects_negative_version() {
        assert!(Invalidation::new(oid(b"x"), -1).is_err());
        assert!(Invalidation::new(oid(b"x"), 0).is_ok());
    }

    #[test]
    fn identity_ignores_payload() {
        let bare = Invalidation::new(oid(b"x"), 7).unwrap();
        let loaded = Invalidation::new(oid(b"x"), 7)
            .unwrap()
            .with_payload(&b"hello"[..]);
        assert_eq!(bare, loaded);
        assert_eq!(bare.cmp(&loaded), Ordering::Equal);
    }

    #[test]
    fn newer_than_requires_same_object() {
        let a7 = Invalidation::new(oid(b"a"), 7).unwrap();
        let a9 = Invalidation::new(oid(b"a"), 9).unwrap();
        let b9 = Invalidation::new(oid(b"b"), 9).unwrap();
        assert!(a9.is_newer_than(&a7));
        assert!(!a7.is_newer_than(&a9));
        assert!(!b9.is_newer_than(&a7));
    }
}
