//! Registration operations and their server-reported outcomes.

use std::fmt;

use super::identity::ObjectId;

/// Direction of a registration change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RegOpKind {
    Register,
    Unregister,
}

impl RegOpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RegOpKind::Register => "register",
            RegOpKind::Unregister => "unregister",
        }
    }
}

/// One registration change for one object.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegistrationOp {
    pub object: ObjectId,
    pub kind: RegOpKind,
}

impl fmt::Debug for RegistrationOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:?})", self.kind.as_str(), self.object)
    }
}

/// Registration state reported to the application listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegistrationState {
    Registered,
    Unregistered,
}

/// Server verdict on one registration op.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusCode {
    Success,
    TransientFailure,
    PermanentFailure,
}

impl StatusCode {
    pub fn is_success(self) -> bool {
        matches!(self, StatusCode::Success)
    }

    pub fn is_transient(self) -> bool {
        matches!(self, StatusCode::TransientFailure)
    }
}

/// A group of objects re-announced to the server during registration sync.
/// The current protocol always syncs the whole desired set as one subtree.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct RegistrationSubtree {
    pub objects: Vec<ObjectId>,
}
