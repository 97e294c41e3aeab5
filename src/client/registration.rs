//! Registration bookkeeping: desired set, pending ops, confirmed state.

use std::collections::{BTreeMap, BTreeSet};

use crate::core::{
    ObjectId, RegOpKind, RegistrationOp, RegistrationState, RegistrationSubtree,
    RegistrationSummary,
};

use super::proto::RegistrationStatus;

/// Listener-visible outcome of applying one server registration status.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistrationEvent {
    Confirmed {
        object: ObjectId,
        state: RegistrationState,
    },
    Failed {
        object: ObjectId,
        is_transient: bool,
        reason: String,
    },
}

/// Tracks what the application wants registered, which changes are still
/// unsent, and what the server has confirmed.
///
/// `pending_ops` is intent-based: at most one entry per object, and a new
/// op for an already-pending object overwrites the old one outright.
#[derive(Debug, Default)]
pub struct RegistrationManager {
    pending_ops: BTreeMap<ObjectId, RegOpKind>,
    desired: BTreeSet<ObjectId>,
    confirmed: BTreeSet<ObjectId>,
    /// Set when the server's summary disagreed with ours; cleared once a
    /// sync has been queued.
    summary_diverged: bool,
    sync_subtrees: Vec<RegistrationSubtree>,
}

impl RegistrationManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the latest intent for `object` and updates the desired set
    /// optimistically.
    pub fn enqueue(&mut self, object: ObjectId, kind: RegOpKind) {
        match kind {
            RegOpKind::Register => {
                self.desired.insert(object.clone());
            }
            RegOpKind::Unregister => {
                self.desired.remove(&object);
            }
        }
        self.pending_ops.insert(object, kind);
    }

    pub fn has_pending_ops(&self) -> bool {
        !self.pending_ops.is_empty()
    }

    pub fn has_pending_subtrees(&self) -> bool {
        !self.sync_subtrees.is_empty()
    }

    /// Removes and returns up to `max` pending ops. Order is not part of
    /// the contract; the server handles each op independently.
    pub fn drain_pending(&mut self, max: usize) -> Vec<RegistrationOp> {
        let mut ops = Vec::new();
        while ops.len() < max {
            match self.pending_ops.pop_first() {
                Some((object, kind)) => ops.push(RegistrationOp { object, kind }),
                None => break,
            }
        }
        ops
    }

    pub fn drain_subtrees(&mut self) -> Vec<RegistrationSubtree> {
        std::mem::take(&mut self.sync_subtrees)
    }

    /// Applies server verdicts, returning events the engine forwards to
    /// the listener.
    pub fn apply_statuses(&mut self, statuses: &[RegistrationStatus]) -> Vec<RegistrationEvent> {
        let mut events = Vec::with_capacity(statuses.len());
        for status in statuses {
            let object = &status.op.object;
            if status.status.is_success() {
                let wants_registered = self.desired.contains(object);
                // Stale confirmations for a flipped intent are ignored; the
                // flip is still pending and will supersede this verdict.
                match status.op.kind {
                    RegOpKind::Register if wants_registered => {
                        self.confirmed.insert(object.clone());
                        events.push(RegistrationEvent::Confirmed {
                            object: object.clone(),
                            state: RegistrationState::Registered,
                        });
                    }
                    RegOpKind::Unregister if !wants_registered => {
                        self.confirmed.remove(object);
                        events.push(RegistrationEvent::Confirmed {
                            object: object.clone(),
                            state: RegistrationState::Unregistered,
                        });
                    }
                    _ => {}
                }
            } else if status.status.is_transient() {
                // Retry with the next batch unless the application has
                // since changed its mind.
                if !self.pending_ops.contains_key(object) {
                    self.pending_ops.insert(object.clone(), status.op.kind);
                }
                events.push(RegistrationEvent::Failed {
                    object: object.clone(),
                    is_transient: true,
                    reason: status
                        .description
                        .clone()
                        .unwrap_or_else(|| "transient registration failure".to_string()),
                });
            } else {
                // Permanent: revert the optimistic desired-set update.
                match status.op.kind {
                    RegOpKind::Register => {
                        self.desired.remove(object);
                    }
                    RegOpKind::Unregister => {
                        self.desired.insert(object.clone());
                    }
                }
                self.pending_ops.remove(object);
                events.push(RegistrationEvent::Failed {
                    object: object.clone(),
                    is_transient: false,
                    reason: status
                        .description
                        .clone()
                        .unwrap_or_else(|| "permanent registration failure".to_string()),
                });
            }
        }
        events
    }

    /// Queues one subtree covering the whole desired set for the next send.
    pub fn apply_sync_request(&mut self) {
        self.sync_subtrees = vec![RegistrationSubtree {
            objects: self.desired.iter().cloned().collect(),
        }];
    }

    /// Compares the server's view against ours. A mismatch is remembered so
    /// the next outbound header carries a fresh summary.
    pub fn check_summary(&mut self, server_summary: &RegistrationSummary) -> bool {
        let diverged = *server_summary != self.confirmed_summary();
        if diverged {
            self.summary_diverged = true;
        }
        diverged
    }

    pub fn summary_diverged(&self) -> bool {
        self.summary_diverged
    }

    /// Called once a message carrying a fresh local summary has gone out.
    pub fn clear_summary_divergence(&mut self) {
        self.summary_diverged = false;
    }

    /// Summary of the application's desired set, carried on every outbound
    /// header.
    pub fn local_summary(&self) -> RegistrationSummary {
        RegistrationSummary::of(self.desired.iter())
    }

    /// Summary of the server-confirmed subset.
    pub fn confirmed_summary(&self) -> RegistrationSummary {
        RegistrationSummary::of(self.confirmed.iter())
    }

    pub fn is_desired(&self, object: &ObjectId) -> bool {
        self.desired.contains(object)
    }

    /// Server-side state is gone; the desired set survives so the host can
    /// re-drive it, but nothing counts as confirmed any more.
    pub fn reset_confirmed(&mut self) {
        self.confirmed.clear();
        self.sync_subtrees.clear();
        self.summary_diverged = false;
    }
}
