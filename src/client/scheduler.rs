//! Smeared operation scheduling over an injected clock.

use std::collections::BTreeMap;

use super::smear::Smearer;

/// Engine operations with scheduled fires.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum OpId {
    /// Flush pending outbound work as one message.
    Batcher,
    Heartbeat,
    Poll,
    /// Re-send the token request if no response arrived.
    InitRetry,
}

/// Maps operations to nominal periods and at most one pending fire each.
///
/// Scheduling an op that already has a pending fire coalesces to the
/// existing one. Nominal periods are smeared at scheduling time; a period
/// change applies from the next fire, never to the one already pending.
#[derive(Debug)]
pub struct OperationScheduler {
    smearer: Smearer,
    periods: BTreeMap<OpId, u64>,
    pending: BTreeMap<OpId, u64>,
}

impl OperationScheduler {
    pub fn new(smearer: Smearer) -> Self {
        Self {
            smearer,
            periods: BTreeMap::new(),
            pending: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, op: OpId, period_ms: u64) {
        self.periods.insert(op, period_ms);
    }

    /// Updates the nominal period. The currently pending fire (if any)
    /// keeps its deadline; the new period takes effect from the next
    /// scheduling.
    pub fn set_period(&mut self, op: OpId, period_ms: u64) {
        self.periods.insert(op, period_ms);
    }

    /// Ensures exactly one pending fire for `op`, `smear(period)` from now.
    pub fn schedule(&mut self, op: OpId, now_ms: u64) {
        let period = self.periods.get(&op).copied().unwrap_or(0);
        self.schedule_in(op, now_ms, period);
    }

    /// Like [`schedule`](Self::schedule) with an explicit nominal delay.
    pub fn schedule_in(&mut self, op: OpId, now_ms: u64, delay_ms: u64) {
        if self.pending.contains_key(&op) {
            return;
        }
        let fire_at = now_ms.saturating_add(self.smearer.smear(delay_ms));
        self.pending.insert(op, fire_at);
    }

    /// Pins a fire to an exact instant, replacing any pending fire. Used
    /// when an external constraint (the throttler) dictates the deadline.
    pub fn schedule_at(&mut self, op: OpId, fire_at_ms: u64) {
        self.pending.insert(op, fire_at_ms);
    }

    pub fn is_pending(&self, op: OpId) -> bool {
        self.pending.contains_key(&op)
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.pending.values().min().copied()
    }

    /// Removes and returns every op due at `now_ms`, ordered by deadline.
    pub fn pop_due(&mut self, now_ms: u64) -> Vec<OpId> {
        let mut due: Vec<(u64, OpId)> = self
            .pending
            .iter()
            .filter(|&(_, &at)| at <= now_ms)
            .map(|(&op, &at)| (at, op))
            .collect();
        due.sort();
        for &(_, op) in &due {
            self.pending.remove(&op);
        }
        due.into_iter().map(|(_, op)| op).collect()
    }

    pub fn cancel(&mut self, op: OpId) {
        self.pending.remove(&op);
    }

    pub fn cancel_all(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    fn scheduler() -> OperationScheduler {
        OperationScheduler::new(Smearer::new(0.2, StdRng::seed_from_u64(5)))
    }

    #[test]
    fn schedule_coalesces_duplicates() {
        let mut sched = scheduler();
        sched.register(OpId::Batcher, 500);
        sched.schedule(OpId::Batcher, 0);
        let first = sched.next_deadline().unwrap();
        sched.schedule(OpId::Batcher, 100);
        assert_eq!(sched.next_deadline(), Some(first));
        assert_eq!(sched.pop_due(first), vec![OpId::Batcher]);
        assert!(sched.next_deadline().is_none());
    }

    #[test]
    fn fires_are_smeared_around_the_period() {
        let mut sched = scheduler();
        sched.register(OpId::Heartbeat, 1_000);
        for _ in 0..50 {
            sched.schedule(OpId::Heartbeat, 0);
            let at = sched.next_deadline().unwrap();
            assert!((800..=1_200).contains(&at), "deadline {at}");
            sched.cancel(OpId::Heartbeat);
        }
    }

    #[test]
    fn period_change_spares_the_pending_fire() {
        let mut sched = scheduler();
        sched.register(OpId::Poll, 1_000);
        sched.schedule(OpId::Poll, 0);
        let pending = sched.next_deadline().unwrap();
        sched.set_period(OpId::Poll, 60_000);
        assert_eq!(sched.next_deadline(), Some(pending));
        sched.pop_due(pending);
        sched.schedule(OpId::Poll, pending);
        let next = sched.next_deadline().unwrap();
        assert!(next >= pending + 48_000, "next fire {next} not lengthened");
    }

    #[test]
    fn pop_due_returns_in_deadline_order() {
        let mut sched = scheduler();
        sched.schedule_at(OpId::Heartbeat, 300);
        sched.schedule_at(OpId::Batcher, 500);
        sched.schedule_at(OpId::Poll, 100);
        assert_eq!(
            sched.pop_due(500),
            vec![OpId::Poll, OpId::Heartbeat, OpId::Batcher]
        );
    }

    #[test]
    fn cancel_all_clears_pending() {
        let mut sched = scheduler();
        sched.schedule_at(OpId::Batcher, 10);
        sched.schedule_at(OpId::Poll, 20);
        sched.cancel_all();
        assert!(sched.next_deadline().is_none());
        assert!(sched.pop_due(u64::MAX).is_empty());
    }
}
