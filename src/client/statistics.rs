//! Performance counters reported in info messages.

/// Monotonic counters over the engine's lifetime. Snapshots travel to the
/// server when it asks for performance counters and are readable by the
/// host for its own telemetry.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Statistics {
    pub sent_messages: u64,
    pub sent_initialize: u64,
    pub sent_registrations: u64,
    pub sent_acks: u64,
    pub sent_heartbeats: u64,
    pub received_messages: u64,
    pub received_invalidations: u64,
    pub received_reg_statuses: u64,
    pub incoming_dropped: u64,
    pub token_mismatches: u64,
    pub throttled_sends: u64,
    pub persist_write_failures: u64,
}

impl Statistics {
    pub fn counter_pairs(&self) -> Vec<(&'static str, i64)> {
        vec![
            ("sent_messages", self.sent_messages as i64),
            ("sent_initialize", self.sent_initialize as i64),
            ("sent_registrations", self.sent_registrations as i64),
            ("sent_acks", self.sent_acks as i64),
            ("sent_heartbeats", self.sent_heartbeats as i64),
            ("received_messages", self.received_messages as i64),
            ("received_invalidations", self.received_invalidations as i64),
            ("received_reg_statuses", self.received_reg_statuses as i64),
            ("incoming_dropped", self.incoming_dropped as i64),
            ("token_mismatches", self.token_mismatches as i64),
            ("throttled_sends", self.throttled_sends as i64),
            ("persist_write_failures", self.persist_write_failures as i64),
        ]
    }
}
