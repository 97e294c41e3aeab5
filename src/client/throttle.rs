//! Outbound send rate limiting.

use std::collections::VecDeque;

use crate::config::ThrottleRule;

/// Verdict for one send attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThrottleDecision {
    Allowed,
    /// Earliest instant at which a fire would satisfy every rule. Asking
    /// again before then returns the same instant, so a caller holding one
    /// pending timer can treat repeat asks as no-ops.
    DeferUntil(u64),
}

/// Sliding-window limiter over a set of rules.
///
/// Each rule keeps the timestamps of its last `max_count` allowed fires; a
/// fire passes a rule iff the oldest remembered fire has aged out of the
/// window. Only allowed fires are recorded, so deferred attempts never
/// push the window further out.
#[derive(Debug)]
pub struct RateLimiter {
    rules: Vec<RuleState>,
}

#[derive(Debug)]
struct RuleState {
    window_ms: u64,
    max_count: usize,
    recent: VecDeque<u64>,
}

impl RateLimiter {
    pub fn new(rules: &[ThrottleRule]) -> Self {
        Self {
            rules: rules
                .iter()
                .map(|rule| RuleState {
                    window_ms: rule.window_ms,
                    max_count: rule.max_count,
                    recent: VecDeque::with_capacity(rule.max_count),
                })
                .collect(),
        }
    }

    pub fn try_fire(&mut self, now_ms: u64) -> ThrottleDecision {
        let mut allowed_at = now_ms;
        for rule in &self.rules {
            if rule.recent.len() == rule.max_count
                && let Some(&oldest) = rule.recent.front()
            {
                let free_at = oldest.saturating_add(rule.window_ms);
                if free_at > now_ms {
                    allowed_at = allowed_at.max(free_at);
                }
            }
        }
        if allowed_at > now_ms {
            return ThrottleDecision::DeferUntil(allowed_at);
        }
        for rule in &mut self.rules {
            if rule.recent.len() == rule.max_count {
                rule.recent.pop_front();
            }
            rule.recent.push_back(now_ms);
        }
        ThrottleDecision::Allowed
    }
}
