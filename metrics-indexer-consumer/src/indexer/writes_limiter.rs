//! Fixed-window limits on how many new strings may be created
//!
//! Protects the backend from floods of never-seen strings. Quotas apply per
//! organization and, optionally, globally; a string is admitted only when
//! every quota has room.

use metrics_indexer_core::OrgId;
use parking_lot::Mutex;
use std::collections::HashMap;

use super::{FetchTypeExt, OrgStrings};
use crate::config::{WriteQuota, WritesLimiterConfig};

#[derive(Debug, Default, Clone, Copy)]
struct WindowCount {
    window: u64,
    count: u64,
}

impl WindowCount {
    fn used(&self, window: u64) -> u64 {
        if self.window == window {
            self.count
        } else {
            0
        }
    }

    fn add(&mut self, window: u64) {
        if self.window != window {
            self.window = window;
            self.count = 0;
        }
        self.count += 1;
    }

    fn remove(&mut self, window: u64, count: u64) {
        if self.window == window {
            self.count = self.count.saturating_sub(count);
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    per_org: HashMap<(usize, OrgId), WindowCount>,
    global: HashMap<usize, WindowCount>,
}

/// Strings split into admitted and refused
#[derive(Debug, Default)]
pub struct WritesDecision {
    pub granted: OrgStrings,
    pub refused: Vec<(OrgId, String, FetchTypeExt)>,
    /// Time the quota was consumed at, for [`WritesLimiter::release`]
    pub checked_at: u64,
}

#[derive(Debug)]
pub struct WritesLimiter {
    per_org: Vec<WriteQuota>,
    global: Vec<WriteQuota>,
    counters: Mutex<Counters>,
}

impl WritesLimiter {
    pub fn new(config: &WritesLimiterConfig) -> Self {
        Self {
            per_org: config.per_org.clone(),
            global: config.global.clone(),
            counters: Mutex::new(Counters::default()),
        }
    }

    /// A limiter that admits everything
    pub fn disabled() -> Self {
        Self::new(&WritesLimiterConfig::default())
    }

    pub fn is_enabled(&self) -> bool {
        !self.per_org.is_empty() || !self.global.is_empty()
    }

    /// Admit new strings against the current wall-clock window
    pub fn check(&self, requested: &OrgStrings) -> WritesDecision {
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        self.check_at(requested, now)
    }

    /// Admit new strings as of `now` (unix seconds), consuming quota for each
    /// admitted one
    pub fn check_at(&self, requested: &OrgStrings, now: u64) -> WritesDecision {
        if !self.is_enabled() {
            return WritesDecision {
                granted: requested.clone(),
                refused: Vec::new(),
                checked_at: now,
            };
        }

        let mut decision = WritesDecision {
            checked_at: now,
            ..Default::default()
        };
        let mut counters = self.counters.lock();

        for (org_id, s) in requested.iter() {
            let org_full = self.per_org.iter().enumerate().any(|(i, quota)| {
                let window = now / quota.window_seconds;
                counters
                    .per_org
                    .get(&(i, org_id))
                    .map_or(0, |c| c.used(window))
                    >= quota.limit
            });
            let global_full = !org_full
                && self.global.iter().enumerate().any(|(i, quota)| {
                    let window = now / quota.window_seconds;
                    counters.global.get(&i).map_or(0, |c| c.used(window)) >= quota.limit
                });

            if org_full || global_full {
                decision.refused.push((
                    org_id,
                    s.to_string(),
                    FetchTypeExt {
                        is_global: global_full,
                    },
                ));
                continue;
            }

            for (i, quota) in self.per_org.iter().enumerate() {
                counters
                    .per_org
                    .entry((i, org_id))
                    .or_default()
                    .add(now / quota.window_seconds);
            }
            for (i, quota) in self.global.iter().enumerate() {
                counters
                    .global
                    .entry(i)
                    .or_default()
                    .add(now / quota.window_seconds);
            }
            decision.granted.insert(org_id, s);
        }

        decision
    }

    /// Return quota for `count` granted strings of `org_id` that were never
    /// written. Quota from a window that has already rolled over is not
    /// returned.
    pub fn release(&self, decision: &WritesDecision, org_id: OrgId, count: u64) {
        if !self.is_enabled() || count == 0 {
            return;
        }

        let now = decision.checked_at;
        let mut counters = self.counters.lock();
        for (i, quota) in self.per_org.iter().enumerate() {
            if let Some(c) = counters.per_org.get_mut(&(i, org_id)) {
                c.remove(now / quota.window_seconds, count);
            }
        }
        for (i, quota) in self.global.iter().enumerate() {
            if let Some(c) = counters.global.get_mut(&i) {
                c.remove(now / quota.window_seconds, count);
            }
        }
    }
}
