// ABOUTME: Keyed storage for per-identity request windows and token budgets
// ABOUTME: DashMap-backed default with lazy purge of idle identities
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use super::IdentityKey;
use crate::constants::rate_limits;

/// Limiter counters for one identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterState {
    /// Start of the open request window
    pub window_start: Instant,
    /// Requests admitted in the open window
    pub request_count: u32,
    /// Ceiling fixed when the open window started
    pub window_ceiling: u32,
    /// Start of the open token budget window
    pub budget_start: Instant,
    /// Tokens reported in the open budget window
    pub tokens_used: u64,
    /// Last time the entry was touched
    pub last_seen: Instant,
}

impl LimiterState {
    /// Fresh state with both windows opening at `now`
    #[must_use]
    pub const fn new(now: Instant, window_ceiling: u32) -> Self {
        Self {
            window_start: now,
            request_count: 0,
            window_ceiling,
            budget_start: now,
            tokens_used: 0,
            last_seen: now,
        }
    }
}

/// Concurrent keyed store of [`LimiterState`] with expiry
pub trait LimiterStore: Send + Sync {
    /// Apply `update` to the entry for `key`, inserting `init` first if absent.
    /// The update is atomic with respect to other calls on the same key.
    fn update(
        &self,
        key: &IdentityKey,
        init: LimiterState,
        update: &mut dyn FnMut(&mut LimiterState),
    );

    /// Snapshot of an entry
    fn get(&self, key: &IdentityKey) -> Option<LimiterState>;

    /// Drop entries untouched for at least `idle_for`; returns how many went
    fn purge_idle(&self, now: Instant, idle_for: Duration) -> usize;

    /// Number of tracked identities
    fn len(&self) -> usize;

    /// True when no identity is tracked
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `DashMap`-backed store; purges idle entries once the map outgrows a threshold
#[derive(Debug)]
pub struct DashMapLimiterStore {
    entries: DashMap<IdentityKey, LimiterState>,
    cleanup_threshold: usize,
    idle_for: Duration,
}

impl DashMapLimiterStore {
    /// Store that purges entries idle for `idle_for` once it holds more than
    /// `cleanup_threshold` identities
    #[must_use]
    pub fn new(cleanup_threshold: usize, idle_for: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            cleanup_threshold,
            idle_for,
        }
    }

    /// Store with the default cleanup threshold
    #[must_use]
    pub fn with_idle_timeout(idle_for: Duration) -> Self {
        Self::new(rate_limits::DEFAULT_CLEANUP_THRESHOLD, idle_for)
    }
}

impl LimiterStore for DashMapLimiterStore {
    fn update(
        &self,
        key: &IdentityKey,
        init: LimiterState,
        update: &mut dyn FnMut(&mut LimiterState),
    ) {
        let now = init.last_seen;
        {
            let mut entry = self.entries.entry(key.clone()).or_insert(init);
            update(entry.value_mut());
            entry.last_seen = now;
        }

        // Shard guard released above; purge off the hot path only when growing
        if self.entries.len() > self.cleanup_threshold {
            let removed = self.purge_idle(now, self.idle_for);
            debug!(removed, remaining = self.entries.len(), "Purged idle limiter entries");
        }
    }

    fn get(&self, key: &IdentityKey) -> Option<LimiterState> {
        self.entries.get(key).map(|entry| *entry.value())
    }

    fn purge_idle(&self, now: Instant, idle_for: Duration) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, state| now.saturating_duration_since(state.last_seen) < idle_for);
        before.saturating_sub(self.entries.len())
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}
