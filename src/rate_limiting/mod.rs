// ABOUTME: Admission control combining a request window, a token budget, and adaptive ceilings
// ABOUTME: Resolves caller identity to a stable limiter key with a shared anonymous bucket
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence

//! # Admission Controller
//!
//! Two independent limits are kept per identity:
//!
//! - **Request window**: at most `ceiling` admitted requests per fixed window.
//!   The ceiling of a window is fixed when the window opens, from the base
//!   ceiling and the degradation level published by the [`pressure`] monitor.
//! - **Token budget**: tokens reported by completed (or failed) turns are
//!   charged against a per-window capacity; once spent, admission is refused
//!   until the budget window rolls over.
//!
//! Window boundaries are derived from monotonic elapsed time
//! ([`tokio::time::Instant`]).

pub mod pressure;
pub mod store;

pub use pressure::{
    DegradationLevel, MemorySampler, PressureGauge, PressureMonitor, PressureThresholds,
    ProcMeminfoSampler,
};
pub use store::{DashMapLimiterStore, LimiterState, LimiterStore};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use crate::config::environment::RateLimitConfig;
use crate::constants::{limits, rate_limits};
use crate::errors::{AppError, AppResult};

/// Who is asking to be admitted
///
/// The identity scopes both limiter state and conversation ownership. No
/// owner id is ever empty, so the anonymous scope cannot be claimed by an
/// identified caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    /// Caller identified by an owner id
    Owner(String),
    /// Caller without an identity
    Anonymous,
}

impl Identity {
    /// Identity from an optional owner id; a missing or blank id is anonymous
    ///
    /// # Errors
    ///
    /// `InvalidInput` when the id is longer than
    /// [`limits::MAX_IDENTITY_CHARS`] characters.
    pub fn from_owner(owner_id: Option<&str>) -> AppResult<Self> {
        let Some(id) = owner_id.map(str::trim).filter(|id| !id.is_empty()) else {
            return Ok(Self::Anonymous);
        };
        if id.chars().count() > limits::MAX_IDENTITY_CHARS {
            return Err(AppError::invalid_input(format!(
                "Owner id exceeds {} characters",
                limits::MAX_IDENTITY_CHARS
            )));
        }
        Ok(Self::Owner(id.to_owned()))
    }

    /// Stable limiter key
    #[must_use]
    pub fn key(&self) -> IdentityKey {
        match self {
            Self::Owner(id) => IdentityKey::owner(id),
            Self::Anonymous => IdentityKey(rate_limits::ANONYMOUS_IDENTITY_KEY.to_owned()),
        }
    }

    /// Owner id used to scope conversations
    #[must_use]
    pub fn owner_id(&self) -> &str {
        match self {
            Self::Owner(id) => id,
            Self::Anonymous => limits::ANONYMOUS_OWNER_ID,
        }
    }
}

/// Key under which limiter state is stored
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey(String);

impl IdentityKey {
    /// Key for an owner id
    #[must_use]
    pub fn owner(id: &str) -> Self {
        Self(format!("owner:{id}"))
    }

    /// Key as a string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which limit refused a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitReason {
    /// Request ceiling reached for the open window
    RequestWindow,
    /// Token budget spent for the open budget window
    TokenBudget,
}

/// Result of [`AdmissionController::admit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AdmissionDecision {
    /// Whether the request may proceed
    pub allow: bool,
    /// Milliseconds until the refusing window rolls over; 0 when allowed
    pub retry_after_ms: u64,
    /// Set on refusal
    pub reason: Option<LimitReason>,
    /// Ceiling of the open request window
    pub limit: u32,
    /// Requests left in the open window after this one
    pub remaining: u32,
}

impl AdmissionDecision {
    const fn unlimited() -> Self {
        Self {
            allow: true,
            retry_after_ms: 0,
            reason: None,
            limit: u32::MAX,
            remaining: u32::MAX,
        }
    }

    /// Convert a refusal into the matching rate-limit error
    ///
    /// # Errors
    ///
    /// `RateLimitExceeded` for a full request window, `QuotaExceeded` for a
    /// spent token budget.
    pub fn into_result(self) -> AppResult<Self> {
        match (self.allow, self.reason) {
            (true, _) => Ok(self),
            (false, Some(LimitReason::TokenBudget)) => {
                Err(AppError::quota_exceeded(self.retry_after_ms))
            }
            (false, _) => Err(AppError::rate_limited(self.retry_after_ms)),
        }
    }
}

/// Milliseconds from `now` until `start + window`, at least 1
fn remaining_ms(start: Instant, window: Duration, now: Instant) -> u64 {
    let left = (start + window).saturating_duration_since(now);
    u64::try_from(left.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Advance `start` by whole windows so that `now` falls inside the window
fn roll_window(start: &mut Instant, window: Duration, now: Instant) -> bool {
    let elapsed = now.saturating_duration_since(*start);
    if window.is_zero() || elapsed < window {
        return false;
    }
    let whole = elapsed.as_nanos() / window.as_nanos();
    let advance = window.as_nanos() * whole;
    *start += Duration::from_nanos(u64::try_from(advance).unwrap_or(u64::MAX));
    true
}

/// Scale a base ceiling by a degradation factor, keeping at least one request
fn scaled_ceiling(base: u32, factor: f64) -> u32 {
    let scaled = (f64::from(base) * factor).floor();
    (scaled as u32).max(1)
}

/// Gates turns on request windows and token budgets
pub struct AdmissionController {
    config: RateLimitConfig,
    store: Arc<dyn LimiterStore>,
    gauge: Arc<PressureGauge>,
}

impl AdmissionController {
    /// Controller using the default `DashMap` store
    #[must_use]
    pub fn new(config: RateLimitConfig, gauge: Arc<PressureGauge>) -> Self {
        let idle_for = config.request_window().max(config.token_window());
        let store = Arc::new(DashMapLimiterStore::with_idle_timeout(idle_for));
        Self::with_store(config, store, gauge)
    }

    /// Controller over an explicit store
    #[must_use]
    pub fn with_store(
        config: RateLimitConfig,
        store: Arc<dyn LimiterStore>,
        gauge: Arc<PressureGauge>,
    ) -> Self {
        Self {
            config,
            store,
            gauge,
        }
    }

    /// Degradation level that new windows will use
    #[must_use]
    pub fn degradation(&self) -> DegradationLevel {
        self.gauge.level()
    }

    /// Limits in effect
    #[must_use]
    pub const fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Decide whether `identity` may start a request, counting it if so
    #[must_use]
    pub fn admit(&self, identity: &Identity) -> AdmissionDecision {
        if !self.config.enabled {
            return AdmissionDecision::unlimited();
        }

        let now = Instant::now();
        let key = identity.key();
        let request_window = self.config.request_window();
        let token_window = self.config.token_window();
        let budget = self.config.token_budget;
        let ceiling = scaled_ceiling(self.config.requests_per_window, self.gauge.level().factor());

        let mut decision = AdmissionDecision::unlimited();
        self.store.update(
            &key,
            LimiterState::new(now, ceiling),
            &mut |state: &mut LimiterState| {
                if roll_window(&mut state.window_start, request_window, now) {
                    state.request_count = 0;
                    state.window_ceiling = ceiling;
                }
                if roll_window(&mut state.budget_start, token_window, now) {
                    state.tokens_used = 0;
                }

                decision = if state.tokens_used >= budget {
                    AdmissionDecision {
                        allow: false,
                        retry_after_ms: remaining_ms(state.budget_start, token_window, now),
                        reason: Some(LimitReason::TokenBudget),
                        limit: state.window_ceiling,
                        remaining: state.window_ceiling.saturating_sub(state.request_count),
                    }
                } else if state.request_count >= state.window_ceiling {
                    AdmissionDecision {
                        allow: false,
                        retry_after_ms: remaining_ms(state.window_start, request_window, now),
                        reason: Some(LimitReason::RequestWindow),
                        limit: state.window_ceiling,
                        remaining: 0,
                    }
                } else {
                    state.request_count += 1;
                    AdmissionDecision {
                        allow: true,
                        retry_after_ms: 0,
                        reason: None,
                        limit: state.window_ceiling,
                        remaining: state.window_ceiling - state.request_count,
                    }
                };
            },
        );

        if !decision.allow {
            debug!(
                identity = %key,
                reason = ?decision.reason,
                retry_after_ms = decision.retry_after_ms,
                "Admission refused"
            );
        }
        decision
    }

    /// Give back the request slot taken by a matching [`admit`](Self::admit)
    /// when the request was rejected before doing any work
    pub fn release(&self, identity: &Identity) {
        if !self.config.enabled {
            return;
        }

        let now = Instant::now();
        let request_window = self.config.request_window();
        let ceiling = scaled_ceiling(self.config.requests_per_window, self.gauge.level().factor());

        self.store.update(
            &identity.key(),
            LimiterState::new(now, ceiling),
            &mut |state: &mut LimiterState| {
                if roll_window(&mut state.window_start, request_window, now) {
                    state.request_count = 0;
                    state.window_ceiling = ceiling;
                } else {
                    state.request_count = state.request_count.saturating_sub(1);
                }
            },
        );
    }

    /// Charge `tokens` against the identity's budget
    pub fn report(&self, identity: &Identity, tokens: u64) {
        if !self.config.enabled || tokens == 0 {
            return;
        }

        let now = Instant::now();
        let token_window = self.config.token_window();
        let ceiling = scaled_ceiling(self.config.requests_per_window, self.gauge.level().factor());

        self.store.update(
            &identity.key(),
            LimiterState::new(now, ceiling),
            &mut |state: &mut LimiterState| {
                if roll_window(&mut state.budget_start, token_window, now) {
                    state.tokens_used = 0;
                }
                state.tokens_used = state.tokens_used.saturating_add(tokens);
            },
        );
    }
}
