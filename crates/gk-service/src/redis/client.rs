//! Sliding-window rate limiter over a shared Redis counter store.
//!
//! Answers "is this identifier over its quota in the current trailing
//! window" for every caller in the deployment, not just this process.
//!
//! # Connection Pattern
//!
//! The redis-rs `MultiplexedConnection` is designed to be cloned cheaply
//! and used concurrently. No locking is needed - just clone the connection
//! for each operation.
//!
//! # Usage
//!
//! ```rust,ignore
//! let limiter = RateLimiter::new("redis://localhost:6379").await?;
//!
//! let decision = limiter.check_rule(&VERIFY_SUBMIT_RULE, "198.51.100.7").await?;
//! if !decision.allowed {
//!     return Err(GkError::RateLimited);
//! }
//! ```

use crate::errors::GkError;
use crate::redis::lua_scripts;
use ::redis::aio::MultiplexedConnection;
use ::redis::{Client, Script};
use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, instrument, warn};

/// Rule: browser-facing verification submissions, per client ip.
pub const VERIFY_SUBMIT_RULE: RateLimitRule = RateLimitRule {
    scope: "submit",
    window_ms: 60_000,
    max_requests: 5,
};

/// Rule: verification page loads, per client ip.
pub const VERIFY_PAGE_RULE: RateLimitRule = RateLimitRule {
    scope: "page",
    window_ms: 60_000,
    max_requests: 10,
};

/// Rule: inbound membership-event webhook, per source ip.
pub const MEMBERSHIP_EVENTS_RULE: RateLimitRule = RateLimitRule {
    scope: "events",
    window_ms: 60_000,
    max_requests: 30,
};

/// Rule: administrative commands, per (member, command). The command
/// surface lives outside this service but shares the counter store, so the
/// rule is defined here with the others.
pub const ADMIN_COMMAND_RULE: RateLimitRule = RateLimitRule {
    scope: "command",
    window_ms: 60_000,
    max_requests: 10,
};

/// A named (scope, window, quota) configuration.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitRule {
    /// Key-prefix scope; distinct scopes never share counters.
    pub scope: &'static str,
    /// Trailing window length in milliseconds.
    pub window_ms: u64,
    /// Maximum events allowed inside one window.
    pub max_requests: u32,
}

impl RateLimitRule {
    /// Build the counter key for an identifier under this rule.
    #[must_use]
    pub fn key(&self, identifier: &str) -> String {
        format!("rl:{}:{}", self.scope, identifier)
    }
}

/// Outcome of a sliding-window check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether the event is within quota.
    pub allowed: bool,
    /// Requests left in the current window (0 when over quota).
    pub remaining: u32,
    /// When the window fully resets.
    pub reset_at: DateTime<Utc>,
}

/// Sliding-window rate limiter.
///
/// Cheaply cloneable - the underlying `MultiplexedConnection` is designed
/// for concurrent use without locking.
#[derive(Clone)]
pub struct RateLimiter {
    /// Redis client (kept for potential reconnection scenarios).
    #[allow(dead_code)]
    client: Client,
    /// Multiplexed connection (cheaply cloneable, designed for concurrent use).
    connection: MultiplexedConnection,
    /// Precompiled sliding-window script.
    window_script: Script,
    /// Per-process sequence for unique same-millisecond event members.
    sequence: Arc<AtomicU64>,
}

impl RateLimiter {
    /// Create a new rate limiter.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., `redis://localhost:6379`)
    ///
    /// # Errors
    ///
    /// Returns `GkError::Redis` if connection fails.
    pub async fn new(redis_url: &str) -> Result<Self, GkError> {
        let client = Client::open(redis_url).map_err(|e| {
            // Note: Do NOT log redis_url as it may contain credentials
            error!(
                target: "gk.redis.limiter",
                error = %e,
                "Failed to open Redis client"
            );
            GkError::Redis(format!("Failed to open Redis client: {e}"))
        })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                error!(
                    target: "gk.redis.limiter",
                    error = %e,
                    "Failed to connect to Redis"
                );
                GkError::Redis(format!("Failed to connect to Redis: {e}"))
            })?;

        Ok(Self {
            client,
            connection,
            window_script: Script::new(lua_scripts::SLIDING_WINDOW),
            sequence: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Run a sliding-window check for `identifier` under `rule`.
    ///
    /// The event is always recorded, allowed or not: an over-quota caller
    /// keeps pushing its own reset further out.
    ///
    /// # Errors
    ///
    /// Returns `GkError::Redis` on connection or script failure. Callers on
    /// availability-sensitive paths fail open (see the middleware).
    #[instrument(skip_all, fields(scope = rule.scope))]
    pub async fn check_rule(
        &self,
        rule: &RateLimitRule,
        identifier: &str,
    ) -> Result<RateLimitDecision, GkError> {
        self.check(&rule.key(identifier), rule.window_ms, rule.max_requests)
            .await
    }

    /// Liveness check against the counter store (readiness probe).
    ///
    /// # Errors
    ///
    /// Returns `GkError::Redis` if the store does not answer.
    pub async fn ping(&self) -> Result<(), GkError> {
        let mut conn = self.connection.clone();
        let pong: String = ::redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| GkError::Redis(format!("PING failed: {e}")))?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(GkError::Redis(format!("unexpected PING reply: {pong}")))
        }
    }

    /// Run a sliding-window check against an explicit key.
    ///
    /// # Errors
    ///
    /// Returns `GkError::Redis` on connection or script failure.
    pub async fn check(
        &self,
        key: &str,
        window_ms: u64,
        max_requests: u32,
    ) -> Result<RateLimitDecision, GkError> {
        // Clone the connection (cheap operation) for this request
        let mut conn = self.connection.clone();
        let now_ms = Utc::now().timestamp_millis();
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);

        let count: i64 = self
            .window_script
            .key(key)
            .arg(now_ms)
            .arg(window_ms)
            .arg(seq)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                warn!(
                    target: "gk.redis.limiter",
                    error = %e,
                    "Sliding-window check failed"
                );
                GkError::Redis(format!("Sliding-window check failed: {e}"))
            })?;

        let decision = decision_from_count(count, max_requests, now_ms, window_ms);

        if !decision.allowed {
            debug!(
                target: "gk.redis.limiter",
                count,
                max_requests,
                "Rate limit exceeded"
            );
        }

        Ok(decision)
    }
}

/// Turn a window count into a decision.
///
/// `allowed = count <= max_requests`: the current event is already part of
/// the count, so exactly `max_requests` events in a window are allowed.
fn decision_from_count(
    count: i64,
    max_requests: u32,
    now_ms: i64,
    window_ms: u64,
) -> RateLimitDecision {
    #[allow(clippy::cast_possible_wrap)] // window lengths are minutes-scale
    let reset_ms = now_ms + window_ms as i64;
    let reset_at = Utc
        .timestamp_millis_opt(reset_ms)
        .single()
        .unwrap_or_else(Utc::now);

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let remaining = if count >= i64::from(max_requests) {
        0
    } else {
        max_requests - count as u32
    };

    RateLimitDecision {
        allowed: count <= i64::from(max_requests),
        remaining,
        reset_at,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const NOW_MS: i64 = 1_700_000_000_000;
    const WINDOW_MS: u64 = 60_000;

    #[test]
    fn test_burst_of_n_plus_five_admits_exactly_n() {
        // Given max = N and a burst of N+5 events in one window, exactly N
        // are allowed and 5 are rejected (the count passed in is the
        // running window count including the current event).
        let max = 5_u32;
        let mut allowed = 0;
        let mut rejected = 0;

        for count in 1..=(i64::from(max) + 5) {
            let decision = decision_from_count(count, max, NOW_MS, WINDOW_MS);
            if decision.allowed {
                allowed += 1;
            } else {
                rejected += 1;
            }
        }

        assert_eq!(allowed, 5);
        assert_eq!(rejected, 5);
    }

    #[test]
    fn test_remaining_counts_down_to_zero() {
        let max = 3_u32;
        assert_eq!(decision_from_count(1, max, NOW_MS, WINDOW_MS).remaining, 2);
        assert_eq!(decision_from_count(2, max, NOW_MS, WINDOW_MS).remaining, 1);
        assert_eq!(decision_from_count(3, max, NOW_MS, WINDOW_MS).remaining, 0);
        // Over quota stays pinned at zero
        assert_eq!(decision_from_count(9, max, NOW_MS, WINDOW_MS).remaining, 0);
    }

    #[test]
    fn test_reset_at_is_one_window_out() {
        let decision = decision_from_count(1, 5, NOW_MS, WINDOW_MS);
        #[allow(clippy::cast_possible_wrap)]
        let expected = Utc
            .timestamp_millis_opt(NOW_MS + WINDOW_MS as i64)
            .single()
            .unwrap();
        assert_eq!(decision.reset_at, expected);
    }

    #[test]
    fn test_rule_key_composition() {
        assert_eq!(
            VERIFY_SUBMIT_RULE.key("198.51.100.7"),
            "rl:submit:198.51.100.7"
        );
        assert_eq!(ADMIN_COMMAND_RULE.key("42:kick"), "rl:command:42:kick");
    }

    #[test]
    fn test_rules_have_distinct_scopes() {
        let scopes = [
            VERIFY_SUBMIT_RULE.scope,
            VERIFY_PAGE_RULE.scope,
            MEMBERSHIP_EVENTS_RULE.scope,
            ADMIN_COMMAND_RULE.scope,
        ];
        for (i, a) in scopes.iter().enumerate() {
            for b in scopes.iter().skip(i + 1) {
                assert_ne!(a, b, "scopes must never share counters");
            }
        }
    }
}
