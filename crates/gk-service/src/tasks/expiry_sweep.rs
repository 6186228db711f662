//! Session expiry reconciliation sweep.
//!
//! The per-session deadline timer is in-memory and lost on restart; this
//! task is the correctness backstop. Each iteration:
//! 1. Expires overdue pending sessions in batches and runs their
//!    post-timeout actions
//! 2. Prunes audit rows past the retention window
//!
//! # Graceful Shutdown
//!
//! The task supports graceful shutdown via a cancellation token. When the
//! token is cancelled, the task completes its current iteration and exits
//! cleanly.

use crate::observability::metrics;
use crate::repositories::{AuditRepository, SessionsRepository};
use crate::services::VerificationService;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// Default sweep interval in seconds (5 minutes).
const DEFAULT_CHECK_INTERVAL_SECONDS: u64 = 300;

/// Default per-iteration batch of sessions to expire.
const DEFAULT_BATCH_SIZE: i64 = 100;

/// Default audit retention in days.
const DEFAULT_AUDIT_RETENTION_DAYS: i32 = 90;

/// Configuration for the expiry sweep task.
#[derive(Debug, Clone)]
pub struct ExpirySweepConfig {
    /// Sweep interval in seconds.
    pub check_interval_seconds: u64,
    /// Sessions expired per iteration.
    pub batch_size: i64,
    /// Days to retain audit rows.
    pub audit_retention_days: i32,
}

impl Default for ExpirySweepConfig {
    fn default() -> Self {
        Self {
            check_interval_seconds: DEFAULT_CHECK_INTERVAL_SECONDS,
            batch_size: DEFAULT_BATCH_SIZE,
            audit_retention_days: DEFAULT_AUDIT_RETENTION_DAYS,
        }
    }
}

impl ExpirySweepConfig {
    /// Create config from environment variables.
    ///
    /// Environment variables:
    /// - `GK_SWEEP_INTERVAL_SECONDS` - Sweep interval (default: 300)
    /// - `GK_SWEEP_BATCH_SIZE` - Sessions per iteration (default: 100)
    /// - `GK_AUDIT_RETENTION_DAYS` - Audit retention (default: 90)
    #[must_use]
    pub fn from_env() -> Self {
        let check_interval_seconds = std::env::var("GK_SWEEP_INTERVAL_SECONDS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_CHECK_INTERVAL_SECONDS);

        let batch_size = std::env::var("GK_SWEEP_BATCH_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_BATCH_SIZE);

        let audit_retention_days = std::env::var("GK_AUDIT_RETENTION_DAYS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_AUDIT_RETENTION_DAYS);

        Self {
            check_interval_seconds,
            batch_size,
            audit_retention_days,
        }
    }
}

/// Start the expiry sweep background task.
///
/// Runs in a loop at the configured interval and exits gracefully when the
/// cancellation token is triggered.
#[instrument(skip_all, name = "gk.task.expiry_sweep")]
pub async fn start_expiry_sweep(
    service: Arc<VerificationService>,
    config: ExpirySweepConfig,
    cancel_token: CancellationToken,
) {
    info!(
        target: "gk.task.expiry_sweep",
        check_interval_seconds = config.check_interval_seconds,
        batch_size = config.batch_size,
        audit_retention_days = config.audit_retention_days,
        "Starting expiry sweep task"
    );

    let mut interval = tokio::time::interval(Duration::from_secs(config.check_interval_seconds));

    loop {
        tokio::select! {
            _ = interval.tick() => {
                run_sweep(&service, &config).await;
            }
            _ = cancel_token.cancelled() => {
                info!(
                    target: "gk.task.expiry_sweep",
                    "Expiry sweep task received shutdown signal, exiting"
                );
                break;
            }
        }
    }

    info!(target: "gk.task.expiry_sweep", "Expiry sweep task stopped");
}

/// Run a single sweep iteration.
///
/// Separated from the main loop to allow direct testing.
pub(crate) async fn run_sweep(service: &Arc<VerificationService>, config: &ExpirySweepConfig) {
    // Step 1: expire overdue pending sessions and run their timeout actions
    match SessionsRepository::expire_overdue(service.pool(), Some(config.batch_size)).await {
        Ok(expired) => {
            if !expired.is_empty() {
                warn!(
                    target: "gk.task.expiry_sweep",
                    expired_count = expired.len(),
                    "Expired overdue sessions missed by in-memory deadlines"
                );
                metrics::record_sweep(expired.len());
            }
            for session in &expired {
                // The transition is already committed; only the side
                // effects remain
                service.finalize_expired(session).await;
            }
        }
        Err(e) => {
            error!(
                target: "gk.task.expiry_sweep",
                error = %e,
                "Failed to expire overdue sessions"
            );
        }
    }

    // Step 2: prune audit rows past retention
    match AuditRepository::prune_older_than(service.pool(), config.audit_retention_days).await {
        Ok(count) => {
            if count > 0 {
                info!(
                    target: "gk.task.expiry_sweep",
                    deleted_count = count,
                    retention_days = config.audit_retention_days,
                    "Pruned old audit rows"
                );
            }
        }
        Err(e) => {
            error!(
                target: "gk.task.expiry_sweep",
                error = %e,
                "Failed to prune audit rows"
            );
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't run in parallel
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_default_config() {
        let config = ExpirySweepConfig::default();
        assert_eq!(config.check_interval_seconds, DEFAULT_CHECK_INTERVAL_SECONDS);
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.audit_retention_days, DEFAULT_AUDIT_RETENTION_DAYS);
    }

    #[test]
    fn test_from_env_with_valid_values() {
        let _guard = ENV_MUTEX.lock().unwrap();

        std::env::set_var("GK_SWEEP_INTERVAL_SECONDS", "60");
        std::env::set_var("GK_SWEEP_BATCH_SIZE", "10");
        std::env::set_var("GK_AUDIT_RETENTION_DAYS", "30");

        let config = ExpirySweepConfig::from_env();

        std::env::remove_var("GK_SWEEP_INTERVAL_SECONDS");
        std::env::remove_var("GK_SWEEP_BATCH_SIZE");
        std::env::remove_var("GK_AUDIT_RETENTION_DAYS");

        assert_eq!(config.check_interval_seconds, 60);
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.audit_retention_days, 30);
    }

    #[test]
    fn test_from_env_with_invalid_values_uses_defaults() {
        let _guard = ENV_MUTEX.lock().unwrap();

        std::env::set_var("GK_SWEEP_INTERVAL_SECONDS", "not-a-number");
        std::env::set_var("GK_SWEEP_BATCH_SIZE", "");

        let config = ExpirySweepConfig::from_env();

        std::env::remove_var("GK_SWEEP_INTERVAL_SECONDS");
        std::env::remove_var("GK_SWEEP_BATCH_SIZE");

        assert_eq!(config.check_interval_seconds, DEFAULT_CHECK_INTERVAL_SECONDS);
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
    }

    #[test]
    fn test_from_env_with_missing_vars_uses_defaults() {
        let _guard = ENV_MUTEX.lock().unwrap();

        std::env::remove_var("GK_SWEEP_INTERVAL_SECONDS");
        std::env::remove_var("GK_SWEEP_BATCH_SIZE");
        std::env::remove_var("GK_AUDIT_RETENTION_DAYS");

        let config = ExpirySweepConfig::from_env();
        assert_eq!(config.check_interval_seconds, DEFAULT_CHECK_INTERVAL_SECONDS);
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.audit_retention_days, DEFAULT_AUDIT_RETENTION_DAYS);
    }
}
