//! Rate limiter facade.

use once_cell::sync::OnceCell;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace};

use super::audit::AuditLog;
use super::clock::{Clock, SystemClock};
use super::identifier::IdentifierKey;
use super::ledger::{FileLedger, LedgerUpdate};
use super::window::{evaluate, prune, window_span, Decision, Policy, Usage};
use crate::config::LimiterConfig;
use crate::error::Result;

/// Bounds how often each identifier may be invoked within a sliding window.
///
/// Every limiter pointed at the same store path, in this process or any
/// other, shares the same ledger. The store is opened on first use and kept
/// open for the limiter's lifetime. The limiter is `Sync` and may be shared
/// across threads.
#[derive(Debug)]
pub struct RateLimiter {
    config: LimiterConfig,
    clock: Arc<dyn Clock>,
    ledger: OnceCell<FileLedger>,
    audit: Option<AuditLog>,
}

impl RateLimiter {
    /// Create a limiter using the system clock.
    pub fn new(config: LimiterConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a limiter reading time from `clock`.
    pub fn with_clock(config: LimiterConfig, clock: Arc<dyn Clock>) -> Self {
        let audit = config.audit_log.clone().map(AuditLog::new);
        Self {
            config,
            clock,
            ledger: OnceCell::new(),
            audit,
        }
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    /// Ask whether `identifier` may run now, recording the run if so.
    pub fn attempt(&self, identifier: &str, max_calls: u32, window: Duration) -> Result<Decision> {
        self.attempt_with_note(identifier, max_calls, window, None)
    }

    /// Like [`attempt`](Self::attempt), attaching `note` to the audit entry.
    pub fn attempt_with_note(
        &self,
        identifier: &str,
        max_calls: u32,
        window: Duration,
        note: Option<&str>,
    ) -> Result<Decision> {
        let key = self.key(identifier)?;
        let policy = Policy::new(max_calls, window)?;
        let ledger = self.ledger()?;

        trace!(key = %key, max_calls, window = ?window, "Checking rate limit");

        let clock = &self.clock;
        let (decision, at) = ledger.transact(&key, |current| {
            // Read the clock only once the lock is held.
            let now = clock.now();
            let evaluation = evaluate(current, now, &policy);
            let update = if evaluation.decision.allowed {
                LedgerUpdate::Replace(evaluation.sequence)
            } else {
                LedgerUpdate::Unchanged
            };
            ((evaluation.decision, now), update)
        })?;

        if decision.allowed {
            debug!(key = %key, remaining = decision.remaining, "Invocation allowed");
        } else {
            debug!(
                key = %key,
                retry_after = ?decision.retry_after,
                "Rate limit exceeded"
            );
        }

        if let Some(audit) = &self.audit {
            audit.record(at, &key, &decision, note);
        }
        Ok(decision)
    }

    /// Forget every recorded invocation of `identifier`.
    pub fn reset(&self, identifier: &str) -> Result<()> {
        let key = self.key(identifier)?;
        if self.ledger()?.delete(&key)? {
            info!(key = %key, "Reset invocation history");
        }
        Ok(())
    }

    /// Summarize the invocations of `identifier` still inside `window`.
    ///
    /// Read-only: nothing is pruned on disk and nothing is counted.
    pub fn inspect_usage(&self, identifier: &str, window: Duration) -> Result<Usage> {
        let key = self.key(identifier)?;
        let span = window_span(window)?;
        let records = self.ledger()?.inspect(&key)?;
        Ok(Usage::of(prune(&records, self.clock.now(), span)))
    }

    /// Drop records of `identifier` older than `window` from the store.
    ///
    /// Returns how many were removed. Attempts prune on their own, so this is
    /// housekeeping only.
    pub fn prune(&self, identifier: &str, window: Duration) -> Result<usize> {
        let key = self.key(identifier)?;
        let span = window_span(window)?;
        let clock = &self.clock;

        let dropped = self.ledger()?.transact(&key, |current| {
            let active = prune(current, clock.now(), span);
            let dropped = current.len() - active.len();
            let update = if dropped > 0 {
                LedgerUpdate::Replace(active.to_vec())
            } else {
                LedgerUpdate::Unchanged
            };
            (dropped, update)
        })?;

        if dropped > 0 {
            debug!(key = %key, dropped, "Pruned expired records");
        }
        Ok(dropped)
    }

    /// Identifiers that currently have recorded invocations.
    pub fn identifiers(&self) -> Result<Vec<String>> {
        self.ledger()?.keys()
    }

    /// Release the store handle, if one was opened.
    pub fn close(&self) {
        if let Some(ledger) = self.ledger.get() {
            ledger.close();
        }
    }

    fn key(&self, identifier: &str) -> Result<IdentifierKey> {
        IdentifierKey::normalize(identifier, self.config.max_identifier_len)
    }

    fn ledger(&self) -> Result<&FileLedger> {
        self.ledger
            .get_or_try_init(|| FileLedger::open_or_create(&self.config.store))
    }
}
