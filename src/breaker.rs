//! Keyed circuit breaker guarding provider-facing work.
//!
//! One logical circuit per key (campaign, destination phone, queue job,
//! instance). A circuit opens after `failure_threshold` consecutive
//! failures and closes again either on a recorded success or once
//! `open_timeout` has passed since the last failure, at which point the
//! failure count restarts from zero. State is in-memory and per-process;
//! a restart starts every circuit closed.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config;
use crate::model::normalize_phone;

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct BreakerEntry {
    failures: u32,
    last_failure_at: Instant,
    is_open: bool,
}

pub struct CircuitBreaker {
    failure_threshold: u32,
    open_timeout: Duration,
    entries: Mutex<HashMap<String, BreakerEntry>>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_FAILURE_THRESHOLD, DEFAULT_OPEN_TIMEOUT)
    }

    pub fn with_limits(failure_threshold: u32, open_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            open_timeout,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(cfg: &config::Breaker) -> Self {
        Self::with_limits(
            cfg.failure_threshold,
            Duration::from_secs(cfg.open_timeout_secs),
        )
    }

    /// Record a failed operation under `key`. Opens the circuit once the
    /// consecutive-failure threshold is reached.
    pub fn record_failure(&self, key: &str) {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(key.to_string()).or_insert(BreakerEntry {
            failures: 0,
            last_failure_at: Instant::now(),
            is_open: false,
        });
        entry.failures += 1;
        entry.last_failure_at = Instant::now();
        if !entry.is_open && entry.failures >= self.failure_threshold {
            entry.is_open = true;
            warn!(key, failures = entry.failures, "circuit opened");
        }
    }

    /// Record a successful operation under `key`: failures reset, circuit
    /// closes.
    pub fn record_success(&self, key: &str) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(key) {
            if entry.is_open {
                debug!(key, "circuit closed after success");
            }
            entry.failures = 0;
            entry.is_open = false;
        }
    }

    /// Whether callers must skip work keyed by `key`.
    ///
    /// An open circuit whose last failure is older than `open_timeout`
    /// closes here (half-open probe): the caller is let through and the
    /// failure count restarts from zero.
    pub fn is_open(&self, key: &str) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let Some(entry) = entries.get_mut(key) else {
            return false;
        };
        if !entry.is_open {
            return false;
        }
        if entry.last_failure_at.elapsed() >= self.open_timeout {
            debug!(key, "circuit half-open, letting a probe through");
            entry.failures = 0;
            entry.is_open = false;
            return false;
        }
        true
    }

    pub fn failure_count(&self, key: &str) -> u32 {
        let entries = self.entries.lock().unwrap();
        entries.get(key).map(|e| e.failures).unwrap_or(0)
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

pub fn campaign_key(campaign_id: i64) -> String {
    format!("campaign:{campaign_id}")
}

pub fn message_key(phone: &str) -> String {
    format!("message:{}", normalize_phone(phone))
}

pub fn queue_key(kind: &str, job_id: i64) -> String {
    format!("queue:{kind}:{job_id}")
}

pub fn instance_key(provider_ref: &str) -> String {
    format!("instance:{provider_ref}")
}
