//! Ingestion connectors.
//!
//! Every upstream source is wrapped in a connector exposing the same
//! capability set: construct with its config (init), `connect`, `health`,
//! `shutdown`. The variants differ in how ticks are acquired: streaming
//! websockets (binance, polygon), a rate-limited polling REST source
//! (accuweather), and a vendor subscription session with a mock fallback
//! (bloomberg).

pub mod accuweather;
pub mod binance_ws;
pub mod bloomberg;
pub mod polygon_ws;
pub mod session;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

pub use session::{BackoffCalculator, HeartbeatAction, HeartbeatMonitor, SessionState,
    SessionTracker, StreamSettings, TransitionReason};

/// Connection status as reported in health snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Vendor rate-limit headers, when the source documents them.
#[derive(Debug, Clone)]
pub struct RateLimitInfo {
    pub remaining: Option<i64>,
    pub reset: Option<String>,
}

/// Point-in-time view of a connector's health. Built fresh on every call,
/// never stored.
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub status: ConnectionStatus,
    pub last_message_time: Option<DateTime<Utc>>,
    pub error_count: u64,
    pub uptime_ms: u64,
    pub rate_limit: Option<RateLimitInfo>,
}

/// Shared health counters: written by a connector's I/O tasks, read by the
/// supervisor's health loop. Atomics where possible, short mutexes elsewhere.
#[derive(Debug)]
pub struct HealthState {
    started_at: Instant,
    status: Mutex<ConnectionStatus>,
    last_message: Mutex<Option<DateTime<Utc>>>,
    error_count: AtomicU64,
    rate_limit: Mutex<Option<RateLimitInfo>>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            status: Mutex::new(ConnectionStatus::Disconnected),
            last_message: Mutex::new(None),
            error_count: AtomicU64::new(0),
            rate_limit: Mutex::new(None),
        }
    }

    pub fn set_status(&self, status: ConnectionStatus) {
        *self.status.lock() = status;
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.lock()
    }

    /// Record an inbound message (hot path).
    #[inline]
    pub fn record_message(&self) {
        *self.last_message.lock() = Some(Utc::now());
    }

    pub fn last_message_time(&self) -> Option<DateTime<Utc>> {
        *self.last_message.lock()
    }

    #[inline]
    pub fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn set_rate_limit(&self, remaining: Option<i64>, reset: Option<String>) {
        *self.rate_limit.lock() = Some(RateLimitInfo { remaining, reset });
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            status: self.status(),
            last_message_time: self.last_message_time(),
            error_count: self.error_count(),
            uptime_ms: self.started_at.elapsed().as_millis() as u64,
            rate_limit: self.rate_limit.lock().clone(),
        }
    }
}

/// Integer-seconds `Retry-After` header, when present. HTTP-date values are
/// not used by the vendors here and yield `None`.
pub(crate) fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<std::time::Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(std::time::Duration::from_secs)
}

/// Uniform lifecycle over every ingestion adapter.
///
/// Construction is the `init` step; `connect` brings the source online and
/// spawns its I/O tasks; `shutdown` is idempotent and must stop timers and
/// close sockets before returning (ticks in flight may drop).
#[async_trait]
pub trait Connector: Send + Sync {
    fn name(&self) -> &'static str;

    async fn connect(&self) -> Result<()>;

    fn health(&self) -> HealthSnapshot;

    async fn shutdown(&self);

    /// Subscribe additional symbols on a live connection. No-op while
    /// disconnected and for sources without dynamic subscriptions.
    async fn add_symbols(&self, _symbols: &[String]) -> Result<()> {
        Ok(())
    }

    /// Counterpart of [`Connector::add_symbols`].
    async fn remove_symbols(&self, _symbols: &[String]) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_state_snapshot() {
        let health = HealthState::new();
        assert_eq!(health.status(), ConnectionStatus::Disconnected);
        assert!(health.snapshot().last_message_time.is_none());

        health.set_status(ConnectionStatus::Connected);
        health.record_message();
        health.record_error();
        health.record_error();
        health.set_rate_limit(Some(42), Some("120".to_string()));

        let snap = health.snapshot();
        assert_eq!(snap.status, ConnectionStatus::Connected);
        assert!(snap.last_message_time.is_some());
        assert_eq!(snap.error_count, 2);
        assert_eq!(snap.rate_limit.as_ref().unwrap().remaining, Some(42));
    }

    #[test]
    fn test_retry_after_parsing() {
        let mut headers = reqwest::header::HeaderMap::new();
        assert_eq!(retry_after(&headers), None);

        headers.insert(reqwest::header::RETRY_AFTER, "10".parse().unwrap());
        assert_eq!(retry_after(&headers), Some(std::time::Duration::from_secs(10)));

        headers.insert(
            reqwest::header::RETRY_AFTER,
            "Wed, 21 Oct 2026 07:28:00 GMT".parse().unwrap(),
        );
        assert_eq!(retry_after(&headers), None);
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(ConnectionStatus::Connected.as_str(), "connected");
        assert_eq!(ConnectionStatus::Error.to_string(), "error");
    }
}
