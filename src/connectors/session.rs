//! Streaming-session core shared by the websocket connectors.
//!
//! Fault-tolerant connection lifecycle management:
//! - State machine with well-defined transitions
//! - Exponential backoff with a hard cap and an attempt ceiling
//! - Heartbeat monitoring (protocol ping plus inbound-frame staleness)

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::info;

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Tunables for a streaming connector's session lifecycle.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// Socket open (incl. TLS + upgrade) timeout.
    pub connect_timeout: Duration,
    /// Protocol ping cadence while streaming.
    pub ping_interval: Duration,
    /// First reconnect delay; doubles per attempt.
    pub backoff_base: Duration,
    /// Ceiling for any single reconnect delay.
    pub backoff_cap: Duration,
    /// Give up after this many consecutive failed attempts.
    pub max_reconnect_attempts: u32,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
            max_reconnect_attempts: 10,
        }
    }
}

// =============================================================================
// STATE MACHINE
// =============================================================================

/// Connection state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Before any connection attempt.
    Idle,
    /// TCP + TLS + websocket upgrade in progress.
    Connecting,
    /// Socket open, waiting for the vendor's auth acknowledgement.
    Authenticating,
    /// Sending the subscribe frame.
    Subscribing,
    /// Actively receiving market data.
    Receiving,
    /// Connection lost, waiting out the backoff timer.
    Reconnecting,
    /// Graceful shutdown in progress.
    Terminating,
    /// Fully shut down; no further transitions.
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Authenticating => write!(f, "AUTHENTICATING"),
            Self::Subscribing => write!(f, "SUBSCRIBING"),
            Self::Receiving => write!(f, "RECEIVING"),
            Self::Reconnecting => write!(f, "RECONNECTING"),
            Self::Terminating => write!(f, "TERMINATING"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Reason for a state transition (for logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionReason {
    Started,
    ConnectSuccess,
    AuthSuccess,
    SubscribeSent,
    ConnectTimeout,
    AuthTimeout,
    AuthRejected,
    StaleData,
    ServerClose,
    NetworkError,
    AttemptsExhausted,
    ShutdownRequested,
}

impl std::fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Started => write!(f, "started"),
            Self::ConnectSuccess => write!(f, "connect_ok"),
            Self::AuthSuccess => write!(f, "auth_ok"),
            Self::SubscribeSent => write!(f, "subscribe_sent"),
            Self::ConnectTimeout => write!(f, "connect_timeout"),
            Self::AuthTimeout => write!(f, "auth_timeout"),
            Self::AuthRejected => write!(f, "auth_rejected"),
            Self::StaleData => write!(f, "data_stale"),
            Self::ServerClose => write!(f, "server_close"),
            Self::NetworkError => write!(f, "network_error"),
            Self::AttemptsExhausted => write!(f, "attempts_exhausted"),
            Self::ShutdownRequested => write!(f, "shutdown"),
        }
    }
}

/// Tracks the current session state and logs every transition.
#[derive(Debug)]
pub struct SessionTracker {
    name: &'static str,
    state: Mutex<SessionState>,
}

impl SessionTracker {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(SessionState::Idle),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn transition(&self, to: SessionState, reason: TransitionReason) {
        let mut state = self.state.lock();
        let from = *state;
        if from == SessionState::Closed {
            return;
        }
        if from != to {
            info!(
                connector = self.name,
                from = %from,
                to = %to,
                reason = %reason,
                "session transition"
            );
        }
        *state = to;
    }
}

// =============================================================================
// EXPONENTIAL BACKOFF
// =============================================================================

/// Reconnect backoff: `min(base * 2^attempt, cap)` with an attempt ceiling.
/// Resets on every successful connect.
#[derive(Debug)]
pub struct BackoffCalculator {
    base: Duration,
    cap: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl BackoffCalculator {
    pub fn new(settings: &StreamSettings) -> Self {
        Self {
            base: settings.backoff_base,
            cap: settings.backoff_cap,
            max_attempts: settings.max_reconnect_attempts,
            attempt: 0,
        }
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let factor = 2u32.saturating_pow(self.attempt);
        let delay = self.base.saturating_mul(factor).min(self.cap);
        self.attempt += 1;
        Some(delay)
    }

    /// Reset on successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

// =============================================================================
// HEARTBEAT MONITOR
// =============================================================================

/// Result of a heartbeat check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Connection looks alive.
    Ok,
    /// Ping cadence elapsed; send a protocol ping.
    SendPing,
    /// No inbound frame for 3x the ping interval; force-close to reconnect.
    ForceReconnect,
}

/// Tracks inbound-frame freshness against the ping cadence.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    ping_interval: Duration,
    last_frame: Instant,
    last_ping: Option<Instant>,
}

impl HeartbeatMonitor {
    pub fn new(ping_interval: Duration) -> Self {
        Self {
            ping_interval,
            last_frame: Instant::now(),
            last_ping: None,
        }
    }

    /// Reset for a fresh connection. The first ping goes out one full
    /// interval after the connect, not immediately.
    pub fn reset(&mut self) {
        self.last_frame = Instant::now();
        self.last_ping = Some(Instant::now());
    }

    /// Record any inbound frame (hot path).
    #[inline]
    pub fn record_frame(&mut self) {
        self.last_frame = Instant::now();
    }

    pub fn record_ping_sent(&mut self) {
        self.last_ping = Some(Instant::now());
    }

    pub fn check(&mut self) -> HeartbeatAction {
        let now = Instant::now();

        if now.duration_since(self.last_frame) > self.ping_interval * 3 {
            return HeartbeatAction::ForceReconnect;
        }

        let ping_due = match self.last_ping {
            None => true,
            Some(sent) => now.duration_since(sent) >= self.ping_interval,
        };
        if ping_due {
            return HeartbeatAction::SendPing;
        }

        HeartbeatAction::Ok
    }
}

// =============================================================================
// TESTS
// =============================================================================
