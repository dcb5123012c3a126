//! Decides when the shared transport may be (re)opened.
//!
//! The policy never touches the transport itself. The multiplexer reports
//! attempts, opens and closes, and asks for a decision whenever something
//! could warrant a connection. All methods take the current instant so the
//! policy stays deterministic under test.

use std::time::Duration;

use tokio::time::Instant;

pub const DEFAULT_MIN_RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyState {
    Idle,
    Connecting,
    Connected,
    BackingOff { until: Instant },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectDecision {
    ConnectNow,
    /// A single reconnection is scheduled for this instant.
    ConnectAt(Instant),
    AlreadyActive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDecision {
    ReconnectAt(Instant),
    TearDown,
}

#[derive(Debug)]
pub struct ReconnectionPolicy {
    min_interval: Duration,
    state: PolicyState,
    last_attempt_at: Option<Instant>,
    last_open_at: Option<Instant>,
    current_attempt_opened: bool,
}

impl ReconnectionPolicy {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            state: PolicyState::Idle,
            last_attempt_at: None,
            last_open_at: None,
            current_attempt_opened: false,
        }
    }

    pub fn state(&self) -> PolicyState {
        self.state
    }

    /// Online-transition trigger: only worth connecting when someone is
    /// listening and there is either pending output or an eager join.
    pub fn wants_connection(clients_attached: bool, queue_pending: bool, eager: bool) -> bool {
        clients_attached && (queue_pending || eager)
    }

    /// Immediate trigger (send, online transition, explicit reconnect). A
    /// pending schedule is kept as is: the later deadline wins and only one
    /// attempt results.
    pub fn request_connect(&mut self, now: Instant) -> ConnectDecision {
        match self.state {
            PolicyState::Connecting | PolicyState::Connected => ConnectDecision::AlreadyActive,
            PolicyState::BackingOff { until } => ConnectDecision::ConnectAt(until),
            PolicyState::Idle => match self.earliest_attempt() {
                Some(at) if at > now => {
                    self.state = PolicyState::BackingOff { until: at };
                    ConnectDecision::ConnectAt(at)
                }
                _ => ConnectDecision::ConnectNow,
            },
        }
    }

    pub fn on_attempt(&mut self, now: Instant) {
        self.state = PolicyState::Connecting;
        self.last_attempt_at = Some(now);
        self.current_attempt_opened = false;
    }

    pub fn on_open(&mut self, now: Instant) {
        self.state = PolicyState::Connected;
        self.last_open_at = Some(now);
        self.current_attempt_opened = true;
    }

    /// Terminal close of the current attempt. Reconnection is scheduled no
    /// sooner than `min_interval` after the session started, so a server that
    /// accepts and immediately drops cannot drive a tight loop.
    pub fn on_close(&mut self, now: Instant, online: bool, clients_attached: bool) -> CloseDecision {
        if !online || !clients_attached {
            self.state = PolicyState::Idle;
            return CloseDecision::TearDown;
        }

        let until = match self.session_start() {
            Some(started) => {
                let session = now.saturating_duration_since(started);
                now + self.min_interval.saturating_sub(session)
            }
            None => now,
        };
        self.state = PolicyState::BackingOff { until };
        CloseDecision::ReconnectAt(until)
    }

    /// True once a scheduled reconnection is due; the caller is expected to
    /// follow up with [`ReconnectionPolicy::on_attempt`] or
    /// [`ReconnectionPolicy::cancel`].
    pub fn is_due(&self, now: Instant) -> bool {
        matches!(self.state, PolicyState::BackingOff { until } if until <= now)
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            PolicyState::BackingOff { until } => Some(until),
            _ => None,
        }
    }

    /// Drops any scheduled reconnection and returns to idle. Used for
    /// last-client teardown and offline transitions.
    pub fn cancel(&mut self) {
        self.state = PolicyState::Idle;
    }

    /// Time since the current session opened, if it did.
    pub fn session_duration(&self, now: Instant) -> Option<Duration> {
        if !self.current_attempt_opened {
            return None;
        }
        self.last_open_at
            .map(|opened| now.saturating_duration_since(opened))
    }

    fn session_start(&self) -> Option<Instant> {
        if self.current_attempt_opened {
            self.last_open_at
        } else {
            self.last_attempt_at
        }
    }

    fn earliest_attempt(&self) -> Option<Instant> {
        let latest = match (self.last_open_at, self.last_attempt_at) {
            (Some(opened), Some(attempted)) => Some(opened.max(attempted)),
            (opened, attempted) => opened.or(attempted),
        };
        latest.map(|at| at + self.min_interval)
    }
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_RECONNECT_INTERVAL)
    }
}
