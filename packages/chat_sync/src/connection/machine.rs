//! Connection lifecycle state machine: states, events, and the effects the
//! runtime must carry out. No I/O and no clocks; every transition is a plain
//! function call.

use std::fmt;
use std::time::Duration;

use crate::backoff::compute_delay;
use crate::credential::CredentialStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The reconnect ceiling was reached.
    RetriesExhausted,
    /// The transport dropped and automatic reconnection is off.
    ReconnectDisabled,
    /// A scheduled reconnect found no usable credential.
    CredentialUnavailable,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RetriesExhausted => write!(f, "retries exhausted"),
            Self::ReconnectDisabled => write!(f, "reconnect disabled"),
            Self::CredentialUnavailable => write!(f, "credential unavailable"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Disconnected(DisconnectReason),
    /// Terminal. Entered only through an explicit disconnect.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Disconnected(reason) => write!(f, "disconnected ({reason})"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Caller asked to connect. Idle|Disconnected|Reconnecting → Connecting
    Connect { credential: CredentialStatus },
    /// Handshake completed. Connecting → Connected
    TransportOpened,
    /// Handshake failed, timed out, or the socket errored.
    TransportFailed { error: String },
    /// Socket closed by the peer or the network.
    TransportClosed { code: Option<u16>, reason: String },
    /// Backoff elapsed. Reconnecting → Connecting
    ReconnectTimerFired { credential: CredentialStatus },
    /// The credential was withdrawn or expired. Reconnecting → Disconnected;
    /// a live connection is left alone.
    CredentialRevoked,
    /// Caller asked to disconnect. any → Closed
    Disconnect,
}

/// Work the runtime performs after a transition, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    OpenTransport { attempt: u32 },
    CloseTransport,
    ScheduleReconnect { delay: Duration, attempt: u32 },
    CancelReconnect,
    StartHeartbeat,
    StopHeartbeat,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("no credential available")]
    AuthMissing,

    #[error("credential has expired")]
    CredentialExpired,

    #[error("connection is closed")]
    Closed,
}

/// Reconnect behavior knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub auto_reconnect: bool,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            jitter: true,
        }
    }
}

/// The state plus the pending reconnect attempt counter.
///
/// The counter is incremented when a reconnect is scheduled, so the attempt
/// number carried by [`Effect::ScheduleReconnect`] is also the backoff input.
/// It resets to zero on every successful open.
#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    state: ConnectionState,
    attempts: u32,
    policy: ReconnectPolicy,
}

impl ConnectionMachine {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            state: ConnectionState::Idle,
            attempts: 0,
            policy,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Apply one event. On error the machine is unchanged.
    ///
    /// Events that do not apply to the current state (a late open after a
    /// disconnect, a timer that lost a race) are ignored and yield no effects.
    pub fn apply(&mut self, event: ConnectionEvent) -> Result<Vec<Effect>, TransitionError> {
        use ConnectionEvent::*;
        use ConnectionState::*;

        match (self.state, event) {
            (_, Disconnect) => Ok(self.close()),
            (Closed, Connect { .. }) => Err(TransitionError::Closed),
            (Closed, _) => Ok(Vec::new()),

            (Idle | Disconnected(_), Connect { credential }) => {
                check_credential(credential)?;
                self.attempts = 0;
                self.state = Connecting;
                Ok(vec![Effect::OpenTransport { attempt: 0 }])
            }
            (Reconnecting, Connect { credential }) => {
                check_credential(credential)?;
                self.state = Connecting;
                Ok(vec![
                    Effect::CancelReconnect,
                    Effect::OpenTransport {
                        attempt: self.attempts,
                    },
                ])
            }
            // Already on the way up; the live attempt keeps its credential.
            (Connecting | Connected, Connect { .. }) => Ok(Vec::new()),

            (Connecting, TransportOpened) => {
                self.attempts = 0;
                self.state = Connected;
                Ok(vec![Effect::StartHeartbeat])
            }

            (Connecting, TransportFailed { .. } | TransportClosed { .. }) => {
                Ok(self.transport_lost(false))
            }
            (Connected, TransportFailed { .. } | TransportClosed { .. }) => {
                Ok(self.transport_lost(true))
            }

            (Reconnecting, ReconnectTimerFired { credential }) => {
                if credential != CredentialStatus::Valid {
                    self.state = Disconnected(DisconnectReason::CredentialUnavailable);
                    return Ok(Vec::new());
                }
                self.state = Connecting;
                Ok(vec![Effect::OpenTransport {
                    attempt: self.attempts,
                }])
            }

            (Reconnecting, CredentialRevoked) => {
                self.state = Disconnected(DisconnectReason::CredentialUnavailable);
                Ok(vec![Effect::CancelReconnect])
            }

            _ => Ok(Vec::new()),
        }
    }

    fn close(&mut self) -> Vec<Effect> {
        let effects = match self.state {
            ConnectionState::Reconnecting => vec![Effect::CancelReconnect],
            ConnectionState::Connecting => vec![Effect::CloseTransport],
            ConnectionState::Connected => vec![Effect::StopHeartbeat, Effect::CloseTransport],
            _ => Vec::new(),
        };
        self.state = ConnectionState::Closed;
        effects
    }

    fn transport_lost(&mut self, was_connected: bool) -> Vec<Effect> {
        let mut effects = Vec::new();
        if was_connected {
            effects.push(Effect::StopHeartbeat);
        }
        effects.push(Effect::CloseTransport);

        if !self.policy.auto_reconnect {
            self.state = ConnectionState::Disconnected(DisconnectReason::ReconnectDisabled);
        } else if self.attempts >= self.policy.max_attempts {
            self.state = ConnectionState::Disconnected(DisconnectReason::RetriesExhausted);
        } else {
            self.attempts += 1;
            self.state = ConnectionState::Reconnecting;
            effects.push(Effect::ScheduleReconnect {
                delay: compute_delay(
                    self.attempts,
                    self.policy.base_delay,
                    self.policy.max_delay,
                    self.policy.jitter,
                ),
                attempt: self.attempts,
            });
        }
        effects
    }
}

fn check_credential(credential: CredentialStatus) -> Result<(), TransitionError> {
    match credential {
        CredentialStatus::Valid => Ok(()),
        CredentialStatus::Missing => Err(TransitionError::AuthMissing),
        CredentialStatus::Expired => Err(TransitionError::CredentialExpired),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: CredentialStatus = CredentialStatus::Valid;

    fn policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            auto_reconnect: true,
            max_attempts,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            jitter: false,
        }
    }

    fn connect() -> ConnectionEvent {
        ConnectionEvent::Connect { credential: VALID }
    }

    fn fire() -> ConnectionEvent {
        ConnectionEvent::ReconnectTimerFired { credential: VALID }
    }

    fn closed() -> ConnectionEvent {
        ConnectionEvent::TransportClosed {
            code: Some(1006),
            reason: "abnormal".into(),
        }
    }

    fn failed() -> ConnectionEvent {
        ConnectionEvent::TransportFailed {
            error: "refused".into(),
        }
    }

    fn connected(max_attempts: u32) -> ConnectionMachine {
        let mut m = ConnectionMachine::new(policy(max_attempts));
        m.apply(connect()).unwrap();
        m.apply(ConnectionEvent::TransportOpened).unwrap();
        m
    }

    // ── connect guard ───────────────────────────────────────────────────

    #[test]
    fn connect_opens_transport() {
        let mut m = ConnectionMachine::new(policy(3));
        let effects = m.apply(connect()).unwrap();
        assert_eq!(m.state(), ConnectionState::Connecting);
        assert_eq!(effects, vec![Effect::OpenTransport { attempt: 0 }]);
    }

    #[test]
    fn missing_credential_fails_fast_and_stays_idle() {
        let mut m = ConnectionMachine::new(policy(3));
        let err = m
            .apply(ConnectionEvent::Connect {
                credential: CredentialStatus::Missing,
            })
            .unwrap_err();
        assert_eq!(err, TransitionError::AuthMissing);
        assert_eq!(m.state(), ConnectionState::Idle);
    }

    #[test]
    fn expired_credential_fails_fast() {
        let mut m = ConnectionMachine::new(policy(3));
        let err = m
            .apply(ConnectionEvent::Connect {
                credential: CredentialStatus::Expired,
            })
            .unwrap_err();
        assert_eq!(err, TransitionError::CredentialExpired);
        assert_eq!(m.state(), ConnectionState::Idle);
    }

    #[test]
    fn connect_while_connected_is_noop() {
        let mut m = connected(3);
        assert!(m.apply(connect()).unwrap().is_empty());
        assert_eq!(m.state(), ConnectionState::Connected);
    }

    #[test]
    fn connect_while_live_ignores_revoked_credential() {
        let mut m = connected(3);
        let effects = m
            .apply(ConnectionEvent::Connect {
                credential: CredentialStatus::Missing,
            })
            .unwrap();
        assert!(effects.is_empty());
        assert_eq!(m.state(), ConnectionState::Connected);

        let mut m = ConnectionMachine::new(policy(3));
        m.apply(connect()).unwrap();
        let effects = m
            .apply(ConnectionEvent::Connect {
                credential: CredentialStatus::Expired,
            })
            .unwrap();
        assert!(effects.is_empty());
        assert_eq!(m.state(), ConnectionState::Connecting);
    }

    // ── open / loss ─────────────────────────────────────────────────────

    #[test]
    fn open_resets_attempts_and_starts_heartbeat() {
        let mut m = ConnectionMachine::new(policy(3));
        m.apply(connect()).unwrap();
        m.apply(failed()).unwrap();
        m.apply(fire()).unwrap();
        assert_eq!(m.attempts(), 1);
        let effects = m.apply(ConnectionEvent::TransportOpened).unwrap();
        assert_eq!(effects, vec![Effect::StartHeartbeat]);
        assert_eq!(m.attempts(), 0);
        assert_eq!(m.state(), ConnectionState::Connected);
    }

    #[test]
    fn unexpected_close_schedules_reconnect() {
        let mut m = connected(3);
        let effects = m.apply(closed()).unwrap();
        assert_eq!(m.state(), ConnectionState::Reconnecting);
        assert_eq!(
            effects,
            vec![
                Effect::StopHeartbeat,
                Effect::CloseTransport,
                Effect::ScheduleReconnect {
                    delay: Duration::from_millis(1000),
                    attempt: 1
                },
            ]
        );
    }

    #[test]
    fn backoff_grows_across_attempts() {
        let mut m = ConnectionMachine::new(policy(5));
        m.apply(connect()).unwrap();
        let mut delays = Vec::new();
        for _ in 0..3 {
            for effect in m.apply(failed()).unwrap() {
                if let Effect::ScheduleReconnect { delay, .. } = effect {
                    delays.push(delay.as_millis());
                }
            }
            m.apply(fire()).unwrap();
        }
        assert_eq!(delays, vec![1000, 2000, 4000]);
    }

    #[test]
    fn reconnect_disabled_goes_disconnected() {
        let mut m = ConnectionMachine::new(ReconnectPolicy {
            auto_reconnect: false,
            ..policy(3)
        });
        m.apply(connect()).unwrap();
        m.apply(ConnectionEvent::TransportOpened).unwrap();
        m.apply(closed()).unwrap();
        assert_eq!(
            m.state(),
            ConnectionState::Disconnected(DisconnectReason::ReconnectDisabled)
        );
    }

    // ── ceiling ─────────────────────────────────────────────────────────

    #[test]
    fn exactly_max_attempts_then_terminal() {
        let mut m = ConnectionMachine::new(policy(3));
        m.apply(connect()).unwrap();

        let mut reconnect_opens = 0;
        loop {
            m.apply(failed()).unwrap();
            if m.state() != ConnectionState::Reconnecting {
                break;
            }
            let effects = m.apply(fire()).unwrap();
            if effects
                .iter()
                .any(|e| matches!(e, Effect::OpenTransport { .. }))
            {
                reconnect_opens += 1;
            }
        }

        assert_eq!(reconnect_opens, 3);
        assert_eq!(
            m.state(),
            ConnectionState::Disconnected(DisconnectReason::RetriesExhausted)
        );
        // No further automatic transition
        assert!(m.apply(fire()).unwrap().is_empty());
        assert_eq!(
            m.state(),
            ConnectionState::Disconnected(DisconnectReason::RetriesExhausted)
        );
    }

    #[test]
    fn manual_connect_after_exhaustion_starts_fresh() {
        let mut m = ConnectionMachine::new(policy(1));
        m.apply(connect()).unwrap();
        m.apply(failed()).unwrap();
        m.apply(fire()).unwrap();
        m.apply(failed()).unwrap();
        assert!(matches!(m.state(), ConnectionState::Disconnected(_)));

        let effects = m.apply(connect()).unwrap();
        assert_eq!(effects, vec![Effect::OpenTransport { attempt: 0 }]);
        assert_eq!(m.attempts(), 0);
    }

    #[test]
    fn timer_without_credential_stops_loop() {
        let mut m = connected(3);
        m.apply(closed()).unwrap();
        let effects = m
            .apply(ConnectionEvent::ReconnectTimerFired {
                credential: CredentialStatus::Missing,
            })
            .unwrap();
        assert!(effects.is_empty());
        assert_eq!(
            m.state(),
            ConnectionState::Disconnected(DisconnectReason::CredentialUnavailable)
        );
    }

    #[test]
    fn revocation_during_backoff_cancels_timer() {
        let mut m = connected(3);
        m.apply(closed()).unwrap();
        let effects = m.apply(ConnectionEvent::CredentialRevoked).unwrap();
        assert_eq!(effects, vec![Effect::CancelReconnect]);
        assert_eq!(
            m.state(),
            ConnectionState::Disconnected(DisconnectReason::CredentialUnavailable)
        );
        // A timer that raced the cancel does nothing
        assert!(m.apply(fire()).unwrap().is_empty());
    }

    #[test]
    fn revocation_leaves_live_connection_alone() {
        let mut m = connected(3);
        assert!(m.apply(ConnectionEvent::CredentialRevoked).unwrap().is_empty());
        assert_eq!(m.state(), ConnectionState::Connected);

        let mut idle = ConnectionMachine::new(policy(3));
        assert!(idle.apply(ConnectionEvent::CredentialRevoked).unwrap().is_empty());
        assert_eq!(idle.state(), ConnectionState::Idle);
    }

    #[test]
    fn connect_during_backoff_skips_wait() {
        let mut m = connected(3);
        m.apply(closed()).unwrap();
        let effects = m.apply(connect()).unwrap();
        assert_eq!(
            effects,
            vec![Effect::CancelReconnect, Effect::OpenTransport { attempt: 1 }]
        );
        assert_eq!(m.state(), ConnectionState::Connecting);
    }

    // ── disconnect ──────────────────────────────────────────────────────

    #[test]
    fn disconnect_while_reconnecting_cancels_timer() {
        let mut m = connected(3);
        m.apply(closed()).unwrap();
        let effects = m.apply(ConnectionEvent::Disconnect).unwrap();
        assert_eq!(effects, vec![Effect::CancelReconnect]);
        assert_eq!(m.state(), ConnectionState::Closed);

        // A timer that raced the cancel must not restart the connection
        assert!(m.apply(fire()).unwrap().is_empty());
        assert_eq!(m.state(), ConnectionState::Closed);
    }

    #[test]
    fn disconnect_while_connected_closes_transport() {
        let mut m = connected(3);
        let effects = m.apply(ConnectionEvent::Disconnect).unwrap();
        assert_eq!(effects, vec![Effect::StopHeartbeat, Effect::CloseTransport]);
    }

    #[test]
    fn disconnect_succeeds_from_every_state() {
        let mut idle = ConnectionMachine::new(policy(3));
        assert!(idle.apply(ConnectionEvent::Disconnect).is_ok());
        assert_eq!(idle.state(), ConnectionState::Closed);
        // Idempotent
        assert!(idle.apply(ConnectionEvent::Disconnect).unwrap().is_empty());
    }

    #[test]
    fn closed_is_absorbing() {
        let mut m = connected(3);
        m.apply(ConnectionEvent::Disconnect).unwrap();
        assert_eq!(m.apply(connect()).unwrap_err(), TransitionError::Closed);
        assert!(m.apply(ConnectionEvent::TransportOpened).unwrap().is_empty());
        assert!(m.apply(closed()).unwrap().is_empty());
        assert_eq!(m.state(), ConnectionState::Closed);
    }

    #[test]
    fn state_display() {
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
        assert_eq!(
            ConnectionState::Disconnected(DisconnectReason::RetriesExhausted).to_string(),
            "disconnected (retries exhausted)"
        );
    }
}
