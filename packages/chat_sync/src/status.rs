//! UI-facing view of the connection state. Derived on read, never stored.

use std::fmt;

use serde::Serialize;
use tokio::sync::watch;

use crate::connection::ConnectionSnapshot;
use crate::connection::machine::{ConnectionState, DisconnectReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    Error,
}

impl ConnectionStatus {
    pub fn from_state(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Connecting => Self::Connecting,
            ConnectionState::Connected => Self::Connected,
            ConnectionState::Reconnecting => Self::Reconnecting,
            ConnectionState::Disconnected(
                DisconnectReason::RetriesExhausted | DisconnectReason::CredentialUnavailable,
            ) => Self::Error,
            ConnectionState::Disconnected(DisconnectReason::ReconnectDisabled)
            | ConnectionState::Idle
            | ConnectionState::Closed => Self::Disconnected,
        }
    }

    /// Display string for a status indicator.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Connecting => "Connecting...",
            Self::Connected => "Connected",
            Self::Disconnected => "Disconnected",
            Self::Reconnecting => "Reconnecting...",
            Self::Error => "Connection Error",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Boolean projection for status indicators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusProjection {
    pub is_connected: bool,
    pub is_connecting: bool,
    pub is_reconnecting: bool,
    pub has_error: bool,
}

impl StatusProjection {
    pub fn from_state(state: ConnectionState) -> Self {
        let status = ConnectionStatus::from_state(state);
        Self {
            is_connected: status == ConnectionStatus::Connected,
            is_connecting: status == ConnectionStatus::Connecting,
            is_reconnecting: status == ConnectionStatus::Reconnecting,
            has_error: status == ConnectionStatus::Error,
        }
    }
}

/// Follows a connection manager's published state.
#[derive(Clone)]
pub struct StatusWatcher {
    rx: watch::Receiver<ConnectionSnapshot>,
}

impl StatusWatcher {
    pub fn new(rx: watch::Receiver<ConnectionSnapshot>) -> Self {
        Self { rx }
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        *self.rx.borrow()
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus::from_state(self.snapshot().state)
    }

    pub fn projection(&self) -> StatusProjection {
        StatusProjection::from_state(self.snapshot().state)
    }

    /// Wait for the next published transition. `None` once the manager is gone.
    pub async fn changed(&mut self) -> Option<ConnectionSnapshot> {
        self.rx.changed().await.ok()?;
        Some(*self.rx.borrow_and_update())
    }

    /// Wait until `pred` holds for the current snapshot.
    pub async fn wait_for(
        &mut self,
        mut pred: impl FnMut(&ConnectionSnapshot) -> bool,
    ) -> Option<ConnectionSnapshot> {
        let snapshot = self.rx.wait_for(|s| pred(s)).await.ok()?;
        Some(*snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        use ConnectionState::*;
        assert_eq!(ConnectionStatus::from_state(Idle), ConnectionStatus::Disconnected);
        assert_eq!(ConnectionStatus::from_state(Connecting), ConnectionStatus::Connecting);
        assert_eq!(ConnectionStatus::from_state(Connected), ConnectionStatus::Connected);
        assert_eq!(
            ConnectionStatus::from_state(Reconnecting),
            ConnectionStatus::Reconnecting
        );
        assert_eq!(
            ConnectionStatus::from_state(Disconnected(DisconnectReason::RetriesExhausted)),
            ConnectionStatus::Error
        );
        assert_eq!(
            ConnectionStatus::from_state(Disconnected(DisconnectReason::ReconnectDisabled)),
            ConnectionStatus::Disconnected
        );
        assert_eq!(ConnectionStatus::from_state(Closed), ConnectionStatus::Disconnected);
    }

    #[test]
    fn projection_flags_are_exclusive() {
        let p = StatusProjection::from_state(ConnectionState::Reconnecting);
        assert!(p.is_reconnecting);
        assert!(!p.is_connected && !p.is_connecting && !p.has_error);

        let p = StatusProjection::from_state(ConnectionState::Disconnected(
            DisconnectReason::CredentialUnavailable,
        ));
        assert!(p.has_error);
        assert!(!p.is_connected);
    }

    #[test]
    fn labels() {
        assert_eq!(ConnectionStatus::Reconnecting.label(), "Reconnecting...");
        assert_eq!(ConnectionStatus::Error.to_string(), "Connection Error");
    }

    #[tokio::test]
    async fn watcher_follows_channel() {
        let (tx, rx) = watch::channel(ConnectionSnapshot::initial(3));
        let mut watcher = StatusWatcher::new(rx);
        assert_eq!(watcher.status(), ConnectionStatus::Disconnected);

        tx.send_replace(ConnectionSnapshot {
            state: ConnectionState::Connected,
            attempts: 0,
            max_attempts: 3,
        });
        let snap = watcher.changed().await.unwrap();
        assert_eq!(snap.state, ConnectionState::Connected);
        assert!(watcher.projection().is_connected);

        drop(tx);
        assert!(watcher.changed().await.is_none());
    }
}
