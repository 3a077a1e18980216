//! Real-time message synchronization: one reconnecting WebSocket connection
//! and exactly-once delivery of inbound events to application handlers.

pub mod backoff;
pub mod config;
pub mod connection;
pub mod credential;
pub mod dedup;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod status;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use backoff::compute_delay;
pub use config::{ConnectionConfig, DedupConfig, FileConfig, Profile, SyncConfig, load_config};
pub use connection::machine::{ConnectionState, DisconnectReason, ReconnectPolicy};
pub use connection::{ConnectionHandle, ConnectionManager, ConnectionSnapshot};
pub use credential::{CredentialSource, StaticCredentials, extract_user_id, is_expired};
pub use dedup::{CacheStats, DedupCache, derive_key};
pub use dispatch::{DispatchOutcome, DispatchStats, HandlerId, InboundDispatcher};
pub use error::SyncError;
pub use frame::Frame;
pub use status::{ConnectionStatus, StatusProjection, StatusWatcher};
pub use transport::{Transport, TransportEvent, WebSocketTransport, websocket_url};
