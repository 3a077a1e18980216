//! Transport collaborator: opens one realtime connection and reports its
//! lifecycle as events. The connection manager never touches sockets.

pub mod websocket;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::SyncError;

pub use websocket::WebSocketTransport;

/// Lifecycle notifications from one transport connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    Message(String),
    /// Handshake failure, timeout, or socket error. Terminal for the connection.
    Error(String),
    /// Peer or network closed the connection. Terminal for the connection.
    Closed { code: Option<u16>, reason: String },
}

/// Delivers events for one connection, tagged with its generation so the
/// manager can drop events from connections it has already abandoned.
#[derive(Debug, Clone)]
pub struct EventSink {
    generation: u64,
    tx: mpsc::Sender<(u64, TransportEvent)>,
}

impl EventSink {
    pub fn new(generation: u64, tx: mpsc::Sender<(u64, TransportEvent)>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns false once the manager is gone.
    pub async fn emit(&self, event: TransportEvent) -> bool {
        self.tx.send((self.generation, event)).await.is_ok()
    }
}

/// Owner's side of an open connection. Dropping it closes the connection.
#[derive(Debug)]
pub struct TransportHandle {
    outbound: mpsc::Sender<String>,
    cancel: CancellationToken,
}

impl TransportHandle {
    pub fn new(outbound: mpsc::Sender<String>, cancel: CancellationToken) -> Self {
        Self { outbound, cancel }
    }

    /// Queue a text frame. Never blocks.
    pub fn send(&self, text: String) -> Result<(), SyncError> {
        self.outbound.try_send(text).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                SyncError::Transport("outbound buffer full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => SyncError::NotConnected,
        })
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.outbound.is_closed()
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Opens connections. `open` must return immediately; completion or failure
/// arrives later through the sink.
pub trait Transport: Send + Sync + 'static {
    fn open(&self, url: Url, sink: EventSink) -> TransportHandle;
}

/// Realtime endpoint for an HTTP(S) or WS(S) base URL.
///
/// `http` maps to `ws` and `https` to `wss`; `path` is appended to the base
/// path.
pub fn websocket_url(base: &str, path: &str) -> Result<Url, SyncError> {
    let mut url = Url::parse(base)?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(SyncError::InvalidUrl(format!(
                "unsupported scheme `{other}` in {base}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|()| SyncError::InvalidUrl(format!("cannot use scheme {scheme} for {base}")))?;

    let suffix = path.trim_start_matches('/');
    if !suffix.is_empty() {
        let joined = format!("{}/{suffix}", url.path().trim_end_matches('/'));
        url.set_path(&joined);
    }
    Ok(url)
}

/// Attach the bearer token as the `token` query parameter.
pub fn with_token(url: &Url, token: &str) -> Url {
    let mut url = url.clone();
    url.query_pairs_mut().append_pair("token", token);
    url
}
