use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::ConnectionConfig;
use crate::connection::machine::ReconnectPolicy;
use crate::frame::Frame;
use crate::transport::{EventSink, Transport, TransportEvent, TransportHandle};

/// How a [`ScriptedTransport`] answers `open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptMode {
    /// Nothing happens until the test calls `emit`.
    Manual,
    /// Every open succeeds.
    Accept,
    /// Every open fails.
    Refuse,
}

struct OpenRecord {
    url: Url,
    sink: EventSink,
    outbound: Option<mpsc::Receiver<String>>,
}

/// In-memory transport for driving the connection manager without a network.
#[derive(Clone)]
pub struct ScriptedTransport {
    mode: ScriptMode,
    opens: Arc<Mutex<Vec<OpenRecord>>>,
}

impl ScriptedTransport {
    pub fn new(mode: ScriptMode) -> Self {
        Self {
            mode,
            opens: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn open_count(&self) -> usize {
        self.opens.lock().unwrap().len()
    }

    pub fn opened_urls(&self) -> Vec<Url> {
        self.opens
            .lock()
            .unwrap()
            .iter()
            .map(|o| o.url.clone())
            .collect()
    }

    /// Emit on the most recently opened connection.
    pub async fn emit(&self, event: TransportEvent) {
        let sink = self.opens.lock().unwrap().last().map(|o| o.sink.clone());
        if let Some(sink) = sink {
            sink.emit(event).await;
        }
    }

    /// Drop the writer side of the most recent connection, as a dead socket would.
    pub fn hang_up_writer(&self) {
        if let Some(open) = self.opens.lock().unwrap().last_mut() {
            open.outbound = None;
        }
    }

    /// Take every frame written so far, across all connections.
    pub fn drain_sent(&self) -> Vec<Frame> {
        let mut opens = self.opens.lock().unwrap();
        let mut frames = Vec::new();
        for outbound in opens.iter_mut().filter_map(|o| o.outbound.as_mut()) {
            while let Ok(text) = outbound.try_recv() {
                frames.push(Frame::parse(&text).unwrap());
            }
        }
        frames
    }
}

impl Transport for ScriptedTransport {
    fn open(&self, url: Url, sink: EventSink) -> TransportHandle {
        let (outbound_tx, outbound_rx) = mpsc::channel(64);

        let scripted = match self.mode {
            ScriptMode::Manual => None,
            ScriptMode::Accept => Some(TransportEvent::Opened),
            ScriptMode::Refuse => Some(TransportEvent::Error("connection refused".into())),
        };
        if let Some(event) = scripted {
            let sink = sink.clone();
            tokio::spawn(async move {
                sink.emit(event).await;
            });
        }

        self.opens.lock().unwrap().push(OpenRecord {
            url,
            sink,
            outbound: Some(outbound_rx),
        });
        TransportHandle::new(outbound_tx, CancellationToken::new())
    }
}

/// Connection config for tests: no jitter, production intervals.
pub fn test_config(max_attempts: u32) -> ConnectionConfig {
    ConnectionConfig {
        url: Url::parse("ws://localhost:8080/ws").unwrap(),
        reconnect: ReconnectPolicy {
            auto_reconnect: true,
            max_attempts,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            jitter: false,
        },
        heartbeat_interval: Duration::from_millis(30_000),
        connect_timeout: Duration::from_millis(10_000),
    }
}
