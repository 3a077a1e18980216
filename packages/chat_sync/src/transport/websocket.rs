//! tokio-tungstenite transport.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use super::{EventSink, Transport, TransportEvent, TransportHandle};

const OUTBOUND_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    connect_timeout: Duration,
}

impl WebSocketTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl Transport for WebSocketTransport {
    fn open(&self, url: Url, sink: EventSink) -> TransportHandle {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let cancel = CancellationToken::new();
        tokio::spawn(run_socket(
            url,
            sink,
            outbound_rx,
            cancel.clone(),
            self.connect_timeout,
        ));
        TransportHandle::new(outbound_tx, cancel)
    }
}

async fn run_socket(
    url: Url,
    sink: EventSink,
    mut outbound: mpsc::Receiver<String>,
    cancel: CancellationToken,
    connect_timeout: Duration,
) {
    let generation = sink.generation();
    let handshake = tokio::time::timeout(
        connect_timeout,
        tokio_tungstenite::connect_async(url.as_str()),
    );

    let ws_stream = tokio::select! {
        _ = cancel.cancelled() => {
            debug!(generation, "handshake abandoned");
            return;
        }
        result = handshake => match result {
            Ok(Ok((ws_stream, _))) => ws_stream,
            Ok(Err(e)) => {
                sink.emit(TransportEvent::Error(e.to_string())).await;
                return;
            }
            Err(_) => {
                sink.emit(TransportEvent::Error(format!(
                    "handshake timed out after {}ms",
                    connect_timeout.as_millis()
                )))
                .await;
                return;
            }
        },
    };

    if !sink.emit(TransportEvent::Opened).await {
        return;
    }

    let (mut ws_write, mut ws_read) = ws_stream.split();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = ws_write.close().await;
                debug!(generation, "socket closed by owner");
                break;
            }

            Some(text) = outbound.recv() => {
                if let Err(e) = ws_write.send(tungstenite::Message::Text(text.into())).await {
                    warn!(generation, error = %e, "websocket send failed");
                    sink.emit(TransportEvent::Error(e.to_string())).await;
                    break;
                }
            }

            msg = ws_read.next() => {
                match msg {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        if !sink.emit(TransportEvent::Message(text.as_str().to_owned())).await {
                            break;
                        }
                    }
                    Some(Ok(tungstenite::Message::Close(frame))) => {
                        let (code, reason) = match frame {
                            Some(f) => (Some(u16::from(f.code)), f.reason.as_str().to_owned()),
                            None => (None, String::new()),
                        };
                        sink.emit(TransportEvent::Closed { code, reason }).await;
                        break;
                    }
                    // Control frames are answered by tungstenite itself
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        sink.emit(TransportEvent::Error(e.to_string())).await;
                        break;
                    }
                    None => {
                        sink.emit(TransportEvent::Closed {
                            code: None,
                            reason: "stream ended".to_string(),
                        })
                        .await;
                        break;
                    }
                }
            }
        }
    }
}
