//! Websocket transport for the Gemini Live bidirectional endpoint.
//!
//! `connect` performs the websocket handshake, sends the `setup` message,
//! then splits the socket into a writer task (fed by an unbounded channel,
//! so `send` never blocks the capture thread) and a reader task that parses
//! server JSON and forwards it as [`TransportEvent`]s.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::{
    LiveConnector, OutboundMessage, ServerMessage, SetupRequest, TransportEvent, TransportLink,
    TransportSender,
};
use crate::error::{NovaError, Result};

pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

#[derive(Debug, Clone)]
pub struct WsConnector {
    endpoint: String,
}

impl WsConnector {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    fn url(&self, credential: &str) -> String {
        let sep = if self.endpoint.contains('?') { '&' } else { '?' };
        format!("{}{sep}key={credential}", self.endpoint)
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(DEFAULT_ENDPOINT)
    }
}

enum Outgoing {
    Json(String),
    Close,
}

#[async_trait]
impl LiveConnector for WsConnector {
    async fn connect(&self, credential: &str, setup: &SetupRequest) -> Result<TransportLink> {
        info!(endpoint = %self.endpoint, model = %setup.model, "opening live websocket");
        let (socket, _response) = connect_async(self.url(credential))
            .await
            .map_err(|e| NovaError::Transport(format!("connect: {e}")))?;
        let (mut write, mut read) = socket.split();

        write
            .send(Message::Text(setup.to_wire().to_string()))
            .await
            .map_err(|e| NovaError::Transport(format!("setup: {e}")))?;

        let closed = Arc::new(AtomicBool::new(false));
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outgoing>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<TransportEvent>();

        let writer_closed = Arc::clone(&closed);
        tokio::spawn(async move {
            while let Some(outgoing) = out_rx.recv().await {
                match outgoing {
                    Outgoing::Json(text) => {
                        if let Err(e) = write.send(Message::Text(text)).await {
                            warn!("live websocket write failed: {e}");
                            break;
                        }
                    }
                    Outgoing::Close => {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            writer_closed.store(true, Ordering::SeqCst);
            let _ = write.close().await;
            debug!("live websocket writer finished");
        });

        let reader_closed = Arc::clone(&closed);
        tokio::spawn(async move {
            let end = loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => forward(&event_tx, &text),
                    Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                        Ok(text) => forward(&event_tx, text),
                        Err(_) => warn!(len = bytes.len(), "non-UTF-8 binary frame dropped"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break TransportEvent::Closed(frame.map(|f| f.reason.to_string()));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break TransportEvent::Error(e.to_string()),
                    None => break TransportEvent::Closed(None),
                }
            };
            reader_closed.store(true, Ordering::SeqCst);
            let _ = event_tx.send(end);
            debug!("live websocket reader finished");
        });

        Ok(TransportLink {
            sender: Arc::new(WsSender { out_tx, closed }),
            events: event_rx,
        })
    }
}

fn forward(event_tx: &mpsc::UnboundedSender<TransportEvent>, text: &str) {
    match ServerMessage::from_wire(text) {
        Ok(message) => {
            if message.is_setup_complete() {
                debug!("live session setup complete");
            }
            let _ = event_tx.send(TransportEvent::Message(message));
        }
        Err(e) => warn!("dropping unparseable server frame: {e}"),
    }
}

struct WsSender {
    out_tx: mpsc::UnboundedSender<Outgoing>,
    closed: Arc<AtomicBool>,
}

impl TransportSender for WsSender {
    fn send(&self, message: OutboundMessage) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NovaError::Transport("session closed".into()));
        }
        self.out_tx
            .send(Outgoing::Json(message.to_wire().to_string()))
            .map_err(|_| NovaError::Transport("session closed".into()))
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.out_tx.send(Outgoing::Close);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
