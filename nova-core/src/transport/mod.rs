//! Duplex transport to the hosted live model.
//!
//! The engine only sees these traits. A connector opens one session and
//! hands back a [`TransportLink`]: a sender for outbound messages plus an
//! ordered receiver of [`TransportEvent`]s. The receiver yields
//! `Closed` (or `Error`) exactly once at the end and then `None`.

pub mod protocol;
pub mod stub;
#[cfg(feature = "ws")]
pub mod ws;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

pub use protocol::{LiveEvent, MediaBlob, OutboundMessage, ServerMessage, SetupRequest};

/// Inbound side of an open session.
#[derive(Debug)]
pub enum TransportEvent {
    Message(ServerMessage),
    /// Connection failed mid-session. No further messages follow.
    Error(String),
    /// Remote (or local) close, with an optional reason.
    Closed(Option<String>),
}

/// Outbound side of an open session. Cheap to share across threads.
pub trait TransportSender: Send + Sync + 'static {
    /// Queue a message without waiting for acknowledgement.
    ///
    /// # Errors
    /// `NovaError::Transport` once the connection is closed.
    fn send(&self, message: OutboundMessage) -> Result<()>;

    /// Close the connection. Idempotent.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

pub struct TransportLink {
    pub sender: Arc<dyn TransportSender>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens live sessions.
#[async_trait]
pub trait LiveConnector: Send + Sync + 'static {
    /// # Errors
    /// `NovaError::Transport` when the connection cannot be established.
    async fn connect(&self, credential: &str, setup: &SetupRequest) -> Result<TransportLink>;
}
