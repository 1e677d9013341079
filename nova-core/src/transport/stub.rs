//! In-process scripted transport.
//!
//! `ScriptedConnector` stands in for the hosted model: the owner pushes
//! server messages into the open session and inspects what the engine sent.
//! Clones share one script, so a test keeps a clone after handing the
//! connector to the engine.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{
    LiveConnector, OutboundMessage, ServerMessage, SetupRequest, TransportEvent, TransportLink,
    TransportSender,
};
use crate::error::{NovaError, Result};

#[derive(Default)]
struct Script {
    connects: Vec<(String, SetupRequest)>,
    sent: Vec<OutboundMessage>,
    /// Events pushed before a session was open; delivered on connect.
    pending: VecDeque<TransportEvent>,
    events_tx: Option<mpsc::UnboundedSender<TransportEvent>>,
    closed: bool,
    local_closes: usize,
    fail_next_connect: Option<String>,
}

#[derive(Clone, Default)]
pub struct ScriptedConnector {
    script: Arc<Mutex<Script>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `connect` fail with a transport error.
    pub fn fail_next_connect(&self, reason: &str) {
        self.script.lock().fail_next_connect = Some(reason.to_owned());
    }

    /// Deliver a server message to the open session (or queue it until one opens).
    pub fn push(&self, message: ServerMessage) {
        self.deliver(TransportEvent::Message(message));
    }

    /// Remote close. The event stream ends after this.
    pub fn close_remote(&self, reason: Option<&str>) {
        self.finish(TransportEvent::Closed(reason.map(str::to_owned)));
    }

    /// Connection failure. The event stream ends after this.
    pub fn fail_remote(&self, reason: &str) {
        self.finish(TransportEvent::Error(reason.to_owned()));
    }

    pub fn connect_count(&self) -> usize {
        self.script.lock().connects.len()
    }

    /// Credential and open request of the latest `connect`.
    pub fn last_connect(&self) -> Option<(String, SetupRequest)> {
        self.script.lock().connects.last().cloned()
    }

    /// Every outbound message accepted so far, across sessions.
    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.script.lock().sent.clone()
    }

    pub fn sent_count(&self) -> usize {
        self.script.lock().sent.len()
    }

    pub fn is_closed(&self) -> bool {
        self.script.lock().closed
    }

    /// How many times the engine closed a session from its side.
    pub fn local_closes(&self) -> usize {
        self.script.lock().local_closes
    }

    fn deliver(&self, event: TransportEvent) {
        let mut script = self.script.lock();
        match &script.events_tx {
            Some(tx) if !script.closed => {
                let _ = tx.send(event);
            }
            _ => script.pending.push_back(event),
        }
    }

    fn finish(&self, event: TransportEvent) {
        let mut script = self.script.lock();
        script.closed = true;
        if let Some(tx) = script.events_tx.take() {
            let _ = tx.send(event);
        }
    }
}

#[async_trait]
impl LiveConnector for ScriptedConnector {
    async fn connect(&self, credential: &str, setup: &SetupRequest) -> Result<TransportLink> {
        let mut script = self.script.lock();
        script
            .connects
            .push((credential.to_owned(), setup.clone()));
        if let Some(reason) = script.fail_next_connect.take() {
            return Err(NovaError::Transport(reason));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        for event in script.pending.drain(..) {
            let _ = tx.send(event);
        }
        script.events_tx = Some(tx);
        script.closed = false;

        Ok(TransportLink {
            sender: Arc::new(ScriptedSender {
                script: Arc::clone(&self.script),
            }),
            events: rx,
        })
    }
}

struct ScriptedSender {
    script: Arc<Mutex<Script>>,
}

impl TransportSender for ScriptedSender {
    fn send(&self, message: OutboundMessage) -> Result<()> {
        let mut script = self.script.lock();
        if script.closed {
            return Err(NovaError::Transport("session closed".into()));
        }
        script.sent.push(message);
        Ok(())
    }

    fn close(&self) {
        let mut script = self.script.lock();
        if script.closed {
            return;
        }
        script.closed = true;
        script.local_closes += 1;
        if let Some(tx) = script.events_tx.take() {
            let _ = tx.send(TransportEvent::Closed(None));
        }
    }

    fn is_closed(&self) -> bool {
        self.script.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffering::frame::AudioFrame;

    fn setup() -> SetupRequest {
        SetupRequest::audio("m", "sys".into(), "Puck".into())
    }

    #[tokio::test]
    async fn queued_messages_arrive_after_connect_in_order() {
        let connector = ScriptedConnector::new();
        connector.push(ServerMessage::input_transcript("a"));
        connector.push(ServerMessage::turn_complete());

        let mut link = connector.connect("key", &setup()).await.unwrap();
        assert!(matches!(link.events.recv().await, Some(TransportEvent::Message(_))));
        match link.events.recv().await {
            Some(TransportEvent::Message(m)) => {
                assert_eq!(m.into_events(), vec![super::super::LiveEvent::TurnComplete])
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn remote_close_ends_stream_and_rejects_sends() {
        let connector = ScriptedConnector::new();
        let mut link = connector.connect("key", &setup()).await.unwrap();
        connector.close_remote(Some("bye"));

        assert!(matches!(
            link.events.recv().await,
            Some(TransportEvent::Closed(Some(ref r))) if r == "bye"
        ));
        assert!(link.events.recv().await.is_none());
        assert!(link
            .sender
            .send(OutboundMessage::audio(AudioFrame::from_f32(&[0.0])))
            .is_err());
    }

    #[tokio::test]
    async fn local_close_is_idempotent() {
        let connector = ScriptedConnector::new();
        let link = connector.connect("key", &setup()).await.unwrap();
        link.sender.close();
        link.sender.close();
        assert!(link.sender.is_closed());
        assert_eq!(connector.local_closes(), 1);
    }

    #[tokio::test]
    async fn failed_connect_is_recorded() {
        let connector = ScriptedConnector::new();
        connector.fail_next_connect("refused");
        assert!(matches!(
            connector.connect("key", &setup()).await,
            Err(NovaError::Transport(_))
        ));
        assert_eq!(connector.connect_count(), 1);
        assert!(connector.connect("key", &setup()).await.is_ok());
    }
}
