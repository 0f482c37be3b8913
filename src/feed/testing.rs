//! Scripted transport for driving the feed in tests.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::transport::{ControlMessage, TickConnection, TickTransport};
use crate::error::PipelineError;

/// Test side of a scripted connection.
pub struct RemoteEnd {
    /// Control messages the manager sent.
    pub sent: mpsc::UnboundedReceiver<ControlMessage>,
    /// Push payloads (or errors) to the manager. Dropping closes the connection.
    pub inbound: mpsc::UnboundedSender<Result<String, PipelineError>>,
}

pub struct ScriptedConnection {
    sent: mpsc::UnboundedSender<ControlMessage>,
    inbound: mpsc::UnboundedReceiver<Result<String, PipelineError>>,
}

impl ScriptedConnection {
    pub fn pair() -> (Self, RemoteEnd) {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (
            Self {
                sent: sent_tx,
                inbound: in_rx,
            },
            RemoteEnd {
                sent: sent_rx,
                inbound: in_tx,
            },
        )
    }
}

#[async_trait]
impl TickConnection for ScriptedConnection {
    async fn send(&mut self, message: &ControlMessage) -> Result<(), PipelineError> {
        self.sent
            .send(message.clone())
            .map_err(|_| PipelineError::Connection("remote end dropped".into()))
    }

    async fn recv(&mut self) -> Option<Result<String, PipelineError>> {
        self.inbound.recv().await
    }
}

/// Hands out queued connect results in order, then fails every attempt.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    script: Arc<Mutex<VecDeque<Result<ScriptedConnection, PipelineError>>>>,
    connects: Arc<Mutex<u32>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful connect and return its test-side handle.
    pub fn push_connection(&self) -> RemoteEnd {
        let (conn, remote) = ScriptedConnection::pair();
        self.script.lock().push_back(Ok(conn));
        remote
    }

    pub fn push_failure(&self, reason: &str) {
        self.script
            .lock()
            .push_back(Err(PipelineError::Connection(reason.to_string())));
    }

    pub fn connect_calls(&self) -> u32 {
        *self.connects.lock()
    }
}

#[async_trait]
impl TickTransport for ScriptedTransport {
    async fn connect(&self) -> Result<Box<dyn TickConnection>, PipelineError> {
        *self.connects.lock() += 1;
        let next = self.script.lock().pop_front();
        match next {
            Some(Ok(conn)) => Ok(Box::new(conn)),
            Some(Err(e)) => Err(e),
            None => Err(PipelineError::Connection("connection refused".into())),
        }
    }
}
