//! Bounded message channels between a session and its supervisor
//!
//! The session never blocks on the upstream side: events that cannot be
//! queued are dropped with a debug log. The downstream side supports the two
//! access patterns the session needs, a non-blocking poll once per loop
//! iteration and an await for the next message during back-off sleeps and
//! the terminate handshake.

use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tracing::debug;

use crate::command::{ControlMessage, SessionEvent};

/// Default capacity for both directions
pub const DEFAULT_CAPACITY: usize = 256;

/// Create the supervisor -> session channel
pub fn mailbox(capacity: usize) -> (ControlSender, Mailbox) {
    let (tx, rx) = mpsc::channel(capacity);
    (ControlSender { tx }, Mailbox { rx })
}

/// Create the session -> supervisor channel
pub fn events(capacity: usize) -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (EventSender { tx }, EventReceiver { rx })
}

/// Result of a non-blocking mailbox poll
#[derive(Debug)]
pub enum Polled {
    Message(ControlMessage),
    Empty,
    /// Every sender is gone; the supervisor has gone away
    Closed,
}

/// Supervisor side of the control channel
#[derive(Clone)]
pub struct ControlSender {
    tx: mpsc::Sender<ControlMessage>,
}

impl ControlSender {
    /// Queue a message, waiting for capacity
    pub async fn send(&self, msg: ControlMessage) -> anyhow::Result<()> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| anyhow::anyhow!("session mailbox closed"))
    }

    /// Queue a message without waiting
    pub fn try_send(&self, msg: ControlMessage) -> anyhow::Result<()> {
        self.tx.try_send(msg).map_err(|e| match e {
            TrySendError::Full(_) => anyhow::anyhow!("session mailbox full"),
            TrySendError::Closed(_) => anyhow::anyhow!("session mailbox closed"),
        })
    }
}

/// Session side of the control channel
pub struct Mailbox {
    rx: mpsc::Receiver<ControlMessage>,
}

impl Mailbox {
    /// Non-blocking poll
    pub fn try_next(&mut self) -> Polled {
        match self.rx.try_recv() {
            Ok(msg) => Polled::Message(msg),
            Err(TryRecvError::Empty) => Polled::Empty,
            Err(TryRecvError::Disconnected) => Polled::Closed,
        }
    }

    /// Wait for the next message; `None` once every sender is gone
    pub async fn next(&mut self) -> Option<ControlMessage> {
        self.rx.recv().await
    }
}

/// Session side of the event channel
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<SessionEvent>,
}

impl EventSender {
    /// Send an event without blocking the caller
    pub fn emit(&self, event: SessionEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                debug!(?event, "Event channel full, dropping event");
            }
            Err(TrySendError::Closed(event)) => {
                debug!(?event, "Event channel closed, dropping event");
            }
        }
    }

    /// Report a recording that could not be moved to the archive
    pub fn file_move_failed(&self, camera: &str, target: &str) {
        self.emit(SessionEvent::FileMoveFailed {
            camera: camera.to_string(),
            target: target.to_string(),
        });
    }
}

/// Supervisor side of the event channel
pub struct EventReceiver {
    rx: mpsc::Receiver<SessionEvent>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        self.rx.try_recv().ok()
    }

    /// Drain everything currently queued
    pub fn drain(&mut self) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            out.push(event);
        }
        out
    }
}
