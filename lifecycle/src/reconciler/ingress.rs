use super::Outcome;
use crate::types::SessionId;
use futures::{
    channel::{mpsc, oneshot},
    SinkExt,
};

/// Message types that can be sent to the `Mailbox`
pub enum Message {
    /// Sync the session on every interval.
    Track { session: SessionId },

    /// Stop syncing the session on an interval.
    Untrack { session: SessionId },

    /// Sync the session now, regardless of when it was last synced.
    Sync {
        session: SessionId,
        responder: oneshot::Sender<Outcome>,
    },
}

/// Ingress mailbox for [Engine](super::Engine).
#[derive(Clone)]
pub struct Mailbox {
    sender: mpsc::Sender<Message>,
}

impl Mailbox {
    pub(super) fn new(sender: mpsc::Sender<Message>) -> Self {
        Self { sender }
    }

    /// Start syncing a session on every interval.
    pub async fn track(&mut self, session: SessionId) {
        self.sender
            .send(Message::Track { session })
            .await
            .expect("mailbox closed");
    }

    /// Stop syncing a session on an interval.
    pub async fn untrack(&mut self, session: SessionId) {
        self.sender
            .send(Message::Untrack { session })
            .await
            .expect("mailbox closed");
    }

    /// Sync a session now.
    ///
    /// The receiver resolves with the [Outcome] once the sync completes.
    pub async fn sync(&mut self, session: SessionId) -> oneshot::Receiver<Outcome> {
        let (responder, receiver) = oneshot::channel();
        self.sender
            .send(Message::Sync { session, responder })
            .await
            .expect("mailbox closed");
        receiver
    }
}
