//! # Summary
//!
//! This module defines the handles a participant uses to reach the rest of
//! the group. Every participant, including the local one, is addressed
//! through the same `Peer` interface: the local participant is reached
//! through a `Loopback`, every other participant through a `Remote` that
//! hands messages to the transport.
//!
//! Sends are fire-and-forget. Delivery, retries and connection lifecycle
//! belong to whoever drains the other end. A `Remote` buffers a bounded
//! number of messages and drops the rest while its transport is stalled;
//! the protocol already tolerates lost messages.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::message::{self, Message};
use crate::types::ParticipantId;

/// Capability set for talking to one participant.
pub trait Peer: Send + Sync {
    fn id(&self) -> ParticipantId;

    fn send(&self, message: Message);

    fn send_next_ballot(&self, message: message::NextBallot) {
        self.send(Message::NextBallot(message))
    }

    fn send_last_vote(&self, message: message::LastVote) {
        self.send(Message::LastVote(message))
    }

    fn send_begin_ballot(&self, message: message::BeginBallot) {
        self.send(Message::BeginBallot(message))
    }

    fn send_pending_vote(&self, message: message::PendingVote) {
        self.send(Message::PendingVote(message))
    }

    fn send_voted(&self, message: message::Voted) {
        self.send(Message::Voted(message))
    }

    fn send_success(&self, message: message::Success) {
        self.send(Message::Success(message))
    }

    fn send_nack(&self, message: message::Nack) {
        self.send(Message::Nack(message))
    }
}

/// Messages a participant addressed to itself, waiting to be handled.
#[derive(Clone, Default)]
pub struct Inbox(Arc<Mutex<VecDeque<Message>>>);

impl Inbox {
    pub fn push(&self, message: Message) {
        self.0.lock().push_back(message);
    }

    pub fn pop(&self) -> Option<Message> {
        self.0.lock().pop_front()
    }
}

/// Handle for the local participant.
pub struct Loopback {
    id: ParticipantId,
    inbox: Inbox,
}

impl Loopback {
    pub fn new(id: ParticipantId, inbox: Inbox) -> Self {
        Loopback { id, inbox }
    }
}

impl Peer for Loopback {
    fn id(&self) -> ParticipantId {
        self.id
    }

    fn send(&self, message: Message) {
        trace!("[{}] looping back {:?}", self.id, message);
        self.inbox.push(message);
    }
}

/// Handle for a participant in another process.
pub struct Remote {
    id: ParticipantId,
    tx: mpsc::Sender<Message>,
}

impl Remote {
    /// Creates a handle for participant `id`, along with the receiving end
    /// the transport drains. At most `capacity` messages wait for delivery.
    pub fn new(id: ParticipantId, capacity: usize) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Remote { id, tx }, rx)
    }
}

impl Peer for Remote {
    fn id(&self) -> ParticipantId {
        self.id
    }

    fn send(&self, message: Message) {
        trace!("queueing {:?} for {}", message, self.id);
        match self.tx.try_send(message) {
        | Ok(()) => (),
        | Err(mpsc::error::TrySendError::Full(message)) => {
            warn!("dropping {} for peer {}: queue is full", message.name(), self.id);
        }
        // Transport may have shut down
        | Err(mpsc::error::TrySendError::Closed(message)) => {
            debug!("dropping {} for disconnected peer {}", message.name(), self.id);
        }
        }
    }
}

/// Where the outcome of one client request goes. Consumed on delivery, so
/// each request is answered at most once.
pub trait Respond: Send {
    fn deliver(self: Box<Self>, response: message::ClientResponse);
}

impl Respond for oneshot::Sender<message::ClientResponse> {
    fn deliver(self: Box<Self>, response: message::ClientResponse) {
        // Client may have hung up
        (*self).send(response).ok();
    }
}

impl Respond for mpsc::UnboundedSender<message::ClientResponse> {
    fn deliver(self: Box<Self>, response: message::ClientResponse) {
        self.send(response).ok();
    }
}
